use crate::plan::MissionPlan;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat/2.0).sin().powi(2) + lat1.to_radians().cos()*lat2.to_radians().cos()*(dlon/2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0-a).sqrt());
    EARTH_RADIUS_M * c
}

/// Length of each leg between consecutive mission items.
pub fn leg_lengths_m(plan: &MissionPlan) -> Vec<f64> {
    plan.items
        .windows(2)
        .map(|w| haversine_m(w[0].lat, w[0].lon, w[1].lat, w[1].lon))
        .collect()
}

/// Furthest item from the first one.
pub fn max_radius_m(plan: &MissionPlan) -> f64 {
    let Some(first) = plan.items.first() else { return 0.0; };
    plan.items
        .iter()
        .map(|i| haversine_m(first.lat, first.lon, i.lat, i.lon))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::MissionCfg;

    #[test]
    fn one_degree_of_latitude() {
        let d = haversine_m(47.0, 8.0, 48.0, 8.0);
        assert!((d - 111_195.0).abs() < 50.0, "{}", d);
    }

    #[test]
    fn default_mission_legs_are_short() {
        let plan = MissionCfg::default().to_plan();
        let legs = leg_lengths_m(&plan);
        assert_eq!(legs.len(), 2);
        // ~42 m west, then ~23 m south
        assert!(legs[0] > 35.0 && legs[0] < 50.0, "{:?}", legs);
        assert!(legs[1] > 18.0 && legs[1] < 30.0, "{:?}", legs);
        assert!(max_radius_m(&plan) < 60.0);
    }
}
