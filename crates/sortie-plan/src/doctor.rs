use anyhow::Result;
use serde::Deserialize;

use crate::geo;
use crate::offboard::{OffboardCfg, MAX_SETPOINT_HZ, MIN_SETPOINT_HZ};
use crate::plan::{CameraAction, MissionPlan};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanLimits {
    pub max_alt_m: f32,
    pub max_speed_m_s: f32,
    pub max_leg_m: f64,
    pub max_radius_m: f64,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self { max_alt_m: 120.0, max_speed_m_s: 30.0, max_leg_m: 2_000.0, max_radius_m: 5_000.0 }
    }
}

pub fn check_plan(plan: &MissionPlan, limits: &PlanLimits) -> Result<()> {
    anyhow::ensure!(!plan.is_empty(), "mission has no waypoints");
    anyhow::ensure!(plan.len() < u16::MAX as usize / 4, "mission has too many waypoints");

    for (i, item) in plan.items.iter().enumerate() {
        anyhow::ensure!(item.lat.abs() <= 90.0 && item.lon.abs() <= 180.0, "waypoint {}: coordinates invalid", i);
        anyhow::ensure!(item.rel_alt_m > 0.0 && item.rel_alt_m <= limits.max_alt_m,
            "waypoint {}: rel_alt_m {} outside (0, {}]", i, item.rel_alt_m, limits.max_alt_m);
        if let Some(speed) = item.speed_m_s {
            anyhow::ensure!(speed > 0.0 && speed <= limits.max_speed_m_s,
                "waypoint {}: speed {} outside (0, {}]", i, speed, limits.max_speed_m_s);
        }
        anyhow::ensure!(item.acceptance_radius_m > 0.0, "waypoint {}: acceptance radius must be > 0", i);
        if item.camera_action == CameraAction::StartPhotoInterval {
            anyhow::ensure!(item.photo_interval_s.map(|s| s > 0.0).unwrap_or(false),
                "waypoint {}: start_photo_interval needs photo_interval_s > 0", i);
        }
    }

    for (i, leg) in geo::leg_lengths_m(plan).iter().enumerate() {
        anyhow::ensure!(*leg <= limits.max_leg_m, "leg {}->{} is {}m (max {}m)", i, i + 1, *leg as i64, limits.max_leg_m);
    }
    let radius = geo::max_radius_m(plan);
    anyhow::ensure!(radius <= limits.max_radius_m, "mission spans {}m from first waypoint (max {}m)", radius as i64, limits.max_radius_m);
    Ok(())
}

pub fn check_takeoff(alt_m: f32, tolerance_m: f32, limits: &PlanLimits) -> Result<()> {
    anyhow::ensure!(alt_m > 0.0 && alt_m <= limits.max_alt_m, "takeoff altitude {} outside (0, {}]", alt_m, limits.max_alt_m);
    anyhow::ensure!(tolerance_m > 0.0 && tolerance_m < alt_m, "altitude tolerance must be in (0, takeoff altitude)");
    Ok(())
}

pub fn check_offboard(cfg: &OffboardCfg, limits: &PlanLimits) -> Result<()> {
    anyhow::ensure!(!cfg.targets.is_empty(), "offboard.targets is empty");
    anyhow::ensure!(cfg.alt_m > 0.0 && cfg.alt_m <= limits.max_alt_m, "offboard.alt_m outside (0, {}]", limits.max_alt_m);
    anyhow::ensure!(cfg.tolerance_m > 0.0, "offboard.tolerance_m must be > 0");
    anyhow::ensure!((MIN_SETPOINT_HZ..=MAX_SETPOINT_HZ).contains(&cfg.setpoint_hz),
        "offboard.setpoint_hz must be in [{}, {}] (PX4 drops OFFBOARD below {}Hz)", MIN_SETPOINT_HZ, MAX_SETPOINT_HZ, MIN_SETPOINT_HZ);
    for t in &cfg.targets {
        let r = (t.x * t.x + t.y * t.y).sqrt() as f64;
        anyhow::ensure!(r <= limits.max_radius_m, "offboard target ({}, {}) beyond max radius", t.x, t.y);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{MissionCfg, MissionItem};

    #[test]
    fn default_plan_passes() {
        let limits = PlanLimits::default();
        check_plan(&MissionCfg::default().to_plan(), &limits).unwrap();
        check_takeoff(10.0, 1.0, &limits).unwrap();
        check_offboard(&OffboardCfg::default(), &limits).unwrap();
    }

    #[test]
    fn rejects_empty_and_out_of_range() {
        let limits = PlanLimits::default();
        assert!(check_plan(&MissionPlan::default(), &limits).is_err());

        let mut item = MissionItem::waypoint(47.0, 8.0);
        item.rel_alt_m = 500.0;
        assert!(check_plan(&MissionPlan::new(vec![item]), &limits).is_err());

        let mut item = MissionItem::waypoint(47.0, 8.0);
        item.speed_m_s = Some(0.0);
        assert!(check_plan(&MissionPlan::new(vec![item]), &limits).is_err());

        let far = vec![MissionItem::waypoint(47.0, 8.0), MissionItem::waypoint(47.5, 8.0)];
        assert!(check_plan(&MissionPlan::new(far), &limits).is_err());
    }

    #[test]
    fn photo_interval_needs_a_period() {
        let mut item = MissionItem::waypoint(47.0, 8.0);
        item.camera_action = CameraAction::StartPhotoInterval;
        let plan = MissionPlan::new(vec![item.clone()]);
        assert!(check_plan(&plan, &PlanLimits::default()).is_err());

        item.photo_interval_s = Some(2.0);
        check_plan(&MissionPlan::new(vec![item]), &PlanLimits::default()).unwrap();
    }

    #[test]
    fn offboard_rate_is_bounded() {
        let limits = PlanLimits::default();
        let mut cfg = OffboardCfg::default();
        for hz in [1.0, 5000.0, f32::NAN] {
            cfg.setpoint_hz = hz;
            assert!(check_offboard(&cfg, &limits).is_err(), "{}", hz);
        }
        cfg.setpoint_hz = 50.0;
        check_offboard(&cfg, &limits).unwrap();
    }

    #[test]
    fn takeoff_tolerance_must_be_smaller_than_altitude() {
        assert!(check_takeoff(1.0, 1.0, &PlanLimits::default()).is_err());
        assert!(check_takeoff(0.0, 0.5, &PlanLimits::default()).is_err());
    }
}
