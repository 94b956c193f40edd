use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_ALT_M: f32 = 10.0;
pub const DEFAULT_SPEED_M_S: f32 = 25.0;
pub const DEFAULT_ACCEPTANCE_RADIUS_M: f32 = 0.5;

/// Camera command attached to a mission item, triggered once the waypoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraAction {
    #[default]
    None,
    TakePhoto,
    StartPhotoInterval,
    StopPhotoInterval,
    StartVideo,
    StopVideo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissionItem {
    pub lat: f64,
    pub lon: f64,
    /// Altitude above the takeoff point.
    pub rel_alt_m: f32,
    pub speed_m_s: Option<f32>,
    pub fly_through: bool,
    pub camera_action: CameraAction,
    pub photo_interval_s: Option<f32>,
    pub acceptance_radius_m: f32,
    pub yaw_deg: Option<f32>,
    pub loiter_time_s: Option<f32>,
}

impl MissionItem {
    pub fn waypoint(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            rel_alt_m: DEFAULT_ALT_M,
            speed_m_s: Some(DEFAULT_SPEED_M_S),
            fly_through: true,
            camera_action: CameraAction::None,
            photo_interval_s: None,
            acceptance_radius_m: DEFAULT_ACCEPTANCE_RADIUS_M,
            yaw_deg: None,
            loiter_time_s: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissionPlan {
    pub items: Vec<MissionItem>,
}

impl MissionPlan {
    pub fn new(items: Vec<MissionItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One waypoint in a mission file. Unset fields fall back to the mission-wide defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct WaypointCfg {
    pub lat: f64,
    pub lon: f64,
    pub rel_alt_m: Option<f32>,
    pub speed_m_s: Option<f32>,
    pub fly_through: Option<bool>,
    #[serde(default)]
    pub camera_action: CameraAction,
    pub photo_interval_s: Option<f32>,
    pub acceptance_radius_m: Option<f32>,
    pub yaw_deg: Option<f32>,
    pub loiter_time_s: Option<f32>,
}

impl WaypointCfg {
    pub fn at(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            rel_alt_m: None,
            speed_m_s: None,
            fly_through: None,
            camera_action: CameraAction::None,
            photo_interval_s: None,
            acceptance_radius_m: None,
            yaw_deg: None,
            loiter_time_s: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MissionCfg {
    pub default_alt_m: f32,
    pub default_speed_m_s: f32,
    pub fly_through: bool,
    pub acceptance_radius_m: f32,
    /// Append a return-to-launch item after the last waypoint.
    pub rtl_after_mission: bool,
    pub waypoints: Vec<WaypointCfg>,
}

impl Default for MissionCfg {
    fn default() -> Self {
        // PX4 SITL default home is at 47.3977N 8.5456E.
        Self {
            default_alt_m: DEFAULT_ALT_M,
            default_speed_m_s: DEFAULT_SPEED_M_S,
            fly_through: true,
            acceptance_radius_m: DEFAULT_ACCEPTANCE_RADIUS_M,
            rtl_after_mission: true,
            waypoints: vec![
                WaypointCfg::at(47.398039859999997, 8.5455725400000002),
                WaypointCfg::at(47.398036222362471, 8.5450146439425509),
                WaypointCfg::at(47.397825620791885, 8.5450092830163271),
            ],
        }
    }
}

impl MissionCfg {
    pub fn to_plan(&self) -> MissionPlan {
        let items = self
            .waypoints
            .iter()
            .map(|wp| MissionItem {
                lat: wp.lat,
                lon: wp.lon,
                rel_alt_m: wp.rel_alt_m.unwrap_or(self.default_alt_m),
                speed_m_s: Some(wp.speed_m_s.unwrap_or(self.default_speed_m_s)),
                fly_through: wp.fly_through.unwrap_or(self.fly_through),
                camera_action: wp.camera_action,
                photo_interval_s: wp.photo_interval_s,
                acceptance_radius_m: wp.acceptance_radius_m.unwrap_or(self.acceptance_radius_m),
                yaw_deg: wp.yaw_deg,
                loiter_time_s: wp.loiter_time_s,
            })
            .collect();
        MissionPlan { items }
    }
}

/// Load a standalone mission file (same keys as the `[mission]` config section).
pub fn load_mission_file(path: &str) -> Result<MissionCfg> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read mission file {}", path))?;
    toml::from_str(&s).with_context(|| format!("parse mission file {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mission_is_three_sitl_waypoints() {
        let plan = MissionCfg::default().to_plan();
        assert_eq!(plan.len(), 3);
        for item in &plan.items {
            assert_eq!(item.rel_alt_m, DEFAULT_ALT_M);
            assert_eq!(item.speed_m_s, Some(DEFAULT_SPEED_M_S));
            assert!(item.fly_through);
            assert_eq!(item.camera_action, CameraAction::None);
            assert_eq!(item.acceptance_radius_m, DEFAULT_ACCEPTANCE_RADIUS_M);
        }
        assert!((plan.items[0].lat - 47.39804).abs() < 1e-4);
    }

    #[test]
    fn waypoint_fields_override_defaults() {
        let cfg: MissionCfg = toml::from_str(
            r#"
            default_alt_m = 15.0
            rtl_after_mission = false

            [[waypoints]]
            lat = 47.0
            lon = 8.0

            [[waypoints]]
            lat = 47.001
            lon = 8.001
            rel_alt_m = 20.0
            fly_through = false
            camera_action = "take_photo"
            "#,
        )
        .unwrap();

        assert!(!cfg.rtl_after_mission);
        let plan = cfg.to_plan();
        assert_eq!(plan.items[0].rel_alt_m, 15.0);
        assert_eq!(plan.items[0].speed_m_s, Some(DEFAULT_SPEED_M_S));
        assert_eq!(plan.items[1].rel_alt_m, 20.0);
        assert!(!plan.items[1].fly_through);
        assert_eq!(plan.items[1].camera_action, CameraAction::TakePhoto);
    }

    #[test]
    fn empty_file_gives_default_mission() {
        let cfg: MissionCfg = toml::from_str("").unwrap();
        assert_eq!(cfg.waypoints.len(), 3);
        assert!(cfg.rtl_after_mission);
    }
}
