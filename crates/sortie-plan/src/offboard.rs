use std::time::Duration;

use serde::Deserialize;

/// Setpoint rate bounds. PX4 leaves OFFBOARD below the lower one.
pub const MIN_SETPOINT_HZ: f32 = 2.0;
pub const MAX_SETPOINT_HZ: f32 = 100.0;

/// Horizontal target in the local NED frame (metres north/east of the EKF origin).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct LocalPoint {
    pub x: f32,
    pub y: f32,
}

impl LocalPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OffboardCfg {
    pub targets: Vec<LocalPoint>,
    /// Altitude above the local origin, positive up.
    pub alt_m: f32,
    /// Per-axis distance at which a target counts as reached.
    pub tolerance_m: f32,
    pub setpoint_hz: f32,
    /// Setpoints streamed before arming; PX4 refuses OFFBOARD without a live stream.
    pub warmup_setpoints: u32,
    pub land_after: bool,
}

impl Default for OffboardCfg {
    fn default() -> Self {
        Self {
            targets: vec![LocalPoint::new(10.0, 10.0), LocalPoint::new(-10.0, -10.0)],
            alt_m: 5.0,
            tolerance_m: 0.25,
            setpoint_hz: 10.0,
            warmup_setpoints: 10,
            land_after: true,
        }
    }
}

impl OffboardCfg {
    pub fn setpoint_interval(&self) -> Duration {
        let hz = self.setpoint_hz.max(MIN_SETPOINT_HZ).min(MAX_SETPOINT_HZ);
        Duration::from_millis((1000.0 / hz).round() as u64)
    }

    pub fn reached(&self, target: LocalPoint, x: f32, y: f32) -> bool {
        (x - target.x).abs() <= self.tolerance_m && (y - target.y).abs() <= self.tolerance_m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reached_is_per_axis() {
        let cfg = OffboardCfg::default();
        let t = LocalPoint::new(10.0, 10.0);
        assert!(cfg.reached(t, 9.8, 10.2));
        assert!(!cfg.reached(t, 9.7, 10.0));
        assert!(!cfg.reached(t, 10.0, 10.3));
    }

    #[test]
    fn setpoint_rate_has_a_floor() {
        let mut cfg = OffboardCfg::default();
        assert_eq!(cfg.setpoint_interval(), Duration::from_millis(100));
        cfg.setpoint_hz = 0.1;
        assert_eq!(cfg.setpoint_interval(), Duration::from_millis(500));
    }

    #[test]
    fn setpoint_rate_has_a_ceiling() {
        let mut cfg = OffboardCfg::default();
        cfg.setpoint_hz = 5000.0;
        assert_eq!(cfg.setpoint_interval(), Duration::from_millis(10));
        cfg.setpoint_hz = f32::NAN;
        assert_eq!(cfg.setpoint_interval(), Duration::from_millis(500));
    }
}
