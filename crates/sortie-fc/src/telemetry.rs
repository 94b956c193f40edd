use std::time::{Duration, Instant};

use mavlink::common::{
    GpsFixType, MavLandedState, MavMessage, MavModeFlag, MavState, MavSysStatusSensor, SYS_STATUS_DATA,
};
use tokio::sync::watch;

use crate::action::ActionError;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub abs_alt_m: f32,
    pub rel_alt_m: f32,
}

/// Local NED position relative to the EKF origin.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocalPosition {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl LocalPosition {
    pub fn alt_m(&self) -> f32 {
        -self.z
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatteryStatus {
    pub voltage: Option<f32>,      // Volts
    pub current: Option<f32>,      // Amps
    pub remaining: Option<u8>,     // Percent 0-100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Health {
    pub is_armable: bool,
    pub is_global_position_ok: bool,
}

/// Latest view of the vehicle, folded from the incoming message stream.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub position: Option<Position>,
    pub local_position: Option<LocalPosition>,
    pub armed: bool,
    pub in_air: Option<bool>,
    pub landed_state: Option<MavLandedState>,
    pub system_status: Option<MavState>,
    pub gps_fix: u8,
    pub satellites: u8,
    /// Pre-arm check result when the autopilot reports one in SYS_STATUS.
    pub prearm_ok: Option<bool>,
    pub battery: BatteryStatus,
    pub mission_seq: Option<u16>,
    pub mission_reached: Option<u16>,
    pub last_heartbeat: Option<Instant>,
    pub heartbeats: u64,
    pub last_status_text: Option<String>,
}

impl Telemetry {
    pub fn apply(&mut self, msg: &MavMessage) {
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                self.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                self.system_status = Some(hb.system_status);
                self.last_heartbeat = Some(Instant::now());
                self.heartbeats += 1;
            }
            MavMessage::GLOBAL_POSITION_INT(p) => {
                self.position = Some(Position {
                    lat: p.lat as f64 / 1e7,
                    lon: p.lon as f64 / 1e7,
                    abs_alt_m: p.alt as f32 / 1000.0,
                    rel_alt_m: p.relative_alt as f32 / 1000.0,
                });
            }
            MavMessage::LOCAL_POSITION_NED(p) => {
                self.local_position = Some(LocalPosition { x: p.x, y: p.y, z: p.z });
            }
            MavMessage::EXTENDED_SYS_STATE(s) => {
                self.landed_state = Some(s.landed_state);
                self.in_air = match s.landed_state {
                    MavLandedState::MAV_LANDED_STATE_ON_GROUND => Some(false),
                    MavLandedState::MAV_LANDED_STATE_IN_AIR
                    | MavLandedState::MAV_LANDED_STATE_TAKEOFF
                    | MavLandedState::MAV_LANDED_STATE_LANDING => Some(true),
                    _ => None,
                };
            }
            MavMessage::GPS_RAW_INT(g) => {
                self.gps_fix = g.fix_type as u8;
                self.satellites = g.satellites_visible;
            }
            MavMessage::SYS_STATUS(status) => {
                self.update_battery(status);
                let prearm = MavSysStatusSensor::MAV_SYS_STATUS_PREARM_CHECK;
                if status.onboard_control_sensors_present.contains(prearm) {
                    self.prearm_ok = Some(status.onboard_control_sensors_health.contains(prearm));
                }
            }
            MavMessage::MISSION_CURRENT(m) => self.mission_seq = Some(m.seq),
            MavMessage::MISSION_ITEM_REACHED(m) => self.mission_reached = Some(m.seq),
            MavMessage::STATUSTEXT(t) => {
                let text: String = t.text.iter().take_while(|&&c| c != 0).map(|&c| c as char).collect();
                self.last_status_text = Some(text);
            }
            _ => {}
        }
    }

    fn update_battery(&mut self, status: &SYS_STATUS_DATA) {
        // voltage_battery is in millivolts, convert to volts
        if status.voltage_battery != u16::MAX {
            self.battery.voltage = Some(status.voltage_battery as f32 / 1000.0);
        }
        // current_battery is in centiamps (0.01A), -1 means invalid
        if status.current_battery != -1 {
            self.battery.current = Some(status.current_battery as f32 / 100.0);
        }
        if (0..=100).contains(&status.battery_remaining) {
            self.battery.remaining = Some(status.battery_remaining as u8);
        }
    }

    pub fn health(&self) -> Health {
        let is_armable = match self.prearm_ok {
            Some(ok) => ok,
            None => self.system_status == Some(MavState::MAV_STATE_STANDBY),
        };
        Health {
            is_armable,
            is_global_position_ok: self.gps_fix >= GpsFixType::GPS_FIX_TYPE_3D_FIX as u8 && self.position.is_some(),
        }
    }

    pub fn rel_alt_m(&self) -> Option<f32> {
        self.position.map(|p| p.rel_alt_m)
    }

    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }
}

/// Polls successive snapshots until `pred` holds, returning the matching one.
pub async fn wait_for<F>(rx: &mut watch::Receiver<Telemetry>, mut pred: F) -> Result<Telemetry, ActionError>
where
    F: FnMut(&Telemetry) -> bool,
{
    loop {
        {
            let t = rx.borrow_and_update();
            if pred(&t) {
                return Ok(t.clone());
            }
        }
        rx.changed().await.map_err(|_| ActionError::LinkClosed)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{
        EXTENDED_SYS_STATE_DATA, GLOBAL_POSITION_INT_DATA, GPS_RAW_INT_DATA, HEARTBEAT_DATA,
    };

    fn heartbeat(base_mode: MavModeFlag, state: MavState) -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            base_mode,
            system_status: state,
            ..Default::default()
        })
    }

    #[test]
    fn heartbeat_tracks_armed_flag() {
        let mut t = Telemetry::default();
        t.apply(&heartbeat(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED | MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED, MavState::MAV_STATE_ACTIVE));
        assert!(t.armed);
        assert_eq!(t.heartbeats, 1);
        assert!(t.hb_age().is_some());

        t.apply(&heartbeat(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED, MavState::MAV_STATE_STANDBY));
        assert!(!t.armed);
        assert_eq!(t.system_status, Some(MavState::MAV_STATE_STANDBY));
    }

    #[test]
    fn global_position_is_scaled() {
        let mut t = Telemetry::default();
        t.apply(&MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 473_977_418,
            lon: 85_455_939,
            alt: 498_250,
            relative_alt: 10_250,
            ..Default::default()
        }));
        let p = t.position.unwrap();
        assert!((p.lat - 47.3977418).abs() < 1e-9);
        assert!((p.lon - 8.5455939).abs() < 1e-9);
        assert!((p.abs_alt_m - 498.25).abs() < 1e-3);
        assert_eq!(t.rel_alt_m(), Some(10.25));
    }

    #[test]
    fn landed_state_maps_to_in_air() {
        let mut t = Telemetry::default();
        assert_eq!(t.in_air, None);
        for (state, expect) in [
            (MavLandedState::MAV_LANDED_STATE_ON_GROUND, Some(false)),
            (MavLandedState::MAV_LANDED_STATE_TAKEOFF, Some(true)),
            (MavLandedState::MAV_LANDED_STATE_IN_AIR, Some(true)),
            (MavLandedState::MAV_LANDED_STATE_LANDING, Some(true)),
            (MavLandedState::MAV_LANDED_STATE_UNDEFINED, None),
        ] {
            t.apply(&MavMessage::EXTENDED_SYS_STATE(EXTENDED_SYS_STATE_DATA {
                landed_state: state,
                ..Default::default()
            }));
            assert_eq!(t.in_air, expect, "{:?}", state);
        }
    }

    #[test]
    fn battery_ignores_invalid_sentinels() {
        let mut t = Telemetry::default();
        t.apply(&MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            voltage_battery: u16::MAX,
            current_battery: -1,
            battery_remaining: -1,
            ..Default::default()
        }));
        assert!(t.battery.voltage.is_none());
        assert!(t.battery.current.is_none());
        assert!(t.battery.remaining.is_none());

        t.apply(&MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            voltage_battery: 12_600,
            current_battery: 150,
            battery_remaining: 87,
            ..Default::default()
        }));
        assert_eq!(t.battery.voltage, Some(12.6));
        assert_eq!(t.battery.current, Some(1.5));
        assert_eq!(t.battery.remaining, Some(87));
    }

    #[test]
    fn health_uses_prearm_bit_when_reported() {
        let mut t = Telemetry::default();
        t.apply(&heartbeat(MavModeFlag::empty(), MavState::MAV_STATE_STANDBY));
        assert!(t.health().is_armable);
        assert!(!t.health().is_global_position_ok);

        let prearm = MavSysStatusSensor::MAV_SYS_STATUS_PREARM_CHECK;
        t.apply(&MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            onboard_control_sensors_present: prearm,
            onboard_control_sensors_health: MavSysStatusSensor::empty(),
            ..Default::default()
        }));
        assert!(!t.health().is_armable);

        t.apply(&MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            onboard_control_sensors_present: prearm,
            onboard_control_sensors_health: prearm,
            ..Default::default()
        }));
        assert!(t.health().is_armable);

        t.apply(&MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
            fix_type: GpsFixType::GPS_FIX_TYPE_3D_FIX,
            satellites_visible: 10,
            ..Default::default()
        }));
        t.apply(&MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA::default()));
        assert!(t.health().is_global_position_ok);
    }

    #[tokio::test]
    async fn wait_for_sees_later_snapshots() {
        let (tx, mut rx) = watch::channel(Telemetry::default());
        let waiter = tokio::spawn(async move { wait_for(&mut rx, |t| t.armed).await });
        tx.send_modify(|t| t.heartbeats = 1);
        tx.send_modify(|t| t.armed = true);
        let t = waiter.await.unwrap().unwrap();
        assert!(t.armed);
    }

    #[tokio::test]
    async fn wait_for_reports_closed_link() {
        let (tx, mut rx) = watch::channel(Telemetry::default());
        drop(tx);
        assert!(matches!(wait_for(&mut rx, |t| t.armed).await, Err(ActionError::LinkClosed)));
    }
}
