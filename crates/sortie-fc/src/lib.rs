pub mod action;
pub mod autodetect;
pub mod autopilot;
pub mod drone;
#[cfg(test)]
mod fake_vehicle;
pub mod mav;
pub mod mission;
pub mod safety;
pub mod telemetry;

use std::time::Duration;

use serde::Deserialize;

pub use action::ActionError;
pub use autopilot::Autopilot;
pub use drone::Drone;
pub use mission::MissionError;
pub use telemetry::Telemetry;

/// PX4 SITL offboard API port; MAVSDK-style clients listen here.
pub const DEFAULT_URL: &str = "udpin:0.0.0.0:14540";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// mavlink connection string, e.g. `udpin:0.0.0.0:14540`, `tcpout:127.0.0.1:5760`,
    /// `serial:/dev/ttyACM0:57600`.
    pub url: String,

    /// If true, probe `candidate_urls` and use the first that yields a HEARTBEAT.
    pub autodetect: bool,
    pub candidate_urls: Option<Vec<String>>,

    /// Wait for the first vehicle heartbeat (also per autodetect probe).
    pub heartbeat_timeout_ms: Option<u64>,

    /// MAVLink ids we use (ground side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (autopilot side). 1/1 for PX4 SITL.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Refuse to send commands while the vehicle heartbeat is older than
    /// `heartbeat_timeout_ms`.
    pub require_heartbeat: bool,

    /// Companion heartbeat send rate. Default 1Hz.
    pub send_heartbeat_hz: Option<f32>,

    /// COMMAND_ACK wait per attempt, and attempts per command.
    pub command_timeout_ms: Option<u64>,
    pub command_retries: Option<u32>,

    /// Mission protocol wait per step, and resends per step.
    pub mission_timeout_ms: Option<u64>,
    pub mission_retries: Option<u32>,

    /// Minimum spacing between repeated RTL/LAND commands.
    pub fallback_min_interval_ms: Option<u64>,

    /// Ask the autopilot to stream the telemetry the procedures poll.
    pub request_streams: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.into(),
            autodetect: false,
            candidate_urls: None,
            heartbeat_timeout_ms: None,
            sys_id: 255,
            comp_id: 190,
            target_sys: 1,
            target_comp: 1,
            require_heartbeat: true,
            send_heartbeat_hz: None,
            command_timeout_ms: None,
            command_retries: None,
            mission_timeout_ms: None,
            mission_retries: None,
            fallback_min_interval_ms: None,
            request_streams: true,
        }
    }
}

impl LinkConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.unwrap_or(5000))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        let hz = self.send_heartbeat_hz.unwrap_or(1.0).max(0.2);
        Duration::from_secs_f32(1.0 / hz)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.unwrap_or(1000))
    }

    pub fn command_retries(&self) -> u32 {
        self.command_retries.unwrap_or(3).max(1)
    }

    pub fn mission_timeout(&self) -> Duration {
        Duration::from_millis(self.mission_timeout_ms.unwrap_or(1500))
    }

    pub fn mission_retries(&self) -> u32 {
        self.mission_retries.unwrap_or(5)
    }

    pub fn fallback_min_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_min_interval_ms.unwrap_or(2000))
    }
}
