use mavlink::common::{
    MavCmd, MavMessage, MavModeFlag, MavParamType, MavResult, COMMAND_ACK_DATA, COMMAND_LONG_DATA,
    PARAM_SET_DATA, PARAM_VALUE_DATA,
};
use thiserror::Error;

/// PX4 custom main mode for externally streamed setpoints.
pub const PX4_MAIN_MODE_OFFBOARD: u8 = 6;

/// PX4 parameter holding the takeoff altitude above home.
pub const TAKEOFF_ALT_PARAM: &str = "MIS_TAKEOFF_ALT";

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0:?} denied by autopilot")]
    Denied(MavCmd),
    #[error("{0:?} failed")]
    Failed(MavCmd),
    #[error("{0:?} not supported by autopilot")]
    Unsupported(MavCmd),
    #[error("{0:?} temporarily rejected")]
    TemporarilyRejected(MavCmd),
    #[error("{0:?}: no ack after {1} attempts")]
    Timeout(MavCmd, u32),
    #[error("parameter {0} not confirmed by autopilot")]
    ParamTimeout(String),
    #[error("refusing {0:?}: no recent heartbeat")]
    NoHeartbeat(MavCmd),
    #[error("{0:?} rate-limited")]
    RateLimited(MavCmd),
    #[error("telemetry link closed")]
    LinkClosed,
    #[error(transparent)]
    Link(#[from] anyhow::Error),
}

/// A COMMAND_LONG before addressing.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub cmd: MavCmd,
    pub params: [f32; 7],
}

impl Command {
    pub fn new(cmd: MavCmd, params: [f32; 7]) -> Self {
        Self { cmd, params }
    }

    pub fn arm() -> Self {
        Self::new(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    /// Uses the autopilot's configured takeoff altitude.
    pub fn takeoff() -> Self {
        Self::new(MavCmd::MAV_CMD_NAV_TAKEOFF, [f32::NAN; 7])
    }

    /// Lands at the current position.
    pub fn land() -> Self {
        Self::new(MavCmd::MAV_CMD_NAV_LAND, [f32::NAN; 7])
    }

    pub fn return_to_launch() -> Self {
        Self::new(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 7])
    }

    pub fn mission_start() -> Self {
        Self::new(MavCmd::MAV_CMD_MISSION_START, [0.0; 7])
    }

    pub fn px4_mode(main_mode: u8) -> Self {
        let custom = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
        Self::new(MavCmd::MAV_CMD_DO_SET_MODE, [custom, main_mode as f32, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    pub fn message_interval(msg_id: u32, hz: f32) -> Self {
        let interval_us = 1_000_000.0 / hz;
        Self::new(MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL, [msg_id as f32, interval_us, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    pub fn to_message(&self, target_sys: u8, target_comp: u8, confirmation: u8) -> MavMessage {
        let [param1, param2, param3, param4, param5, param6, param7] = self.params;
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: target_sys,
            target_component: target_comp,
            command: self.cmd,
            confirmation,
            param1,
            param2,
            param3,
            param4,
            param5,
            param6,
            param7,
        })
    }
}

#[derive(Debug)]
pub enum AckOutcome {
    Accepted,
    InProgress,
    Rejected(ActionError),
}

/// Interprets a COMMAND_ACK for `cmd`; acks for other commands yield `None`.
pub fn ack_outcome(cmd: MavCmd, ack: &COMMAND_ACK_DATA) -> Option<AckOutcome> {
    if ack.command != cmd {
        return None;
    }
    Some(match ack.result {
        MavResult::MAV_RESULT_ACCEPTED => AckOutcome::Accepted,
        MavResult::MAV_RESULT_IN_PROGRESS => AckOutcome::InProgress,
        MavResult::MAV_RESULT_TEMPORARILY_REJECTED => AckOutcome::Rejected(ActionError::TemporarilyRejected(cmd)),
        MavResult::MAV_RESULT_DENIED => AckOutcome::Rejected(ActionError::Denied(cmd)),
        MavResult::MAV_RESULT_UNSUPPORTED => AckOutcome::Rejected(ActionError::Unsupported(cmd)),
        _ => AckOutcome::Rejected(ActionError::Failed(cmd)),
    })
}

/// Null-padded 16 byte parameter id.
pub fn param_id(name: &str) -> [u8; 16] {
    let mut id = [0u8; 16];
    for (dst, src) in id.iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    id
}

pub fn param_set(name: &str, value: f32, target_sys: u8, target_comp: u8) -> MavMessage {
    MavMessage::PARAM_SET(PARAM_SET_DATA {
        param_value: value,
        target_system: target_sys,
        target_component: target_comp,
        param_id: param_id(name),
        param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
    })
}

/// True when a PARAM_VALUE echoes `name` at `value`.
pub fn param_confirms(pv: &PARAM_VALUE_DATA, name: &str, value: f32) -> bool {
    pv.param_id == param_id(name) && (pv.param_value - value).abs() < 1e-3
}
