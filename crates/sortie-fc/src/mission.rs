use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavMissionResult, MISSION_COUNT_DATA, MISSION_ITEM_INT_DATA,
};
use sortie_plan::{CameraAction, MissionPlan};
use thiserror::Error;

use crate::action::ActionError;

#[derive(Debug, Error)]
pub enum MissionError {
    #[error("autopilot rejected mission: {0:?}")]
    Rejected(MavMissionResult),
    #[error("autopilot requested item {seq} of a {count} item mission")]
    BadRequest { seq: u16, count: u16 },
    #[error("mission acknowledged after {sent}/{count} items")]
    Incomplete { sent: usize, count: usize },
    #[error("mission too large ({0} items)")]
    TooLarge(usize),
    #[error("mission upload timed out")]
    Timeout,
    #[error("telemetry link closed")]
    LinkClosed,
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Link(#[from] anyhow::Error),
}

/// Progress in mission-item terms (not MAVLink sequence numbers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MissionProgress {
    pub current: usize,
    pub total: usize,
}

/// A plan flattened into the MISSION_ITEM_INT sequence the autopilot stores.
#[derive(Debug, Clone)]
pub struct EncodedMission {
    items: Vec<MISSION_ITEM_INT_DATA>,
    /// MAVLink seq -> index of the mission item it came from.
    layout: Vec<usize>,
    total: usize,
}

impl EncodedMission {
    pub fn encode(plan: &MissionPlan, rtl_after: bool, target_sys: u8, target_comp: u8) -> Result<Self, MissionError> {
        let mut enc = Self { items: Vec::new(), layout: Vec::new(), total: plan.len() };
        let mut last_speed: Option<f32> = None;

        for (idx, item) in plan.items.iter().enumerate() {
            let hold_s = if item.fly_through { 0.0 } else { item.loiter_time_s.unwrap_or(0.0) };
            let yaw = item.yaw_deg.unwrap_or(f32::NAN);
            enc.push(idx, MISSION_ITEM_INT_DATA {
                param1: hold_s,
                param2: item.acceptance_radius_m,
                param3: 0.0,
                param4: yaw,
                x: deg_e7(item.lat),
                y: deg_e7(item.lon),
                z: item.rel_alt_m,
                command: MavCmd::MAV_CMD_NAV_WAYPOINT,
                frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
                ..Default::default()
            });

            if let Some(speed) = item.speed_m_s {
                if last_speed != Some(speed) {
                    // param1=1: ground speed, param3=-1: leave throttle alone
                    enc.push(idx, mission_command(MavCmd::MAV_CMD_DO_CHANGE_SPEED, [1.0, speed, -1.0, 0.0]));
                    last_speed = Some(speed);
                }
            }

            let interval = item.photo_interval_s.unwrap_or(0.0);
            let camera = match item.camera_action {
                CameraAction::None => None,
                CameraAction::TakePhoto => Some((MavCmd::MAV_CMD_IMAGE_START_CAPTURE, [0.0, 0.0, 1.0, 0.0])),
                CameraAction::StartPhotoInterval => Some((MavCmd::MAV_CMD_IMAGE_START_CAPTURE, [0.0, interval, 0.0, 0.0])),
                CameraAction::StopPhotoInterval => Some((MavCmd::MAV_CMD_IMAGE_STOP_CAPTURE, [0.0; 4])),
                CameraAction::StartVideo => Some((MavCmd::MAV_CMD_VIDEO_START_CAPTURE, [0.0; 4])),
                CameraAction::StopVideo => Some((MavCmd::MAV_CMD_VIDEO_STOP_CAPTURE, [0.0; 4])),
            };
            if let Some((cmd, params)) = camera {
                enc.push(idx, mission_command(cmd, params));
            }
        }

        if rtl_after {
            enc.push(plan.len(), mission_command(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 4]));
        }

        if enc.items.len() >= u16::MAX as usize {
            return Err(MissionError::TooLarge(enc.items.len()));
        }
        for (seq, it) in enc.items.iter_mut().enumerate() {
            it.seq = seq as u16;
            it.current = (seq == 0) as u8;
            it.autocontinue = 1;
            it.target_system = target_sys;
            it.target_component = target_comp;
        }
        Ok(enc)
    }

    fn push(&mut self, idx: usize, item: MISSION_ITEM_INT_DATA) {
        self.items.push(item);
        self.layout.push(idx);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[MISSION_ITEM_INT_DATA] {
        &self.items
    }

    pub fn progress(&self, seq: u16) -> MissionProgress {
        let current = self.layout.get(seq as usize).copied().unwrap_or(self.total);
        MissionProgress { current: current.min(self.total), total: self.total }
    }
}

fn deg_e7(deg: f64) -> i32 {
    (deg * 1e7).round() as i32
}

fn mission_command(command: MavCmd, params: [f32; 4]) -> MISSION_ITEM_INT_DATA {
    MISSION_ITEM_INT_DATA {
        param1: params[0],
        param2: params[1],
        param3: params[2],
        param4: params[3],
        command,
        frame: MavFrame::MAV_FRAME_MISSION,
        ..Default::default()
    }
}

#[derive(Debug)]
pub enum UploadStep {
    Reply(MavMessage),
    Accepted,
    Ignored,
}

/// Client side of the MAVLink mission upload handshake.
pub struct MissionUpload {
    mission: EncodedMission,
    target_sys: u8,
    target_comp: u8,
    highest_sent: Option<u16>,
    last_reply: Option<MavMessage>,
}

impl MissionUpload {
    pub fn new(mission: EncodedMission, target_sys: u8, target_comp: u8) -> Self {
        Self { mission, target_sys, target_comp, highest_sent: None, last_reply: None }
    }

    pub fn count_message(&self) -> MavMessage {
        MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count: self.mission.len() as u16,
            target_system: self.target_sys,
            target_component: self.target_comp,
            ..Default::default()
        })
    }

    /// What to resend when the autopilot goes quiet.
    pub fn retry_message(&self) -> MavMessage {
        self.last_reply.clone().unwrap_or_else(|| self.count_message())
    }

    pub fn handle(&mut self, msg: &MavMessage) -> Result<UploadStep, MissionError> {
        let seq = match msg {
            MavMessage::MISSION_REQUEST_INT(r) => r.seq,
            MavMessage::MISSION_REQUEST(r) => r.seq,
            MavMessage::MISSION_ACK(ack) => return self.finish(ack.mavtype),
            _ => return Ok(UploadStep::Ignored),
        };

        let count = self.mission.len() as u16;
        if seq >= count {
            return Err(MissionError::BadRequest { seq, count });
        }
        let reply = MavMessage::MISSION_ITEM_INT(self.mission.items[seq as usize].clone());
        self.highest_sent = Some(self.highest_sent.map_or(seq, |h| h.max(seq)));
        self.last_reply = Some(reply.clone());
        Ok(UploadStep::Reply(reply))
    }

    fn finish(&self, result: MavMissionResult) -> Result<UploadStep, MissionError> {
        if result != MavMissionResult::MAV_MISSION_ACCEPTED {
            return Err(MissionError::Rejected(result));
        }
        let count = self.mission.len();
        let sent = self.highest_sent.map_or(0, |h| h as usize + 1);
        if sent < count {
            return Err(MissionError::Incomplete { sent, count });
        }
        Ok(UploadStep::Accepted)
    }
}
