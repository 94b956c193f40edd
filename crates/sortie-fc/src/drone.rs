use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use mavlink::common::{MavCmd, MavFrame, MavMessage, SET_POSITION_TARGET_LOCAL_NED_DATA};
use mavlink::error::MessageReadError;
use sortie_plan::MissionPlan;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::action::{self, ack_outcome, param_confirms, param_set, AckOutcome, ActionError, Command};
use crate::autodetect::autodetect_fc;
use crate::autopilot::Autopilot;
use crate::mav::FcLink;
use crate::mission::{EncodedMission, MissionError, MissionUpload, UploadStep};
use crate::safety::CommandRateLimit;
use crate::telemetry::{wait_for, Telemetry};
use crate::LinkConfig;

/// Consecutive receive I/O failures after which the reader gives up.
const MAX_IO_ERRORS: u32 = 50;

/// How long an IN_PROGRESS ack extends the wait for the final one.
const IN_PROGRESS_GRACE: Duration = Duration::from_secs(5);

/// (message id, rate) pairs requested with MAV_CMD_SET_MESSAGE_INTERVAL.
const STREAMS: &[(u32, f32)] = &[
    (1, 2.0),    // SYS_STATUS
    (24, 2.0),   // GPS_RAW_INT
    (32, 10.0),  // LOCAL_POSITION_NED
    (33, 10.0),  // GLOBAL_POSITION_INT
    (42, 2.0),   // MISSION_CURRENT
    (245, 5.0),  // EXTENDED_SYS_STATE
];

/// A connected vehicle: one reader thread folding telemetry, one heartbeat task,
/// and request/ack exchanges over the protocol inbox.
pub struct Drone {
    link: Arc<FcLink>,
    cfg: LinkConfig,
    telemetry: watch::Receiver<Telemetry>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<MavMessage>>,
    limiter: Mutex<CommandRateLimit>,
    rtl_after_mission: AtomicBool,
    stop: Arc<AtomicBool>,
    heartbeat_task: JoinHandle<()>,
    started: std::time::Instant,
}

impl Drone {
    pub async fn connect(cfg: &LinkConfig) -> Result<Self> {
        let link = if cfg.autodetect {
            let res = autodetect_fc(cfg).await?;
            res.chosen.context("fc autodetect failed: no heartbeat found")?
        } else {
            FcLink::open(&cfg.url, cfg.sys_id, cfg.comp_id).context("FC open")?
        };
        Self::from_link(link, cfg).await
    }

    pub async fn from_link(link: FcLink, cfg: &LinkConfig) -> Result<Self> {
        let link = Arc::new(link);
        let (tel_tx, tel_rx) = watch::channel(Telemetry::default());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        spawn_reader(link.clone(), tel_tx, inbox_tx, stop.clone(), cfg.target_sys, cfg.target_comp)?;
        let heartbeat_task = spawn_heartbeat(link.clone(), cfg.heartbeat_interval());

        let drone = Self {
            link,
            cfg: cfg.clone(),
            telemetry: tel_rx,
            inbox: AsyncMutex::new(inbox_rx),
            limiter: Mutex::new(CommandRateLimit::new(cfg.fallback_min_interval())),
            rtl_after_mission: AtomicBool::new(false),
            stop,
            heartbeat_task,
            started: std::time::Instant::now(),
        };

        info!("waiting for heartbeat on {}", drone.url());
        drone.wait_heartbeat(cfg.heartbeat_timeout()).await?;
        info!("connected to system {} on {}", cfg.target_sys, drone.url());

        if cfg.request_streams {
            drone.request_streams().await;
        }
        Ok(drone)
    }

    pub fn url(&self) -> &str {
        self.link.url()
    }

    async fn wait_heartbeat(&self, limit: Duration) -> Result<()> {
        let mut rx = self.telemetry.clone();
        timeout(limit, wait_for(&mut rx, |t| t.last_heartbeat.is_some()))
            .await
            .with_context(|| format!("no heartbeat from system {} within {:?}", self.cfg.target_sys, limit))?
            .context("waiting for heartbeat")?;
        Ok(())
    }

    async fn request_streams(&self) {
        for (id, hz) in STREAMS {
            if let Err(e) = self.command(Command::message_interval(*id, *hz)).await {
                warn!("stream request for message {} failed: {}", id, e);
            }
        }
    }

    async fn command(&self, command: Command) -> Result<(), ActionError> {
        let cmd = command.cmd;
        let stale = self.telemetry.borrow().hb_age().map_or(true, |age| age > self.cfg.heartbeat_timeout());
        if self.cfg.require_heartbeat && stale {
            return Err(ActionError::NoHeartbeat(cmd));
        }

        let mut inbox = self.inbox.lock().await;
        drain(&mut inbox);

        let attempts = self.cfg.command_retries();
        for attempt in 0..attempts {
            self.link.send(&command.to_message(self.cfg.target_sys, self.cfg.target_comp, attempt as u8))?;
            debug!("sent {:?} (attempt {}/{})", cmd, attempt + 1, attempts);

            let mut deadline = Instant::now() + self.cfg.command_timeout();
            loop {
                match timeout_at(deadline, inbox.recv()).await {
                    Err(_) => break,
                    Ok(None) => return Err(ActionError::LinkClosed),
                    Ok(Some(MavMessage::COMMAND_ACK(ack))) => match ack_outcome(cmd, &ack) {
                        None => {}
                        Some(AckOutcome::Accepted) => return Ok(()),
                        Some(AckOutcome::InProgress) => deadline = Instant::now() + IN_PROGRESS_GRACE,
                        Some(AckOutcome::Rejected(e)) => return Err(e),
                    },
                    Ok(Some(_)) => {}
                }
            }
            warn!("{:?}: no ack (attempt {}/{})", cmd, attempt + 1, attempts);
        }
        Err(ActionError::Timeout(cmd, attempts))
    }

    async fn set_param_f32(&self, name: &str, value: f32) -> Result<(), ActionError> {
        let mut inbox = self.inbox.lock().await;
        drain(&mut inbox);

        for _ in 0..self.cfg.command_retries() {
            self.link.send(&param_set(name, value, self.cfg.target_sys, self.cfg.target_comp))?;
            let deadline = Instant::now() + self.cfg.command_timeout();
            loop {
                match timeout_at(deadline, inbox.recv()).await {
                    Err(_) => break,
                    Ok(None) => return Err(ActionError::LinkClosed),
                    Ok(Some(MavMessage::PARAM_VALUE(pv))) if param_confirms(&pv, name, value) => return Ok(()),
                    Ok(Some(_)) => {}
                }
            }
            warn!("param {}: no confirmation, resending", name);
        }
        Err(ActionError::ParamTimeout(name.to_string()))
    }

    /// RTL and LAND are skipped (not failed) when repeated too quickly.
    fn fallback_allowed(&self, cmd: MavCmd) -> bool {
        self.limiter.lock().map(|mut l| l.allow(cmd)).unwrap_or(true)
    }
}

impl Autopilot for Drone {
    async fn arm(&self) -> Result<(), ActionError> {
        self.command(Command::arm()).await
    }

    async fn set_takeoff_altitude(&self, alt_m: f32) -> Result<(), ActionError> {
        self.set_param_f32(action::TAKEOFF_ALT_PARAM, alt_m).await
    }

    async fn takeoff(&self) -> Result<(), ActionError> {
        self.command(Command::takeoff()).await
    }

    async fn land(&self) -> Result<(), ActionError> {
        if !self.fallback_allowed(MavCmd::MAV_CMD_NAV_LAND) {
            warn!("LAND rate-limited");
            return Ok(());
        }
        self.command(Command::land()).await
    }

    async fn return_to_launch(&self) -> Result<(), ActionError> {
        if !self.fallback_allowed(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH) {
            warn!("RTL rate-limited");
            return Ok(());
        }
        info!("FC: sending RTL");
        self.command(Command::return_to_launch()).await
    }

    fn set_return_to_launch_after_mission(&self, enable: bool) {
        self.rtl_after_mission.store(enable, Ordering::Relaxed);
    }

    async fn upload_mission(&self, plan: &MissionPlan) -> Result<(), MissionError> {
        let rtl_after = self.rtl_after_mission.load(Ordering::Relaxed);
        let encoded = EncodedMission::encode(plan, rtl_after, self.cfg.target_sys, self.cfg.target_comp)?;
        let count = encoded.len();
        let mut upload = MissionUpload::new(encoded, self.cfg.target_sys, self.cfg.target_comp);

        let mut inbox = self.inbox.lock().await;
        drain(&mut inbox);

        debug!("mission: sending count {}", count);
        self.link.send(&upload.count_message())?;

        let mut resends = 0;
        let mut deadline = Instant::now() + self.cfg.mission_timeout();
        loop {
            match timeout_at(deadline, inbox.recv()).await {
                Err(_) => {
                    resends += 1;
                    if resends > self.cfg.mission_retries() {
                        return Err(MissionError::Timeout);
                    }
                    warn!("mission: autopilot silent, resending ({}/{})", resends, self.cfg.mission_retries());
                    self.link.send(&upload.retry_message())?;
                    deadline = Instant::now() + self.cfg.mission_timeout();
                }
                Ok(None) => return Err(MissionError::LinkClosed),
                Ok(Some(msg)) => match upload.handle(&msg)? {
                    UploadStep::Reply(reply) => {
                        self.link.send(&reply)?;
                        resends = 0;
                        deadline = Instant::now() + self.cfg.mission_timeout();
                    }
                    UploadStep::Accepted => {
                        info!("mission: {} items accepted", count);
                        return Ok(());
                    }
                    UploadStep::Ignored => {}
                },
            }
        }
    }

    async fn start_mission(&self) -> Result<(), MissionError> {
        Ok(self.command(Command::mission_start()).await?)
    }

    async fn start_offboard(&self) -> Result<(), ActionError> {
        self.command(Command::px4_mode(action::PX4_MAIN_MODE_OFFBOARD)).await
    }

    fn set_position_ned(&self, north_m: f32, east_m: f32, down_m: f32) -> Result<(), ActionError> {
        let sp = SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: self.started.elapsed().as_millis() as u32,
            x: north_m,
            y: east_m,
            z: down_m,
            target_system: self.cfg.target_sys,
            target_component: self.cfg.target_comp,
            coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
            ..Default::default()
        };
        self.link.send(&MavMessage::SET_POSITION_TARGET_LOCAL_NED(sp))?;
        Ok(())
    }

    fn telemetry(&self) -> watch::Receiver<Telemetry> {
        self.telemetry.clone()
    }
}

impl Drop for Drone {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.heartbeat_task.abort();
    }
}

fn drain(inbox: &mut mpsc::UnboundedReceiver<MavMessage>) {
    while inbox.try_recv().is_ok() {}
}

/// Replies the command layer waits for; everything else only feeds telemetry.
fn is_protocol_reply(msg: &MavMessage) -> bool {
    matches!(
        msg,
        MavMessage::COMMAND_ACK(_)
            | MavMessage::MISSION_REQUEST(_)
            | MavMessage::MISSION_REQUEST_INT(_)
            | MavMessage::MISSION_ACK(_)
            | MavMessage::PARAM_VALUE(_)
    )
}

// mavlink recv blocks with no timeout, so the reader lives on its own thread
// rather than the blocking pool (which the runtime would wait on at shutdown).
fn spawn_reader(
    link: Arc<FcLink>,
    telemetry: watch::Sender<Telemetry>,
    inbox: mpsc::UnboundedSender<MavMessage>,
    stop: Arc<AtomicBool>,
    target_sys: u8,
    target_comp: u8,
) -> Result<()> {
    std::thread::Builder::new()
        .name("mavlink-rx".into())
        .spawn(move || {
            let mut io_errors = 0u32;
            while !stop.load(Ordering::Relaxed) {
                match link.recv() {
                    Ok((hdr, msg)) => {
                        io_errors = 0;
                        if hdr.system_id != target_sys {
                            continue;
                        }
                        // gimbals, cameras etc. send their own heartbeats
                        if matches!(msg, MavMessage::HEARTBEAT(_)) && hdr.component_id != target_comp {
                            continue;
                        }
                        if is_protocol_reply(&msg) {
                            let _ = inbox.send(msg.clone());
                        }
                        telemetry.send_modify(|t| t.apply(&msg));
                    }
                    Err(MessageReadError::Parse(e)) => debug!("mavlink parse error: {:?}", e),
                    Err(MessageReadError::Io(e)) => {
                        if e.kind() == ErrorKind::WouldBlock {
                            std::thread::sleep(Duration::from_millis(10));
                            continue;
                        }
                        io_errors += 1;
                        warn!("mavlink recv failed on {}: {}", link.url(), e);
                        if io_errors >= MAX_IO_ERRORS {
                            warn!("mavlink reader giving up after {} errors", io_errors);
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            debug!("mavlink reader stopped");
        })
        .context("spawn mavlink reader")?;
    Ok(())
}

fn spawn_heartbeat(link: Arc<FcLink>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if let Err(e) = link.send_heartbeat() {
                debug!("heartbeat send failed: {:#}", e);
            }
        }
    })
}
