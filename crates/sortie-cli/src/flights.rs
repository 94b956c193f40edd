//! Flight procedures. Each one arms outside the guarded section (an arming
//! failure just aborts) and runs its commands inside [`guarded`], which falls
//! back to return-to-launch on error or interrupt.

use std::cell::Cell;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use sortie_fc::mission::EncodedMission;
use sortie_fc::telemetry::wait_for;
use sortie_fc::{ActionError, Autopilot, Telemetry};
use sortie_plan::{LocalPoint, MissionPlan, OffboardCfg};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlightCfg {
    pub takeoff_alt_m: f32,
    /// Altitude band around a target that counts as arrived.
    pub alt_tolerance_m: f32,
    pub health_timeout_s: f64,
    /// Limit for a single climb, landing or offboard leg.
    pub phase_timeout_s: f64,
    pub mission_timeout_s: f64,
}

impl Default for FlightCfg {
    fn default() -> Self {
        Self {
            takeoff_alt_m: 10.0,
            alt_tolerance_m: 1.0,
            health_timeout_s: 120.0,
            phase_timeout_s: 180.0,
            mission_timeout_s: 900.0,
        }
    }
}

impl FlightCfg {
    /// Rejects values that cannot become a timeout. Run before connecting.
    pub fn check(&self) -> Result<()> {
        self.health_timeout()?;
        self.phase_timeout()?;
        self.mission_timeout()?;
        anyhow::ensure!(self.alt_tolerance_m > 0.0, "flight.alt_tolerance_m must be > 0");
        Ok(())
    }

    fn health_timeout(&self) -> Result<Duration> {
        secs("health_timeout_s", self.health_timeout_s)
    }

    fn phase_timeout(&self) -> Result<Duration> {
        secs("phase_timeout_s", self.phase_timeout_s)
    }

    fn mission_timeout(&self) -> Result<Duration> {
        secs("mission_timeout_s", self.mission_timeout_s)
    }
}

fn secs(key: &str, value: f64) -> Result<Duration> {
    anyhow::ensure!(value > 0.0, "flight.{} must be > 0 (got {})", key, value);
    Duration::try_from_secs_f64(value).with_context(|| format!("flight.{} out of range", key))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmPolicy {
    Immediate,
    /// Wait for the autopilot to report armable with a global position first.
    WhenHealthy,
}

pub async fn arm<A: Autopilot>(ap: &A, policy: ArmPolicy, cfg: &FlightCfg) -> Result<()> {
    if policy == ArmPolicy::WhenHealthy {
        info!("Waiting to arm drone.");
        let mut rx = ap.telemetry();
        let ready = |t: &Telemetry| {
            let h = t.health();
            h.is_armable && h.is_global_position_ok
        };
        timeout(cfg.health_timeout()?, wait_for(&mut rx, ready))
            .await
            .context("vehicle never reported armable")??;
    }

    info!("Arming drone...");
    ap.arm().await.context("error arming drone")?;
    info!("Drone armed.");
    Ok(())
}

/// Runs `commands`; on error or interrupt, dispatches return-to-launch.
pub async fn guarded<A, F, I>(ap: &A, commands: F, interrupt: I) -> Result<()>
where
    A: Autopilot,
    F: Future<Output = Result<()>>,
    I: Future<Output = ()>,
{
    tokio::select! {
        biased;
        _ = interrupt => {
            warn!("Keyboard interrupt.");
            rtb(ap).await;
            anyhow::bail!("interrupted; RTL dispatched")
        }
        res = commands => {
            if let Err(e) = &res {
                error!("Fatal error: {:#}", e);
                rtb(ap).await;
            }
            res
        }
    }
}

async fn rtb<A: Autopilot>(ap: &A) {
    info!("RTB command dispatched.");
    if let Err(e) = ap.return_to_launch().await {
        error!("RTL failed: {}", e);
    }
}

/// Template procedure: nothing to fly yet.
pub async fn idle<A: Autopilot>(_ap: &A) -> Result<()> {
    Ok(())
}

/// Climb to the takeoff altitude and land again.
pub async fn rise<A: Autopilot>(ap: &A, cfg: &FlightCfg) -> Result<()> {
    let alt = cfg.takeoff_alt_m;
    info!("RISE: climbing to {}m", alt);
    ap.set_takeoff_altitude(alt).await?;
    ap.takeoff().await?;
    info!("Takeoff command dispatched.");

    // No takeoff-complete signal, so watch the altitude.
    block_till_altitude(ap, alt, cfg.alt_tolerance_m, cfg.phase_timeout()?).await?;
    info!("Drone is at takeoff altitude.");

    ap.land().await?;
    info!("Landing command dispatched.");
    block_till_altitude(ap, 0.0, cfg.alt_tolerance_m, cfg.phase_timeout()?).await?;
    info!("Drone has landed.");
    Ok(())
}

pub async fn block_till_altitude<A: Autopilot>(ap: &A, target_m: f32, tolerance_m: f32, limit: Duration) -> Result<()> {
    let mut rx = ap.telemetry();
    let at_alt = |t: &Telemetry| t.rel_alt_m().map_or(false, |a| (a - target_m).abs() <= tolerance_m);
    timeout(limit, wait_for(&mut rx, at_alt))
        .await
        .with_context(|| format!("relative altitude {}m not reached within {:?}", target_m, limit))??;
    Ok(())
}

/// Returns once the vehicle has been seen flying and is back on the ground.
pub async fn block_until_not_flying<A: Autopilot>(ap: &A, limit: Duration) -> Result<()> {
    let mut rx = ap.telemetry();
    let mut was_flying = false;
    let landed = |t: &Telemetry| match t.in_air {
        Some(true) => {
            was_flying = true;
            false
        }
        Some(false) => was_flying,
        None => false,
    };
    timeout(limit, wait_for(&mut rx, landed))
        .await
        .with_context(|| format!("vehicle still flying after {:?}", limit))??;
    Ok(())
}

/// Aborts the progress reporter however the mission future ends.
struct Reporter(JoinHandle<()>);

impl Drop for Reporter {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn report_progress(mut rx: watch::Receiver<Telemetry>, mission: EncodedMission) {
    let mut last = None;
    loop {
        let seq = rx.borrow_and_update().mission_seq;
        if let Some(seq) = seq {
            let p = mission.progress(seq);
            if last != Some(p) {
                info!("Progress: {}/{}", p.current, p.total);
                last = Some(p);
            }
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Upload `plan`, take off, fly it, and wait until the vehicle is down.
pub async fn mission<A: Autopilot>(ap: &A, plan: &MissionPlan, rtl_after: bool, cfg: &FlightCfg) -> Result<()> {
    let layout = EncodedMission::encode(plan, rtl_after, 0, 0)?;
    let last_seq = layout.len().saturating_sub(1) as u16;
    let _reporter = Reporter(tokio::spawn(report_progress(ap.telemetry(), layout)));

    let mut rx = ap.telemetry();
    match timeout(cfg.health_timeout()?, wait_for(&mut rx, |t| t.position.is_some())).await {
        Ok(Ok(Telemetry { position: Some(p), .. })) => {
            info!("Current position: lat={:.7} lon={:.7} alt={:.1}m", p.lat, p.lon, p.abs_alt_m)
        }
        _ => warn!("No position fix yet; continuing."),
    }
    ap.set_return_to_launch_after_mission(rtl_after);

    info!("Uploading mission ({} waypoints).", plan.len());
    for (i, item) in plan.items.iter().enumerate() {
        debug!("  {}: lat={:.7} lon={:.7} alt={}m speed={:?}", i, item.lat, item.lon, item.rel_alt_m, item.speed_m_s);
    }
    ap.upload_mission(plan).await?;
    info!("Mission uploaded.");

    info!("Takeoff.");
    ap.set_takeoff_altitude(cfg.takeoff_alt_m).await?;
    ap.takeoff().await?;

    info!("Starting mission.");
    ap.start_mission().await?;
    info!("Mission started.");

    if !rtl_after {
        // The autopilot loiters at the last item; bring it down here.
        let mut rx = ap.telemetry();
        timeout(cfg.mission_timeout()?, wait_for(&mut rx, |t| t.mission_reached == Some(last_seq)))
            .await
            .context("last waypoint not reached")??;
        info!("Last waypoint reached, landing.");
        ap.land().await?;
        block_till_altitude(ap, 0.0, cfg.alt_tolerance_m, cfg.phase_timeout()?).await?;
    } else {
        block_until_not_flying(ap, cfg.mission_timeout()?).await?;
    }
    info!("Mission completed.");
    Ok(())
}

async fn stream_setpoints<A: Autopilot>(ap: &A, target: &Cell<LocalPoint>, down_m: f32, every: Duration) -> Result<(), ActionError> {
    let mut tick = tokio::time::interval(every);
    loop {
        tick.tick().await;
        let t = target.get();
        ap.set_position_ned(t.x, t.y, down_m)?;
    }
}

/// Arm, engage OFFBOARD, visit each local target, then (optionally) land.
/// Setpoints stream for the whole procedure, including while arming.
pub async fn offboard<A, I>(ap: &A, cfg: &OffboardCfg, flight: &FlightCfg, interrupt: I) -> Result<()>
where
    A: Autopilot,
    I: Future<Output = ()>,
{
    let first = *cfg.targets.first().context("offboard.targets is empty")?;
    let target = Cell::new(first);
    let every = cfg.setpoint_interval();
    let stream = stream_setpoints(ap, &target, -cfg.alt_m, every);
    tokio::pin!(stream);

    let warmup = async {
        tokio::time::sleep(every * cfg.warmup_setpoints).await;
        arm(ap, ArmPolicy::WhenHealthy, flight).await
    };
    tokio::select! {
        r = &mut stream => return Err(stream_ended(r)),
        r = warmup => r?,
    }

    let commands = async {
        ap.start_offboard().await?;
        info!("OFFBOARD engaged.");

        for t in &cfg.targets {
            target.set(*t);
            info!("Going to ({}, {}).", t.x, t.y);
            let mut rx = ap.telemetry();
            let reached = |tel: &Telemetry| tel.local_position.map_or(false, |p| cfg.reached(*t, p.x, p.y));
            timeout(flight.phase_timeout()?, wait_for(&mut rx, reached))
                .await
                .with_context(|| format!("target ({}, {}) not reached", t.x, t.y))??;
            info!("Reached target.");
        }

        if cfg.land_after {
            ap.land().await?;
            info!("Landing command dispatched.");
            block_till_altitude(ap, 0.0, flight.alt_tolerance_m, flight.phase_timeout()?).await?;
            info!("Drone has landed.");
        }
        Ok::<(), anyhow::Error>(())
    };

    let flying = async {
        tokio::select! {
            r = &mut stream => Err(stream_ended(r)),
            r = commands => r,
        }
    };
    guarded(ap, flying, interrupt).await
}

fn stream_ended(r: Result<(), ActionError>) -> anyhow::Error {
    match r {
        Ok(()) => anyhow::anyhow!("setpoint stream ended"),
        Err(e) => anyhow::Error::new(e).context("setpoint stream failed"),
    }
}
