use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sortie_fc::autodetect::autodetect_fc;
use sortie_fc::{Autopilot, Drone, LinkConfig};
use sortie_plan::doctor::{self, PlanLimits};
use sortie_plan::plan::load_mission_file;
use sortie_plan::{MissionCfg, OffboardCfg};

mod flights;

use flights::{ArmPolicy, FlightCfg};

#[derive(Debug, Parser)]
#[command(name = "sortie", version, about = "Scripted MAVLink flight procedures for PX4")]
struct Cli {
    /// TOML config; every key has a default.
    #[arg(long)]
    config: Option<String>,

    /// Override link.url (disables autodetect).
    #[arg(long)]
    url: Option<String>,

    /// Override our MAVLink system id.
    #[arg(long)]
    sys_id: Option<u8>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate config and mission plan without connecting.
    Check {
        #[arg(long)]
        plan: Option<String>,
    },
    /// Probe candidate endpoints for a vehicle heartbeat.
    Probe,
    /// Connect and print one telemetry snapshot.
    Status,
    /// Arm and run an empty guarded block.
    Arm,
    /// Take off to the takeoff altitude, then land.
    Rise {
        #[arg(long)]
        alt: Option<f32>,
        /// Wait for armable and global position before arming.
        #[arg(long)]
        wait_healthy: bool,
    },
    /// Upload and fly a waypoint mission.
    Mission {
        #[arg(long)]
        plan: Option<String>,
    },
    /// Fly local NED targets in PX4 OFFBOARD mode.
    Offboard,
    /// Return to launch now.
    Rtl,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    link: LinkConfig,
    flight: FlightCfg,
    limits: PlanLimits,
    mission: MissionCfg,
    offboard: OffboardCfg,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    if let Some(url) = cli.url {
        cfg.link.url = url;
        cfg.link.autodetect = false;
    }
    if let Some(id) = cli.sys_id {
        cfg.link.sys_id = id;
    }

    match cli.cmd {
        Command::Check { plan } => check(&cfg, plan.as_deref()),
        Command::Probe => probe(&cfg).await,
        Command::Status => status(&cfg).await,
        Command::Arm => {
            cfg.flight.check()?;
            let drone = connect(&cfg.link).await?;
            flights::arm(&drone, ArmPolicy::Immediate, &cfg.flight).await?;
            flights::guarded(&drone, flights::idle(&drone), interrupt()).await
        }
        Command::Rise { alt, wait_healthy } => {
            if let Some(alt) = alt {
                cfg.flight.takeoff_alt_m = alt;
            }
            doctor::check_takeoff(cfg.flight.takeoff_alt_m, cfg.flight.alt_tolerance_m, &cfg.limits)?;
            cfg.flight.check()?;
            let policy = if wait_healthy { ArmPolicy::WhenHealthy } else { ArmPolicy::Immediate };

            let drone = connect(&cfg.link).await?;
            flights::arm(&drone, policy, &cfg.flight).await?;
            flights::guarded(&drone, flights::rise(&drone, &cfg.flight), interrupt()).await
        }
        Command::Mission { plan } => {
            let mission = mission_cfg(&cfg, plan.as_deref())?;
            let plan = mission.to_plan();
            doctor::check_plan(&plan, &cfg.limits)?;
            doctor::check_takeoff(cfg.flight.takeoff_alt_m, cfg.flight.alt_tolerance_m, &cfg.limits)?;
            cfg.flight.check()?;

            let drone = connect(&cfg.link).await?;
            flights::arm(&drone, ArmPolicy::WhenHealthy, &cfg.flight).await?;
            let commands = flights::mission(&drone, &plan, mission.rtl_after_mission, &cfg.flight);
            flights::guarded(&drone, commands, interrupt()).await
        }
        Command::Offboard => {
            doctor::check_offboard(&cfg.offboard, &cfg.limits)?;
            cfg.flight.check()?;
            let drone = connect(&cfg.link).await?;
            flights::offboard(&drone, &cfg.offboard, &cfg.flight, interrupt()).await
        }
        Command::Rtl => {
            let drone = connect(&cfg.link).await?;
            drone.return_to_launch().await.context("return to launch")?;
            info!("RTB command dispatched.");
            Ok(())
        }
    }
}

async fn connect(link: &LinkConfig) -> Result<Drone> {
    info!("Waiting for drone to connect...");
    let drone = Drone::connect(link).await.context("connect to drone")?;
    info!("-- Connected to drone at {}", drone.url());
    Ok(drone)
}

/// Resolves when Ctrl-C is pressed; never, if the handler cannot be installed.
async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}

fn mission_cfg(cfg: &Config, plan: Option<&str>) -> Result<MissionCfg> {
    match plan {
        Some(path) => load_mission_file(path),
        None => Ok(cfg.mission.clone()),
    }
}

fn check(cfg: &Config, plan: Option<&str>) -> Result<()> {
    info!("check: starting");

    let mission = mission_cfg(cfg, plan)?;
    let plan = mission.to_plan();
    doctor::check_plan(&plan, &cfg.limits).context("mission plan")?;
    doctor::check_takeoff(cfg.flight.takeoff_alt_m, cfg.flight.alt_tolerance_m, &cfg.limits).context("flight")?;
    doctor::check_offboard(&cfg.offboard, &cfg.limits).context("offboard")?;
    cfg.flight.check().context("flight")?;

    if cfg.link.autodetect {
        info!("check: link autodetect enabled (OK)");
    } else {
        anyhow::ensure!(!cfg.link.url.is_empty(), "link.url missing (autodetect=false)");
        sortie_fc::mav::parse_serial_url(&cfg.link.url)?;
    }

    info!(
        "check: mission {} waypoints, {:.0}m total, rtl_after={}",
        plan.len(),
        sortie_plan::geo::leg_lengths_m(&plan).iter().sum::<f64>(),
        mission.rtl_after_mission
    );
    info!("check: OK");
    Ok(())
}

async fn probe(cfg: &Config) -> Result<()> {
    let res = autodetect_fc(&cfg.link).await?;
    match &res.chosen {
        Some(link) => println!("CHOSEN: {}", link.url()),
        None => println!("CHOSEN: none"),
    }
    for p in res.probes {
        println!("probe url={} hb={} {}ms note={}", p.url, p.hb_seen, p.elapsed_ms, p.note);
    }
    Ok(())
}

async fn status(cfg: &Config) -> Result<()> {
    let drone = connect(&cfg.link).await?;
    // Give the requested streams a moment to arrive.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let t = drone.telemetry().borrow().clone();
    let health = t.health();

    println!("url={}", drone.url());
    println!("armed={} in_air={:?} landed_state={:?}", t.armed, t.in_air, t.landed_state);
    println!("system_status={:?}", t.system_status);
    println!("armable={} global_position_ok={}", health.is_armable, health.is_global_position_ok);
    println!("gps_fix={} satellites={}", t.gps_fix, t.satellites);
    println!("position={:?}", t.position);
    println!("local_position={:?}", t.local_position);
    println!("battery={:?}", t.battery);
    println!("mission_seq={:?} mission_reached={:?}", t.mission_seq, t.mission_reached);
    println!("last_heartbeat_age={:?} heartbeats={}", t.hb_age(), t.heartbeats);
    println!("last_status_text={:?}", t.last_status_text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [link]
            url = "tcpout:127.0.0.1:5760"

            [flight]
            takeoff_alt_m = 15.0

            [offboard]
            targets = [{ x = 3.0, y = 4.0 }]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.link.url, "tcpout:127.0.0.1:5760");
        assert_eq!(cfg.link.target_sys, 1);
        assert_eq!(cfg.flight.takeoff_alt_m, 15.0);
        assert_eq!(cfg.flight.alt_tolerance_m, 1.0);
        assert_eq!(cfg.mission.waypoints.len(), 3);
        assert_eq!(cfg.offboard.targets.len(), 1);
        assert_eq!(cfg.offboard.alt_m, 5.0);
    }

    #[test]
    fn default_config_passes_check() {
        check(&Config::default(), None).unwrap();
    }

    #[test]
    fn check_rejects_negative_health_timeout() {
        let cfg: Config = toml::from_str("[flight]\nhealth_timeout_s = -1.0\n").unwrap();
        let err = check(&cfg, None).unwrap_err();
        assert!(format!("{:#}", err).contains("health_timeout_s"));
    }
}
