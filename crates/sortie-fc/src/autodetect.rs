use std::time::{Duration, Instant};

use anyhow::Result;
use mavlink::common::MavMessage;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::mav::FcLink;
use crate::LinkConfig;

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub url: String,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

pub struct AutodetectResult {
    /// First endpoint that produced a heartbeat, already open.
    pub chosen: Option<FcLink>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_urls() -> Vec<String> {
    vec![
        "udpin:0.0.0.0:14540".into(),
        "udpin:0.0.0.0:14550".into(),
        "tcpout:127.0.0.1:5760".into(),
        "serial:/dev/ttyACM0:57600".into(),
        "serial:/dev/ttyUSB0:57600".into(),
        "serial:/dev/ttyAMA0:921600".into(),
    ]
}

pub async fn autodetect_fc(cfg: &LinkConfig) -> Result<AutodetectResult> {
    let candidates = cfg.candidate_urls.clone().unwrap_or_else(default_candidate_urls);
    let heartbeat_timeout = cfg.heartbeat_timeout();
    let mut probes = Vec::new();

    for url in candidates {
        let start = Instant::now();
        let note = match FcLink::open(&url, cfg.sys_id, cfg.comp_id) {
            Ok(link) => match wait_heartbeat(link, cfg.target_sys, heartbeat_timeout).await {
                Some(link) => {
                    probes.push(ProbeResult {
                        url: url.clone(),
                        hb_seen: true,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                        note: "heartbeat".into(),
                    });
                    info!("fc autodetect: OK {}", url);
                    return Ok(AutodetectResult { chosen: Some(link), probes });
                }
                None => "no heartbeat".to_string(),
            },
            Err(e) => {
                warn!("fc autodetect probe failed url={} err={:#}", url, e);
                format!("open/connect failed: {:#}", e)
            }
        };

        probes.push(ProbeResult {
            url,
            hb_seen: false,
            elapsed_ms: start.elapsed().as_millis() as u64,
            note,
        });
    }

    Ok(AutodetectResult { chosen: None, probes })
}

/// Receives on a helper thread until a heartbeat from `target_sys` shows up.
/// The deadline is only checked between messages: a silent endpoint leaves its
/// thread parked in `recv` for the life of the process, still holding the
/// endpoint (a bound UDP port stays bound). The link is only handed back on
/// success.
async fn wait_heartbeat(link: FcLink, target_sys: u8, limit: Duration) -> Option<FcLink> {
    let (tx, rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("mavlink-probe".into())
        .spawn(move || {
            let deadline = Instant::now() + limit;
            while Instant::now() < deadline {
                match link.recv() {
                    Ok((hdr, MavMessage::HEARTBEAT(_))) if hdr.system_id == target_sys => {
                        let _ = tx.send(link);
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => std::thread::sleep(Duration::from_millis(25)),
                }
            }
        });
    if let Err(e) = spawned {
        warn!("fc autodetect: spawn probe thread: {}", e);
        return None;
    }

    tokio::time::timeout(limit, rx).await.ok()?.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_vehicle::{free_port, FakeVehicle};

    fn probing(urls: Vec<String>) -> LinkConfig {
        LinkConfig {
            autodetect: true,
            candidate_urls: Some(urls),
            heartbeat_timeout_ms: Some(300),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn silent_endpoint_is_reported_and_skipped() {
        let silent = format!("udpin:127.0.0.1:{}", free_port());
        let live_port = free_port();
        let live = format!("udpin:127.0.0.1:{}", live_port);
        let _vehicle = FakeVehicle::start(live_port, |_| vec![]);

        let res = autodetect_fc(&probing(vec![silent.clone(), live.clone()])).await.unwrap();

        assert_eq!(res.chosen.as_ref().map(|l| l.url()), Some(live.as_str()));
        assert_eq!(res.probes.len(), 2);
        assert_eq!(res.probes[0].url, silent);
        assert!(!res.probes[0].hb_seen);
        assert_eq!(res.probes[0].note, "no heartbeat");
        assert!(res.probes[1].hb_seen);
    }

    #[tokio::test]
    async fn nothing_found_leaves_chosen_empty() {
        let bad = "serial:/dev/sortie-does-not-exist:57600".to_string();
        let res = autodetect_fc(&probing(vec![bad])).await.unwrap();
        assert!(res.chosen.is_none());
        assert!(res.probes[0].note.starts_with("open/connect failed"));
    }
}
