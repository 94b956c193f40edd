//! Scripted autopilot on a real UDP socket, for exercising the link layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavlink::common::{MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
use mavlink::{MavConnection, MavHeader};

type Conn = Arc<Box<dyn MavConnection<MavMessage> + Send + Sync>>;

pub struct Reply {
    pub after: Duration,
    pub from: (u8, u8),
    pub msg: MavMessage,
}

pub fn reply(msg: MavMessage) -> Reply {
    Reply { after: Duration::ZERO, from: (1, 1), msg }
}

pub fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// System 1 / component 1 sending heartbeats every 50ms to `127.0.0.1:port`
/// and answering whatever it receives through `script`.
pub struct FakeVehicle {
    conn: Conn,
    seen: Arc<Mutex<Vec<MavMessage>>>,
    silent: Arc<AtomicBool>,
}

impl FakeVehicle {
    pub fn start<S>(port: u16, mut script: S) -> Self
    where
        S: FnMut(&MavMessage) -> Vec<Reply> + Send + 'static,
    {
        let conn: Conn = Arc::new(mavlink::connect::<MavMessage>(&format!("udpout:127.0.0.1:{}", port)).unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let silent = Arc::new(AtomicBool::new(false));

        let (hb_conn, hb_silent) = (conn.clone(), silent.clone());
        std::thread::spawn(move || loop {
            if !hb_silent.load(Ordering::Relaxed) {
                let _ = hb_conn.send(&header(1, 1), &heartbeat(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED));
            }
            std::thread::sleep(Duration::from_millis(50));
        });

        let (rx_conn, rx_seen) = (conn.clone(), seen.clone());
        std::thread::spawn(move || loop {
            let Ok((_, msg)) = rx_conn.recv() else {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            };
            if matches!(msg, MavMessage::HEARTBEAT(_)) {
                continue;
            }
            rx_seen.lock().unwrap().push(msg.clone());
            for r in script(&msg) {
                std::thread::sleep(r.after);
                let _ = rx_conn.send(&header(r.from.0, r.from.1), &r.msg);
            }
        });

        Self { conn, seen, silent }
    }

    pub fn silence(&self) {
        self.silent.store(true, Ordering::Relaxed);
    }

    pub fn send_as(&self, sys: u8, comp: u8, msg: &MavMessage) {
        self.conn.send(&header(sys, comp), msg).unwrap();
    }

    /// Everything received except heartbeats, in arrival order.
    pub fn seen(&self) -> Vec<MavMessage> {
        self.seen.lock().unwrap().clone()
    }

    /// `confirmation` of every COMMAND_LONG carrying `cmd`.
    pub fn confirmations(&self, cmd: MavCmd) -> Vec<u8> {
        self.seen()
            .iter()
            .filter_map(|m| match m {
                MavMessage::COMMAND_LONG(c) if c.command == cmd => Some(c.confirmation),
                _ => None,
            })
            .collect()
    }
}

pub fn heartbeat(base_mode: MavModeFlag) -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
        base_mode,
        system_status: MavState::MAV_STATE_STANDBY,
        mavlink_version: 3,
    })
}

fn header(system_id: u8, component_id: u8) -> MavHeader {
    MavHeader { system_id, component_id, sequence: 0 }
}
