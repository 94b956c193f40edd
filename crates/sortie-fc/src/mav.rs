use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::{Context, Result};
use mavlink::{
    common::{MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA},
    error::MessageReadError,
    MavConnection, MavHeader,
};
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

/// One MAVLink connection, shared between the reader thread and command senders.
pub struct FcLink {
    conn: Box<dyn MavConnection<MavMessage> + Send + Sync>,
    url: String,
    sys_id: u8,
    comp_id: u8,
    sequence: AtomicU8,
}

impl FcLink {
    pub fn open(url: &str, sys_id: u8, comp_id: u8) -> Result<Self> {
        if let Some((dev, baud)) = parse_serial_url(url)? {
            // quick validate device
            let _ = tokio_serial::new(dev, baud)
                .open_native_async()
                .with_context(|| format!("open fc serial device {}", dev))?;
        }

        let conn = mavlink::connect::<MavMessage>(url)
            .with_context(|| format!("mavlink connect {}", url))?;
        debug!("mavlink: opened {}", url);

        Ok(Self {
            conn,
            url: url.to_string(),
            sys_id,
            comp_id,
            sequence: AtomicU8::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Blocks until one message arrives. Parse errors are returned, not skipped.
    pub fn recv(&self) -> std::result::Result<(MavHeader, MavMessage), MessageReadError> {
        self.conn.recv()
    }

    pub fn send(&self, msg: &MavMessage) -> Result<()> {
        let hdr = MavHeader {
            system_id: self.sys_id,
            component_id: self.comp_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.conn.send(&hdr, msg).context("mavlink send")?;
        Ok(())
    }

    pub fn send_heartbeat(&self) -> Result<()> {
        let hb = HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        };
        self.send(&MavMessage::HEARTBEAT(hb))
    }
}

/// Splits `serial:<dev>:<baud>` into its parts; other schemes yield `None`.
pub fn parse_serial_url(url: &str) -> Result<Option<(&str, u32)>> {
    let Some(rest) = url.strip_prefix("serial:") else { return Ok(None); };
    let (dev, baud) = rest
        .rsplit_once(':')
        .with_context(|| format!("serial url missing baud: {}", url))?;
    anyhow::ensure!(!dev.is_empty(), "serial url missing device: {}", url);
    let baud = baud.parse().with_context(|| format!("bad baud in {}", url))?;
    Ok(Some((dev, baud)))
}
