use std::collections::HashMap;
use std::time::{Duration, Instant};

use mavlink::common::MavCmd;

/// Spaces out repeated fallback commands (RTL, LAND) so a burst of interrupts
/// does not flood the link.
#[derive(Debug)]
pub struct CommandRateLimit {
    last_sent: HashMap<u32, Instant>,
    min_interval: Duration,
}

impl CommandRateLimit {
    pub fn new(min_interval: Duration) -> Self {
        Self { last_sent: HashMap::new(), min_interval }
    }

    pub fn allow(&mut self, cmd: MavCmd) -> bool {
        self.allow_at(cmd, Instant::now())
    }

    fn allow_at(&mut self, cmd: MavCmd, now: Instant) -> bool {
        let key = cmd as u32;
        if let Some(t) = self.last_sent.get(&key) {
            if now.duration_since(*t) < self.min_interval { return false; }
        }
        self.last_sent.insert(key, now);
        true
    }
}
