//! Keepalive and liveness bookkeeping
//!
//! The relay probes each socket with a transport-level ping on a fixed
//! interval. If nothing at all has arrived from the peer by the next probe,
//! the connection is considered dead. Clients independently send an
//! application-level `ping` on a shorter interval purely to keep idle
//! middleboxes from reaping the socket.

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// How often the relay probes each connection
pub const SERVER_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// How often clients send an application-level ping
pub const CLIENT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// What the connection task should do on a probe tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    /// Send a probe and wait for the peer to show signs of life
    SendProbe,
    /// The previous probe went unanswered; tear the connection down
    Expire,
}

/// Per-connection liveness state on the relay side
#[derive(Debug, Default)]
pub struct LivenessMonitor {
    awaiting_reply: bool,
    probes_sent: u64,
}

impl LivenessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on every probe interval tick
    pub fn on_tick(&mut self) -> ProbeAction {
        if self.awaiting_reply {
            return ProbeAction::Expire;
        }
        self.awaiting_reply = true;
        self.probes_sent += 1;
        ProbeAction::SendProbe
    }

    /// Any inbound frame (pong, ping or data) proves the peer is alive
    pub fn record_activity(&mut self) {
        self.awaiting_reply = false;
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }
}

/// Interval whose first tick fires one full period from now.
///
/// Missed ticks are delayed rather than burst, so a stalled task never sees
/// two back-to-back ticks and mistakes that for a missed reply.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
