//! Client transport state machine
//!
//! Pure bookkeeping for connect, reconnect-with-backoff and the outbound
//! queue. It never touches a socket or a clock: every input returns the list
//! of [`Action`]s the driver must carry out, which keeps the whole lifecycle
//! testable without a network or real time.

use super::TransportEvent;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

/// Close codes that end a session on purpose and must not trigger a retry
pub const NORMAL_CLOSE_CODES: [u16; 2] = [1000, 1001];

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No transport and nothing scheduled
    Disconnected,
    /// Dialing the relay
    Connecting,
    /// Transport open; frames are written straight through
    Connected,
    /// Waiting out a backoff delay before the next dial
    Reconnecting,
}

/// Failures surfaced to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("cannot reach relay: {0}")]
    Unreachable(String),
    #[error("rejected by relay")]
    Rejected,
    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
}

/// Why a dial did not produce an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialFailure {
    /// The relay refused the credential (HTTP 401 on upgrade)
    Rejected,
    /// Anything else: DNS, refused, timeout, bad handshake
    Unreachable(String),
}

/// Backoff and keepalive tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub keepalive_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            keepalive_interval: crate::relay::liveness::CLIENT_PING_INTERVAL,
        }
    }
}

impl TransportConfig {
    /// Delay before reconnect attempt `attempt` (1-based): base·2ⁿ, capped
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Side effect requested by the machine
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a new transport
    Dial,
    /// Write these frames in order
    Transmit(Vec<String>),
    StartKeepalive,
    StopKeepalive,
    /// Arm the single reconnect timer
    ScheduleReconnect { attempt: u32, delay: Duration },
    CancelReconnect,
    /// Close the transport (normal closure) and abandon any pending dial
    CloseTransport,
    /// Publish to subscribers
    Emit(TransportEvent),
}

/// Connect / reconnect / queue state machine
#[derive(Debug)]
pub struct TransportMachine {
    config: TransportConfig,
    state: TransportState,
    attempts: u32,
    queue: VecDeque<String>,
}

impl TransportMachine {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: TransportState::Disconnected,
            attempts: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Reconnect attempts made since the last successful open
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Start connecting. No-op unless disconnected.
    pub fn connect(&mut self) -> Vec<Action> {
        if self.state != TransportState::Disconnected {
            return Vec::new();
        }
        self.state = TransportState::Connecting;
        self.attempts = 0;
        vec![Action::Dial]
    }

    /// The transport finished its handshake
    pub fn on_opened(&mut self) -> Vec<Action> {
        if self.state != TransportState::Connecting {
            // A dial that completes after disconnect() is not wanted
            return vec![Action::CloseTransport];
        }
        self.state = TransportState::Connected;
        self.attempts = 0;

        let mut actions = vec![Action::Emit(TransportEvent::Opened), Action::StartKeepalive];
        if !self.queue.is_empty() {
            actions.push(Action::Transmit(self.queue.drain(..).collect()));
        }
        actions
    }

    /// The dial failed
    pub fn on_dial_failed(&mut self, failure: DialFailure) -> Vec<Action> {
        if self.state != TransportState::Connecting {
            return Vec::new();
        }
        match failure {
            DialFailure::Rejected => {
                self.state = TransportState::Disconnected;
                self.attempts = 0;
                vec![Action::Emit(TransportEvent::Error(TransportError::Rejected))]
            }
            DialFailure::Unreachable(reason) => {
                let mut actions = vec![Action::Emit(TransportEvent::Error(
                    TransportError::Unreachable(reason),
                ))];
                actions.extend(self.schedule_reconnect());
                actions
            }
        }
    }

    /// The open transport went away. `code` is the close code, if one was sent.
    pub fn on_closed(&mut self, code: Option<u16>) -> Vec<Action> {
        if !matches!(
            self.state,
            TransportState::Connected | TransportState::Connecting
        ) {
            return Vec::new();
        }

        let mut actions = vec![
            Action::StopKeepalive,
            Action::Emit(TransportEvent::Closed { code }),
        ];
        if code.map_or(false, |c| NORMAL_CLOSE_CODES.contains(&c)) {
            self.state = TransportState::Disconnected;
            self.attempts = 0;
        } else {
            actions.extend(self.schedule_reconnect());
        }
        actions
    }

    /// The reconnect timer fired
    pub fn on_reconnect_timer(&mut self) -> Vec<Action> {
        if self.state != TransportState::Reconnecting {
            return Vec::new();
        }
        self.state = TransportState::Connecting;
        vec![Action::Dial]
    }

    /// Send a frame now, or queue it until the transport is open
    pub fn send(&mut self, frame: String) -> Vec<Action> {
        if self.state == TransportState::Connected {
            vec![Action::Transmit(vec![frame])]
        } else {
            self.queue.push_back(frame);
            Vec::new()
        }
    }

    /// Put frames whose write failed back at the head of the queue, in order
    pub fn requeue(&mut self, frames: Vec<String>) {
        for frame in frames.into_iter().rev() {
            self.queue.push_front(frame);
        }
    }

    /// Stop everything and drop queued frames. Idempotent.
    pub fn disconnect(&mut self) -> Vec<Action> {
        self.queue.clear();
        self.attempts = 0;
        if self.state == TransportState::Disconnected {
            return Vec::new();
        }
        self.state = TransportState::Disconnected;
        vec![
            Action::CancelReconnect,
            Action::StopKeepalive,
            Action::CloseTransport,
        ]
    }

    fn schedule_reconnect(&mut self) -> Vec<Action> {
        if self.attempts >= self.config.max_attempts {
            let attempts = self.attempts;
            self.state = TransportState::Disconnected;
            self.attempts = 0;
            return vec![Action::Emit(TransportEvent::Error(
                TransportError::ReconnectExhausted(attempts),
            ))];
        }

        self.attempts += 1;
        self.state = TransportState::Reconnecting;
        let delay = self.config.reconnect_delay(self.attempts);
        vec![
            Action::Emit(TransportEvent::ReconnectScheduled {
                attempt: self.attempts,
                delay,
            }),
            Action::ScheduleReconnect {
                attempt: self.attempts,
                delay,
            },
        ]
    }
}

impl Default for TransportMachine {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open(machine: &mut TransportMachine) {
        machine.connect();
        machine.on_opened();
        assert_eq!(machine.state(), TransportState::Connected);
    }

    fn scheduled_delay(actions: &[Action]) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            Action::ScheduleReconnect { delay, .. } => Some(*delay),
            _ => None,
        })
    }

    #[test]
    fn test_connect_is_noop_unless_disconnected() {
        let mut machine = TransportMachine::default();
        assert_eq!(machine.connect(), vec![Action::Dial]);
        assert_eq!(machine.state(), TransportState::Connecting);
        assert!(machine.connect().is_empty());

        machine.on_opened();
        assert!(machine.connect().is_empty());
        assert_eq!(machine.state(), TransportState::Connected);
    }

    #[test]
    fn test_reconnect_delays_follow_backoff() {
        let config = TransportConfig::default();
        let delays: Vec<u64> = (1..=6)
            .map(|n| config.reconnect_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(config.reconnect_delay(64), config.max_delay);
    }

    #[test]
    fn test_backoff_exhausts_after_max_attempts() {
        let mut machine = TransportMachine::default();
        open(&mut machine);

        let mut actions = machine.on_closed(Some(1006));
        let mut last = Duration::ZERO;
        for attempt in 1..=5 {
            assert_eq!(machine.state(), TransportState::Reconnecting);
            assert_eq!(machine.attempts(), attempt);
            let delay = scheduled_delay(&actions).expect("reconnect scheduled");
            assert!(delay >= last);
            last = delay;

            assert_eq!(machine.on_reconnect_timer(), vec![Action::Dial]);
            actions = machine.on_dial_failed(DialFailure::Unreachable("refused".into()));
        }

        assert_eq!(machine.state(), TransportState::Disconnected);
        assert!(scheduled_delay(&actions).is_none());
        assert!(actions.contains(&Action::Emit(TransportEvent::Error(
            TransportError::ReconnectExhausted(5)
        ))));
        assert!(machine.on_reconnect_timer().is_empty());
    }

    #[test]
    fn test_normal_close_does_not_retry() {
        for code in NORMAL_CLOSE_CODES {
            let mut machine = TransportMachine::default();
            open(&mut machine);
            let actions = machine.on_closed(Some(code));
            assert_eq!(machine.state(), TransportState::Disconnected);
            assert!(scheduled_delay(&actions).is_none());
            assert!(actions.contains(&Action::Emit(TransportEvent::Closed { code: Some(code) })));
        }
    }

    #[test]
    fn test_missing_close_code_retries() {
        let mut machine = TransportMachine::default();
        open(&mut machine);
        let actions = machine.on_closed(None);
        assert_eq!(machine.state(), TransportState::Reconnecting);
        assert_eq!(scheduled_delay(&actions), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn test_rejected_is_terminal() {
        let mut machine = TransportMachine::default();
        machine.connect();
        let actions = machine.on_dial_failed(DialFailure::Rejected);
        assert_eq!(machine.state(), TransportState::Disconnected);
        assert_eq!(
            actions,
            vec![Action::Emit(TransportEvent::Error(TransportError::Rejected))]
        );
    }

    #[test]
    fn test_successful_open_resets_attempts() {
        let mut machine = TransportMachine::default();
        open(&mut machine);
        machine.on_closed(Some(1006));
        machine.on_reconnect_timer();
        machine.on_dial_failed(DialFailure::Unreachable("down".into()));
        assert_eq!(machine.attempts(), 2);

        machine.on_reconnect_timer();
        machine.on_opened();
        assert_eq!(machine.attempts(), 0);

        let actions = machine.on_closed(Some(1011));
        assert_eq!(scheduled_delay(&actions), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn test_queue_flushes_fifo_on_open() {
        let mut machine = TransportMachine::default();
        for frame in ["a", "b", "c"] {
            assert!(machine.send(frame.to_string()).is_empty());
        }
        machine.connect();
        assert!(machine.send("d".to_string()).is_empty());
        assert_eq!(machine.queued(), 4);

        let actions = machine.on_opened();
        // Subscribers hear Opened before the backlog goes out
        assert_eq!(actions.first(), Some(&Action::Emit(TransportEvent::Opened)));
        assert_eq!(
            actions.last(),
            Some(&Action::Transmit(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "d".to_string()
            ]))
        );
        assert_eq!(machine.queued(), 0);
        assert_eq!(
            machine.send("e".to_string()),
            vec![Action::Transmit(vec!["e".to_string()])]
        );
    }

    #[test]
    fn test_requeue_keeps_order_ahead_of_newer_frames() {
        let mut machine = TransportMachine::default();
        machine.send("late".to_string());
        machine.requeue(vec!["x".to_string(), "y".to_string()]);
        machine.connect();
        let actions = machine.on_opened();
        assert_eq!(
            actions.last(),
            Some(&Action::Transmit(vec![
                "x".to_string(),
                "y".to_string(),
                "late".to_string()
            ]))
        );
    }

    #[test]
    fn test_queue_survives_exhaustion() {
        let config = TransportConfig {
            max_attempts: 1,
            ..TransportConfig::default()
        };
        let mut machine = TransportMachine::new(config);
        machine.send("kept".to_string());
        machine.connect();
        machine.on_dial_failed(DialFailure::Unreachable("down".into()));
        machine.on_reconnect_timer();
        machine.on_dial_failed(DialFailure::Unreachable("down".into()));
        assert_eq!(machine.state(), TransportState::Disconnected);
        assert_eq!(machine.queued(), 1);
    }

    #[test]
    fn test_disconnect_is_idempotent_and_clears_queue() {
        let mut machine = TransportMachine::default();
        machine.connect();
        machine.on_dial_failed(DialFailure::Unreachable("down".into()));
        machine.send("dropped".to_string());

        let actions = machine.disconnect();
        assert!(actions.contains(&Action::CancelReconnect));
        assert!(actions.contains(&Action::CloseTransport));
        assert_eq!(machine.state(), TransportState::Disconnected);
        assert_eq!(machine.queued(), 0);

        assert!(machine.disconnect().is_empty());
        assert!(machine.on_reconnect_timer().is_empty());
    }

    proptest::proptest! {
        #[test]
        fn test_backoff_never_shrinks_or_exceeds_cap(base_ms in 1u64..5_000, cap_ms in 1u64..120_000, attempts in 1u32..40) {
            let config = TransportConfig {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(cap_ms),
                ..TransportConfig::default()
            };
            let mut previous = Duration::ZERO;
            for attempt in 1..=attempts {
                let delay = config.reconnect_delay(attempt);
                proptest::prop_assert!(delay >= previous);
                proptest::prop_assert!(delay <= config.max_delay);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_late_open_after_disconnect_is_closed() {
        let mut machine = TransportMachine::default();
        machine.connect();
        machine.disconnect();
        assert_eq!(machine.on_opened(), vec![Action::CloseTransport]);
        assert_eq!(machine.state(), TransportState::Disconnected);
    }
}
