//! Relay Client: drives the transport state machine over a real WebSocket

use super::state::{Action, DialFailure, TransportConfig, TransportMachine, TransportState};
use super::TransportEvent;
use crate::relay::liveness;
use crate::relay::protocol::{ClientMessage, PositionSample, RelayMessage, RelayProtocolError};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant, Interval};
use tokio_tungstenite::tungstenite::{self, http::StatusCode, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Relay endpoint, e.g. `ws://127.0.0.1:8080/ws`
    pub url: String,
    /// Give up on a single dial after this long
    pub connect_timeout: Duration,
    /// A write that takes longer counts as a failed send
    pub write_timeout: Duration,
    pub transport: TransportConfig,
    /// Capacity of the event broadcast; slow subscribers lag past this
    pub event_capacity: usize,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            transport: TransportConfig::default(),
            event_capacity: 256,
        }
    }
}

impl RelayClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Relay client error types
#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("Relay client task has stopped")]
    Stopped,
    #[error("Serialization error: {0}")]
    Serialization(#[from] RelayProtocolError),
}

enum Command {
    Connect(String),
    Send(String),
    Disconnect,
}

/// Handle to a relay connection.
///
/// All socket work happens on one background task; this handle only posts
/// commands to it. Dropping the last handle closes the connection.
pub struct RelayClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TransportState>,
    events: broadcast::Sender<TransportEvent>,
}

impl RelayClient {
    /// Spawn the client task. Must be called inside a Tokio runtime.
    pub fn new(config: RelayClientConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(TransportState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let driver = Driver {
            machine: TransportMachine::new(config.transport.clone()),
            config,
            credential: None,
            events: events.clone(),
            state_tx,
            socket: None,
            dial: None,
            reconnect_at: None,
            keepalive: None,
        };
        tokio::spawn(driver.run(command_rx));

        Self {
            commands,
            state,
            events,
        }
    }

    /// Connect with the given credential. No-op if already connecting or connected.
    pub fn connect(&self, credential: impl Into<String>) -> Result<(), RelayClientError> {
        self.post(Command::Connect(credential.into()))
    }

    /// Send a message now, or queue it until the transport is open
    pub fn send(&self, message: &ClientMessage) -> Result<(), RelayClientError> {
        let frame = message.to_json()?;
        self.post(Command::Send(frame))
    }

    pub fn send_location(&self, coordinates: PositionSample) -> Result<(), RelayClientError> {
        self.send(&ClientMessage::LocationUpdate { coordinates })
    }

    /// Close the transport, cancel any reconnect and drop queued frames
    pub fn disconnect(&self) -> Result<(), RelayClientError> {
        self.post(Command::Disconnect)
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state.clone()
    }

    /// Subscribe to transport events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Wait until the transport reaches `target`
    pub async fn wait_for_state(&self, target: TransportState) -> Result<(), RelayClientError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| RelayClientError::Stopped)
    }

    fn post(&self, command: Command) -> Result<(), RelayClientError> {
        self.commands
            .send(command)
            .map_err(|_| RelayClientError::Stopped)
    }
}

// ============================================================================
// DRIVER
// ============================================================================

struct Driver {
    machine: TransportMachine,
    config: RelayClientConfig,
    credential: Option<String>,
    events: broadcast::Sender<TransportEvent>,
    state_tx: watch::Sender<TransportState>,
    socket: Option<WsStream>,
    dial: Option<BoxFuture<'static, Result<WsStream, DialFailure>>>,
    reconnect_at: Option<Instant>,
    keepalive: Option<Interval>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let actions = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect(credential)) => {
                        let actions = self.machine.connect();
                        // Reconnects keep using the credential of the dial that started them
                        if actions.contains(&Action::Dial) {
                            self.credential = Some(credential);
                        }
                        actions
                    }
                    Some(Command::Send(frame)) => self.machine.send(frame),
                    Some(Command::Disconnect) => self.machine.disconnect(),
                    None => {
                        let actions = self.machine.disconnect();
                        self.apply(actions).await;
                        break;
                    }
                },
                dialed = next_dial(&mut self.dial) => {
                    self.dial = None;
                    match dialed {
                        Ok(socket) => {
                            info!(url = %self.config.url, "Connected to relay");
                            self.socket = Some(socket);
                            self.machine.on_opened()
                        }
                        Err(failure) => {
                            warn!(url = %self.config.url, ?failure, "Relay dial failed");
                            self.machine.on_dial_failed(failure)
                        }
                    }
                },
                inbound = next_inbound(&mut self.socket) => self.on_inbound(inbound),
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.machine.on_reconnect_timer()
                },
                _ = next_tick(&mut self.keepalive) => {
                    match ClientMessage::Ping.to_json() {
                        Ok(frame) => vec![Action::Transmit(vec![frame])],
                        Err(_) => Vec::new(),
                    }
                },
            };
            self.apply(actions).await;
        }
        debug!("Relay client task stopped");
    }

    fn on_inbound(&mut self, inbound: Option<Result<Message, tungstenite::Error>>) -> Vec<Action> {
        match inbound {
            Some(Ok(Message::Text(text))) => match RelayMessage::from_json(&text) {
                Ok(message) => vec![Action::Emit(TransportEvent::Message(message))],
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed relay frame");
                    Vec::new()
                }
            },
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| u16::from(f.code));
                info!(?code, "Relay closed the connection");
                self.socket = None;
                self.machine.on_closed(code)
            }
            Some(Ok(_)) => Vec::new(),
            Some(Err(e)) => {
                warn!(error = %e, "Relay socket error");
                self.socket = None;
                self.machine.on_closed(None)
            }
            None => {
                self.socket = None;
                self.machine.on_closed(None)
            }
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut pending: VecDeque<Action> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Dial => self.start_dial(),
                Action::Transmit(frames) => {
                    if let Some(unsent) = self.transmit(frames).await {
                        self.machine.requeue(unsent);
                        self.socket = None;
                        pending.extend(self.machine.on_closed(None));
                    }
                }
                Action::StartKeepalive => {
                    self.keepalive = Some(liveness::ticker(self.config.transport.keepalive_interval));
                }
                Action::StopKeepalive => self.keepalive = None,
                Action::ScheduleReconnect { attempt, delay } => {
                    info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to relay");
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                Action::CancelReconnect => self.reconnect_at = None,
                Action::CloseTransport => {
                    self.dial = None;
                    if let Some(mut socket) = self.socket.take() {
                        let _ = tokio::time::timeout(self.config.write_timeout, socket.close(None)).await;
                    }
                }
                Action::Emit(event) => {
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
            }
        }
        self.state_tx.send_replace(self.machine.state());
    }

    /// Write frames in order. On failure returns the failed frame and
    /// everything after it. A relay that stops reading counts as a failure
    /// once `write_timeout` passes.
    async fn transmit(&mut self, frames: Vec<String>) -> Option<Vec<String>> {
        let limit = self.config.write_timeout;
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Some(frames),
        };
        let mut frames = frames.into_iter();
        while let Some(frame) = frames.next() {
            let failure = match tokio::time::timeout(limit, socket.send(Message::Text(frame.clone()))).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("write timed out".to_string()),
            };
            if let Some(e) = failure {
                warn!(error = %e, "Relay send failed, requeueing");
                let mut unsent = vec![frame];
                unsent.extend(frames);
                return Some(unsent);
            }
        }
        None
    }

    fn start_dial(&mut self) {
        let credential = self.credential.clone().unwrap_or_default();
        let url = format!("{}?token={}", self.config.url, credential);
        let timeout = self.config.connect_timeout;
        debug!(endpoint = %self.config.url, "Dialing relay");

        self.dial = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
                Ok(Ok((socket, _response))) => Ok(socket),
                Ok(Err(tungstenite::Error::Http(response)))
                    if response.status() == StatusCode::UNAUTHORIZED =>
                {
                    Err(DialFailure::Rejected)
                }
                Ok(Err(e)) => Err(DialFailure::Unreachable(e.to_string())),
                Err(_) => Err(DialFailure::Unreachable("connect timed out".to_string())),
            }
        }));
    }
}

async fn next_dial(
    dial: &mut Option<BoxFuture<'static, Result<WsStream, DialFailure>>>,
) -> Result<WsStream, DialFailure> {
    match dial.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_inbound(socket: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
    match socket.as_mut() {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    async fn next_event(events: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Address with nothing listening on it
    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    /// Accept one upgrade; returns the socket and the token it carried
    async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, String) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut token = String::new();
        let socket = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                token = request
                    .uri()
                    .query()
                    .unwrap_or_default()
                    .trim_start_matches("token=")
                    .to_string();
                Ok(response)
            },
        )
        .await
        .unwrap();
        (socket, token)
    }

    async fn local_relay() -> (TcpListener, RelayClientConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = RelayClientConfig::new(format!("ws://{}/ws", listener.local_addr().unwrap()));
        (listener, config)
    }

    async fn wait_for(client: &RelayClient, target: TransportState) {
        tokio::time::timeout(Duration::from_secs(5), client.wait_for_state(target))
            .await
            .expect("state never reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_relay_schedules_reconnect() {
        let addr = dead_addr().await;
        let client = RelayClient::new(RelayClientConfig::new(format!("ws://{}/ws", addr)));
        let mut events = client.subscribe();

        client.connect("anything").unwrap();

        match next_event(&mut events).await {
            TransportEvent::Error(crate::client::TransportError::Unreachable(_)) => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_millis(2000)
            }
        );
        assert_eq!(client.state(), TransportState::Reconnecting);

        client.disconnect().unwrap();
        client.wait_for_state(TransportState::Disconnected).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_before_connect_is_queued() {
        let addr = dead_addr().await;
        let client = RelayClient::new(RelayClientConfig::new(format!("ws://{}/ws", addr)));
        client.send(&ClientMessage::Ping).unwrap();
        assert_eq!(client.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_keepalive_pings_while_connected() {
        let (listener, mut config) = local_relay().await;
        config.transport.keepalive_interval = Duration::from_millis(100);
        let client = RelayClient::new(config);

        client.connect("token").unwrap();
        let (mut relay, _) = accept(&listener).await;
        wait_for(&client, TransportState::Connected).await;

        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(2), relay.next())
                .await
                .expect("no keepalive")
                .expect("socket ended")
                .unwrap();
            match frame {
                Message::Text(text) => {
                    assert_eq!(ClientMessage::from_json(&text).unwrap(), ClientMessage::Ping)
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }

        client.disconnect().unwrap();
        wait_for(&client, TransportState::Disconnected).await;

        // Only pings already in flight may precede the close; nothing follows it
        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match relay.next().await {
                    Some(Ok(Message::Text(text))) => {
                        assert_eq!(ClientMessage::from_json(&text).unwrap(), ClientMessage::Ping)
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => return,
                }
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(!matches!(relay.next().await, Some(Ok(Message::Text(_)))));
        })
        .await;
        assert!(ended.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_not_blocked_by_stalled_relay() {
        let (listener, mut config) = local_relay().await;
        config.write_timeout = Duration::from_millis(200);
        let client = RelayClient::new(config);

        client.connect("token").unwrap();
        // Held open but never read
        let (_relay, _) = accept(&listener).await;
        wait_for(&client, TransportState::Connected).await;

        let sample = PositionSample::new(48.85, 2.35, 5.0, 1_700_000_000_000);
        for _ in 0..300_000 {
            client.send_location(sample).unwrap();
        }
        client.disconnect().unwrap();

        tokio::time::timeout(
            Duration::from_secs(20),
            client.wait_for_state(TransportState::Disconnected),
        )
        .await
        .expect("disconnect stuck behind a stalled write")
        .unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_keeps_original_credential() {
        let (listener, mut config) = local_relay().await;
        config.transport.base_delay = Duration::from_millis(10);
        let client = RelayClient::new(config);

        client.connect("first").unwrap();
        let (relay, token) = accept(&listener).await;
        assert_eq!(token, "first");
        wait_for(&client, TransportState::Connected).await;

        // Ignored: already connected
        client.connect("second").unwrap();
        drop(relay);

        let (_relay, token) = tokio::time::timeout(Duration::from_secs(5), accept(&listener))
            .await
            .expect("no reconnect");
        assert_eq!(token, "first");
    }
}
