//! Relay Server: authenticated WebSocket upgrade, per-connection tasks and
//! the authorization-graph REST reads

use super::liveness::{self, LivenessMonitor, ProbeAction, SERVER_PROBE_INTERVAL};
use super::protocol::{ClientMessage, RelayMessage};
use super::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
use super::router::FanoutRouter;
use crate::identity::{Identity, IdentityVerifier, PublicProfile, Role};
use futures::stream::SplitSink;
use futures::{Future, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Interval between transport-level liveness probes
    pub probe_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            probe_interval: SERVER_PROBE_INTERVAL,
        }
    }
}

/// Relay server error types
#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("Failed to bind relay listener: {0}")]
    Bind(String),
}

#[derive(Debug, Error)]
enum WriteError {
    #[error("socket write failed: {0}")]
    Socket(#[from] warp::Error),
    #[error("peer stopped reading")]
    Stalled,
}

type WsSink = SplitSink<WebSocket, Message>;

/// Write one frame, giving up after `limit`.
///
/// A peer that stops reading eventually fills its TCP window; without the
/// limit the connection task would sit in this write and never see a probe tick.
async fn write_frame(ws_tx: &mut WsSink, message: Message, limit: Duration) -> Result<(), WriteError> {
    match tokio::time::timeout(limit, ws_tx.send(message)).await {
        Ok(result) => result.map_err(WriteError::from),
        Err(_) => Err(WriteError::Stalled),
    }
}

#[derive(Debug, Deserialize)]
struct UpgradeQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

/// The location relay.
///
/// Cheap to clone; every clone shares one registry.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayServerConfig,
    verifier: IdentityVerifier,
    registry: Arc<ConnectionRegistry>,
    router: FanoutRouter,
}

impl RelayServer {
    /// Create a relay with default configuration
    pub fn new(verifier: IdentityVerifier) -> Self {
        Self::with_config(verifier, RelayServerConfig::default())
    }

    /// Create a relay with custom configuration
    pub fn with_config(verifier: IdentityVerifier, config: RelayServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            config,
            verifier,
            router: FanoutRouter::new(Arc::clone(&registry)),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    // ========================================================================
    // ROUTES
    // ========================================================================

    /// All HTTP routes: `/ws`, `/health` and the `/api` reads
    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone + Send + Sync + 'static {
        let server = self.clone();
        let with_server = warp::any().map(move || server.clone());
        let bearer = warp::header::optional::<String>("authorization");

        // 1. WebSocket upgrade at /ws?token=...
        let ws_route = warp::path("ws")
            .and(warp::path::end())
            .and(warp::ws())
            .and(warp::query::<UpgradeQuery>())
            .and(with_server.clone())
            .and_then(handle_upgrade)
            .boxed();

        // 2. Health check
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .map(|server: RelayServer| {
                warp::reply::json(&HealthResponse {
                    status: "ok",
                    connections: server.registry.len(),
                })
            })
            .boxed();

        // 3. Caller's own profile
        let profile_route = warp::path!("api" / "profile")
            .and(warp::get())
            .and(bearer.clone())
            .and(with_server.clone())
            .and_then(handle_profile)
            .boxed();

        // 4. Linked patient (guardians and doctors)
        let patient_info_route = warp::path!("api" / "patient" / "patient-info")
            .and(warp::get())
            .and(bearer.clone())
            .and(with_server.clone())
            .and_then(handle_patient_info)
            .boxed();

        // 5. Linked guardians and doctors (patients)
        let linked_route = warp::path!("api" / "patient" / "linked-guardians")
            .and(warp::get())
            .and(bearer)
            .and(with_server)
            .and_then(handle_linked_guardians)
            .boxed();

        let cors = warp::cors()
            .allow_any_origin()
            .allow_headers(vec!["authorization", "content-type"])
            .allow_methods(vec!["GET"]);

        ws_route
            .or(health_route)
            .or(profile_route)
            .or(patient_info_route)
            .or(linked_route)
            .with(cors)
    }

    /// Bind and serve until `shutdown` resolves.
    ///
    /// Returns the bound address (useful with port 0) and the server future.
    pub fn bind(
        &self,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(SocketAddr, impl Future<Output = ()> + 'static), RelayServerError> {
        let (bound, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(addr, shutdown)
            .map_err(|e| RelayServerError::Bind(e.to_string()))?;
        info!(%bound, "Relay listening");
        Ok((bound, server))
    }

    // ========================================================================
    // CONNECTION HANDLING
    // ========================================================================

    /// Drive one admitted connection until it closes.
    ///
    /// Inbound frames, outbound frames and liveness probes are multiplexed on
    /// this single task, so closing the socket for any reason always ends in
    /// exactly one unregister and drops the probe timer with it. Every write
    /// is bounded by the probe interval.
    async fn serve_connection(self, socket: WebSocket, identity: Identity) {
        let (handle, mut outbound) = ConnectionHandle::open(identity);
        let (mut ws_tx, mut ws_rx) = socket.split();

        info!(
            user = %handle.user_id(),
            name = %handle.identity().name,
            role = %handle.identity().role,
            connection = handle.id(),
            "Relay connection opened"
        );

        self.registry.register(handle.clone());
        handle.send(RelayMessage::Connected {
            user_id: handle.user_id().to_string(),
            role: handle.identity().role,
        });

        let mut monitor = LivenessMonitor::new();
        let mut probe = liveness::ticker(self.config.probe_interval);
        let write_limit = self.config.probe_interval;

        loop {
            tokio::select! {
                inbound = ws_rx.next() => match inbound {
                    Some(Ok(msg)) => {
                        monitor.record_activity();
                        if msg.is_close() {
                            break;
                        }
                        if let Ok(text) = msg.to_str() {
                            self.handle_frame(&handle, text);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(user = %handle.user_id(), error = %e, "Relay socket error");
                        break;
                    }
                    None => break,
                },
                out = outbound.recv() => match out {
                    Some(Outbound::Frame(message)) => match message.to_json() {
                        Ok(json) => {
                            if let Err(e) = write_frame(&mut ws_tx, Message::text(json), write_limit).await {
                                warn!(user = %handle.user_id(), error = %e, "Relay send failed");
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping unserializable frame"),
                    },
                    Some(Outbound::Close(reason)) => {
                        let _ = write_frame(&mut ws_tx, Message::close_with(1000u16, reason), write_limit).await;
                        break;
                    }
                    None => break,
                },
                _ = probe.tick() => match monitor.on_tick() {
                    ProbeAction::SendProbe => {
                        if let Err(e) = write_frame(&mut ws_tx, Message::ping(Vec::new()), write_limit).await {
                            warn!(user = %handle.user_id(), error = %e, "Liveness probe failed");
                            break;
                        }
                    }
                    ProbeAction::Expire => {
                        info!(user = %handle.user_id(), "Liveness probe unanswered, dropping connection");
                        break;
                    }
                },
            }
        }

        self.registry.unregister(handle.user_id(), handle.id());
        let _ = tokio::time::timeout(write_limit, ws_tx.close()).await;

        info!(
            user = %handle.user_id(),
            connection = handle.id(),
            "Relay connection closed"
        );
    }

    /// Handle one inbound text frame. Malformed frames are logged and dropped.
    fn handle_frame(&self, handle: &ConnectionHandle, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(ClientMessage::LocationUpdate { coordinates }) => {
                self.router.route_location(handle, coordinates);
            }
            Ok(ClientMessage::Ping) => {
                handle.send(RelayMessage::Pong);
            }
            Ok(ClientMessage::Pong) => {
                debug!(user = %handle.user_id(), "pong");
            }
            Err(e) => {
                warn!(user = %handle.user_id(), error = %e, "Ignoring malformed relay frame");
            }
        }
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn handle_upgrade(
    ws: Ws,
    query: UpgradeQuery,
    server: RelayServer,
) -> Result<warp::reply::Response, Rejection> {
    match server.verifier.verify(query.token.as_deref()).await {
        Ok(identity) => {
            Ok(ws.on_upgrade(move |socket| server.serve_connection(socket, identity)).into_response())
        }
        Err(e) => {
            info!(error = %e, "WebSocket upgrade rejected");
            Ok(error_reply(StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
    }
}

async fn handle_profile(
    authorization: Option<String>,
    server: RelayServer,
) -> Result<warp::reply::Response, Rejection> {
    let caller = match server.verifier.verify_bearer(authorization.as_deref()).await {
        Ok(identity) => identity,
        Err(_) => return Ok(error_reply(StatusCode::UNAUTHORIZED, "Not authorized")),
    };
    Ok(warp::reply::json(&caller).into_response())
}

async fn handle_patient_info(
    authorization: Option<String>,
    server: RelayServer,
) -> Result<warp::reply::Response, Rejection> {
    let caller = match server.verifier.verify_bearer(authorization.as_deref()).await {
        Ok(identity) => identity,
        Err(_) => return Ok(error_reply(StatusCode::UNAUTHORIZED, "Not authorized")),
    };

    if !caller.role.is_caregiver() {
        return Ok(error_reply(StatusCode::FORBIDDEN, "Access denied"));
    }

    let patient_id = match caller.linked_patient_id.as_deref() {
        Some(id) => id,
        None => return Ok(error_reply(StatusCode::BAD_REQUEST, "No linked patient found")),
    };

    match server.verifier.store().find_by_id(patient_id).await {
        Some(patient) => Ok(warp::reply::json(&patient.patient_info()).into_response()),
        None => Ok(error_reply(StatusCode::NOT_FOUND, "Patient not found")),
    }
}

async fn handle_linked_guardians(
    authorization: Option<String>,
    server: RelayServer,
) -> Result<warp::reply::Response, Rejection> {
    let caller = match server.verifier.verify_bearer(authorization.as_deref()).await {
        Ok(identity) => identity,
        Err(_) => return Ok(error_reply(StatusCode::UNAUTHORIZED, "Not authorized")),
    };

    if caller.role != Role::Patient {
        return Ok(error_reply(StatusCode::FORBIDDEN, "Access denied"));
    }

    let guardians: Vec<PublicProfile> = server
        .verifier
        .store()
        .linked_to(&caller.id)
        .await
        .iter()
        .map(Identity::public_profile)
        .collect();

    Ok(warp::reply::json(&guardians).into_response())
}

fn error_reply(status: StatusCode, message: &str) -> warp::reply::Response {
    let body = warp::reply::json(&ErrorBody {
        message: message.to_string(),
    });
    warp::reply::with_status(body, status).into_response()
}

// ============================================================================
// TESTS
// ============================================================================
