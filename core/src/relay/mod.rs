//! Location relay
//!
//! Admits authenticated WebSocket connections, keeps one live connection per
//! identity and fans each location update out along the patient/caregiver
//! relationship graph.

pub mod liveness;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use liveness::{LivenessMonitor, ProbeAction, CLIENT_PING_INTERVAL, SERVER_PROBE_INTERVAL};
pub use protocol::{ClientMessage, PositionSample, RelayMessage, RelayProtocolError, CONFIRMATION_TEXT};
pub use registry::{ConnectionHandle, ConnectionRegistry, Outbound};
pub use router::{FanoutReport, FanoutRouter};
pub use server::{RelayServer, RelayServerConfig, RelayServerError};
