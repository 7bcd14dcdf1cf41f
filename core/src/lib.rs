// DriftGuard Core: real-time location relay
//
// Patients share where they are with the guardians and doctors linked to
// them, and nobody else. The relay stores nothing: a position that arrives
// while a recipient is offline is simply not delivered.

pub mod client;
pub mod identity;
pub mod relay;

pub use client::{
    JsonLinesSource, LinkedPositions, PositionProducer, PositionSource, RelayClient,
    RelayClientConfig, TransportEvent, TransportState,
};
pub use identity::{
    issue_credential, Identity, IdentityStore, IdentityVerifier, MemoryIdentityStore, Role,
};
pub use relay::{ClientMessage, PositionSample, RelayMessage, RelayServer, RelayServerConfig};
