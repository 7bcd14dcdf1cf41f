//! Relay client side: transport, position producer and the linked-party view

pub mod producer;
pub mod source;
pub mod state;
pub mod tracker;
pub mod transport;

pub use producer::{AcquisitionError, PositionProducer, ProducerConfig, ProducerError, ProducerEvent};
pub use source::{JsonLinesSource, PositionSource};
pub use state::{TransportConfig, TransportError, TransportMachine, TransportState};
pub use tracker::{LinkedPosition, LinkedPositions};
pub use transport::{RelayClient, RelayClientConfig, RelayClientError};

use crate::relay::protocol::RelayMessage;
use std::time::Duration;

/// Events published by the client transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport is open. Queued frames are written right after this event.
    Opened,
    /// A decoded frame from the relay
    Message(RelayMessage),
    /// The transport closed; `code` is absent for abnormal drops
    Closed { code: Option<u16> },
    /// A reconnect attempt is armed
    ReconnectScheduled { attempt: u32, delay: Duration },
    Error(TransportError),
}
