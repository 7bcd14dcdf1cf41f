//! Fanout router: maps a sender's position to the parties allowed to see it

use super::protocol::{PositionSample, RelayMessage};
use super::registry::{ConnectionHandle, ConnectionRegistry};
use crate::identity::{Identity, Role};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::debug;

/// Outcome of routing one inbound location update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    /// Recipients the relationship graph allows and who are connected
    pub recipients: usize,
    /// Of those, how many still had a live connection task
    pub delivered: usize,
}

/// Routes location updates along relationship edges only
#[derive(Debug, Clone)]
pub struct FanoutRouter {
    registry: Arc<ConnectionRegistry>,
}

impl FanoutRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Connected identities entitled to the sender's position
    pub fn recipients(&self, sender: &Identity) -> Vec<ConnectionHandle> {
        match sender.role {
            Role::Patient => self.registry.for_each(|u| u.is_linked_to(&sender.id)),
            Role::Guardian | Role::Doctor => sender
                .linked_patient_id
                .as_deref()
                .and_then(|patient_id| self.registry.lookup(patient_id))
                .into_iter()
                .collect(),
        }
    }

    /// Fan a position out to every recipient, then confirm to the sender.
    ///
    /// Delivery only enqueues onto each recipient's own channel, so a slow
    /// socket never holds up the others or the confirmation. Recipients that
    /// are offline simply miss the update.
    pub fn route_location(&self, sender: &ConnectionHandle, coordinates: PositionSample) -> FanoutReport {
        let identity = sender.identity();
        let message = RelayMessage::LocationUpdate {
            user_id: identity.id.clone(),
            user_name: identity.name.clone(),
            role: identity.role,
            coordinates,
            timestamp: server_timestamp(),
        };

        let recipients = self.recipients(identity);
        let delivered = recipients
            .iter()
            .filter(|recipient| recipient.send(message.clone()))
            .count();

        debug!(
            sender = %identity.id,
            role = %identity.role,
            recipients = recipients.len(),
            delivered,
            "Location update fanned out"
        );

        sender.send(RelayMessage::confirmation());

        FanoutReport {
            recipients: recipients.len(),
            delivered,
        }
    }
}

/// Relay clock, RFC 3339 UTC with millisecond precision
pub fn server_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// TESTS
// ============================================================================
