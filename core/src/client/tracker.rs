// Linked-party view: last known position of everyone the relay forwards to us

use super::TransportEvent;
use crate::identity::Role;
use crate::relay::protocol::{PositionSample, RelayMessage};
use std::collections::HashMap;

/// Latest position received for one linked party
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedPosition {
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
    pub coordinates: PositionSample,
    /// Relay timestamp of the update
    pub received_at: String,
}

/// Last-writer-wins map of sender id → latest update
#[derive(Debug, Default)]
pub struct LinkedPositions {
    own_id: Option<String>,
    latest: HashMap<String, LinkedPosition>,
}

impl LinkedPositions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates carrying this id are ignored
    pub fn with_own_id(own_id: impl Into<String>) -> Self {
        Self {
            own_id: Some(own_id.into()),
            latest: HashMap::new(),
        }
    }

    /// Apply one relay frame. Returns true if the view changed.
    pub fn apply(&mut self, message: &RelayMessage) -> bool {
        match message {
            RelayMessage::Connected { user_id, .. } => {
                self.own_id = Some(user_id.clone());
                false
            }
            RelayMessage::LocationUpdate {
                user_id,
                user_name,
                role,
                coordinates,
                timestamp,
            } => {
                if self.own_id.as_deref() == Some(user_id.as_str()) {
                    return false;
                }
                self.latest.insert(
                    user_id.clone(),
                    LinkedPosition {
                        user_id: user_id.clone(),
                        user_name: user_name.clone(),
                        role: *role,
                        coordinates: *coordinates,
                        received_at: timestamp.clone(),
                    },
                );
                true
            }
            _ => false,
        }
    }

    /// Apply a transport event; only `Message` events matter
    pub fn apply_event(&mut self, event: &TransportEvent) -> bool {
        match event {
            TransportEvent::Message(message) => self.apply(message),
            _ => false,
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&LinkedPosition> {
        self.latest.get(user_id)
    }

    /// All known parties, ordered by id
    pub fn all(&self) -> Vec<&LinkedPosition> {
        let mut all: Vec<&LinkedPosition> = self.latest.values().collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        all
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Forget everything (explicit disconnect)
    pub fn clear(&mut self) {
        self.latest.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(user_id: &str, lat: f64) -> RelayMessage {
        RelayMessage::LocationUpdate {
            user_id: user_id.to_string(),
            user_name: format!("name-{}", user_id),
            role: Role::Guardian,
            coordinates: PositionSample::new(lat, 0.0, 3.0, 1),
            timestamp: "2024-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_last_writer_wins() {
        let mut view = LinkedPositions::new();
        assert!(view.apply(&update("g1", 1.0)));
        assert!(view.apply(&update("g1", 2.0)));
        assert!(view.apply(&update("g2", 3.0)));
        assert_eq!(view.len(), 2);
        assert_eq!(view.get("g1").unwrap().coordinates.latitude, 2.0);
        let ids: Vec<&str> = view.all().iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["g1", "g2"]);
    }

    #[test]
    fn test_own_updates_ignored() {
        let mut view = LinkedPositions::new();
        view.apply(&RelayMessage::Connected {
            user_id: "p1".to_string(),
            role: Role::Patient,
        });
        assert!(!view.apply(&update("p1", 1.0)));
        assert!(view.is_empty());
    }

    #[test]
    fn test_other_frames_and_events_ignored() {
        let mut view = LinkedPositions::with_own_id("p1");
        assert!(!view.apply(&RelayMessage::confirmation()));
        assert!(!view.apply_event(&TransportEvent::Opened));
        assert!(view.apply_event(&TransportEvent::Message(update("g1", 1.0))));
        view.clear();
        assert!(view.is_empty());
    }
}
