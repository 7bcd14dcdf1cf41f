//! Relay wire protocol: JSON frames exchanged over the `/ws` socket

use crate::identity::Role;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Text carried by every `locationConfirmation` frame
pub const CONFIRMATION_TEXT: &str = "Location update received";

/// A single position fix as produced by the client's position producer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Reported accuracy radius in metres
    pub accuracy: f64,
    /// When the fix was taken (milliseconds since the Unix epoch)
    pub timestamp: u64,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, timestamp: u64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            timestamp,
        }
    }

    /// Flat-earth distance in degrees between two fixes.
    ///
    /// Only meaningful at small scales; used for displacement gating.
    pub fn planar_distance(&self, other: &PositionSample) -> f64 {
        let dlat = self.latitude - other.latitude;
        let dlng = self.longitude - other.longitude;
        (dlat * dlat + dlng * dlng).sqrt()
    }
}

/// Frames sent by the relay (and understood by the client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    /// Sent once, right after the connection is admitted
    #[serde(rename_all = "camelCase")]
    Connected { user_id: String, role: Role },
    /// A linked party's position, stamped by the relay
    #[serde(rename_all = "camelCase")]
    LocationUpdate {
        user_id: String,
        user_name: String,
        role: Role,
        coordinates: PositionSample,
        /// Server-assigned RFC 3339 timestamp
        timestamp: String,
    },
    /// Acknowledges one inbound `locationUpdate` after fanout
    LocationConfirmation { message: String },
    Ping,
    Pong,
}

/// Frames sent by a client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// The sender's latest position
    LocationUpdate { coordinates: PositionSample },
    Ping,
    Pong,
}

/// Protocol encode/decode errors
#[derive(Debug, Error)]
pub enum RelayProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

impl RelayMessage {
    pub fn confirmation() -> Self {
        RelayMessage::LocationConfirmation {
            message: CONFIRMATION_TEXT.to_string(),
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, RelayProtocolError> {
        serde_json::to_string(self).map_err(|e| RelayProtocolError::SerializationError(e.to_string()))
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, RelayProtocolError> {
        serde_json::from_str(text).map_err(|e| RelayProtocolError::MalformedMessage(e.to_string()))
    }

    /// Get a human-readable description of the message type
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::Connected { .. } => "connected",
            RelayMessage::LocationUpdate { .. } => "locationUpdate",
            RelayMessage::LocationConfirmation { .. } => "locationConfirmation",
            RelayMessage::Ping => "ping",
            RelayMessage::Pong => "pong",
        }
    }
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, RelayProtocolError> {
        serde_json::to_string(self).map_err(|e| RelayProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, RelayProtocolError> {
        serde_json::from_str(text).map_err(|e| RelayProtocolError::MalformedMessage(e.to_string()))
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::LocationUpdate { .. } => "locationUpdate",
            ClientMessage::Ping => "ping",
            ClientMessage::Pong => "pong",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
