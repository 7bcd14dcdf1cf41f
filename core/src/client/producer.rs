//! Position producer: gates raw readings before they reach the relay
//!
//! A reading is emitted only if enough time has passed since the last
//! emission AND it moved far enough from the last emitted sample. Distance is
//! flat Euclidean on raw latitude/longitude degrees.

use super::source::PositionSource;
use super::transport::RelayClient;
use crate::relay::protocol::PositionSample;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a position reading could not be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AcquisitionError {
    #[error("Location access denied. Please enable location services.")]
    PermissionDenied,
    #[error("Location information is unavailable. Please check your device GPS or try again later.")]
    PositionUnavailable,
    #[error("Location request timed out. Please check your connection.")]
    Timeout,
    #[error("An unknown error occurred while getting location.")]
    Unknown,
}

/// Terminal producer failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProducerError {
    #[error("Stopped tracking after {0} consecutive location errors")]
    TooManyFailures(u32),
}

/// Gate settings
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Minimum time between emitted samples
    pub min_interval: Duration,
    /// Minimum planar displacement, in degrees
    pub min_displacement: f64,
    /// Consecutive acquisition failures before the producer stops
    pub max_consecutive_failures: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(2000),
            min_displacement: 0.00001,
            max_consecutive_failures: 3,
        }
    }
}

/// What subscribers see
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerEvent {
    /// A sample passed both gates
    Position(PositionSample),
    /// A reading failed; tracking continues unless followed by `Stopped`
    Error(AcquisitionError),
    Stopped(ProducerError),
}

pub struct PositionProducer {
    config: ProducerConfig,
    last_emitted: Option<(PositionSample, Instant)>,
    failures: u32,
    emitted: u64,
    stopped: bool,
    events: broadcast::Sender<ProducerEvent>,
}

impl PositionProducer {
    pub fn new(config: ProducerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            last_emitted: None,
            failures: 0,
            emitted: 0,
            stopped: false,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.events.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Samples that passed both gates so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn last_emitted(&self) -> Option<&PositionSample> {
        self.last_emitted.as_ref().map(|(sample, _)| sample)
    }

    /// Offer a successful reading taken at `now`.
    ///
    /// Returns the sample if it passes both gates. Any successful reading
    /// resets the failure count, emitted or not.
    pub fn offer_at(&mut self, sample: PositionSample, now: Instant) -> Option<PositionSample> {
        if self.stopped {
            return None;
        }
        self.failures = 0;

        if let Some((last, at)) = &self.last_emitted {
            if now.saturating_duration_since(*at) < self.config.min_interval {
                debug!("Position throttled (too frequent)");
                return None;
            }
            if sample.planar_distance(last) < self.config.min_displacement {
                debug!("Position throttled (not moved)");
                return None;
            }
        }

        self.last_emitted = Some((sample, now));
        self.emitted += 1;
        let _ = self.events.send(ProducerEvent::Position(sample));
        Some(sample)
    }

    pub fn offer(&mut self, sample: PositionSample) -> Option<PositionSample> {
        self.offer_at(sample, Instant::now())
    }

    /// Record a failed reading. Returns the terminal error once the
    /// threshold is reached.
    pub fn record_failure(&mut self, error: AcquisitionError) -> Result<(), ProducerError> {
        if self.stopped {
            return Err(ProducerError::TooManyFailures(self.failures));
        }
        self.failures += 1;
        warn!(error = %error, failures = self.failures, "Position error");
        let _ = self.events.send(ProducerEvent::Error(error));

        if self.failures >= self.config.max_consecutive_failures {
            self.stopped = true;
            let stop = ProducerError::TooManyFailures(self.failures);
            info!("Too many location errors, stopping tracking");
            let _ = self.events.send(ProducerEvent::Stopped(stop.clone()));
            return Err(stop);
        }
        Ok(())
    }

    /// Pull readings from `source` until it ends or the producer stops.
    ///
    /// Emitted samples go to `transport` as `locationUpdate` frames; they are
    /// queued there if the transport is not open.
    pub async fn run<S>(&mut self, source: &mut S, transport: Option<&RelayClient>) -> Result<(), ProducerError>
    where
        S: PositionSource + ?Sized,
    {
        while let Some(reading) = source.next_reading().await {
            match reading {
                Ok(sample) => {
                    if let Some(sample) = self.offer(sample) {
                        if let Some(client) = transport {
                            if let Err(e) = client.send_location(sample) {
                                warn!(error = %e, "Could not hand position to relay client");
                            }
                        }
                    }
                }
                Err(error) => self.record_failure(error)?,
            }
        }
        Ok(())
    }
}

impl Default for PositionProducer {
    fn default() -> Self {
        Self::new(ProducerConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
