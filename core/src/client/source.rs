// Position sources: where the producer gets its readings from

use super::producer::AcquisitionError;
use crate::relay::protocol::PositionSample;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::warn;

/// Anything that yields position readings
#[async_trait]
pub trait PositionSource: Send {
    /// Next reading, or `None` once the source is exhausted
    async fn next_reading(&mut self) -> Option<Result<PositionSample, AcquisitionError>>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Line {
    Failure {
        error: AcquisitionError,
    },
    #[serde(rename_all = "camelCase")]
    Reading {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        accuracy: f64,
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

/// Reads one JSON object per line.
///
/// A line is either a reading
/// `{"latitude":..,"longitude":..,"accuracy":..,"timestamp":..}` (accuracy and
/// timestamp optional) or a failure `{"error":"timeout"}`. Blank lines are
/// skipped; anything unparseable counts as an unknown failure.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    pace: Option<Duration>,
    started: bool,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            pace: None,
            started: false,
        }
    }

    /// Wait `pace` between readings, for replaying a recorded track
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> PositionSource for JsonLinesSource<R> {
    async fn next_reading(&mut self) -> Option<Result<PositionSample, AcquisitionError>> {
        if let Some(pace) = self.pace {
            if self.started {
                tokio::time::sleep(pace).await;
            }
        }
        self.started = true;

        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "Position input failed");
                    return None;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return Some(match serde_json::from_str::<Line>(line) {
                Ok(Line::Reading {
                    latitude,
                    longitude,
                    accuracy,
                    timestamp,
                }) => Ok(PositionSample::new(
                    latitude,
                    longitude,
                    accuracy,
                    timestamp.unwrap_or_else(now_millis),
                )),
                Ok(Line::Failure { error }) => Err(error),
                Err(e) => {
                    warn!(error = %e, "Unparseable position line");
                    Err(AcquisitionError::Unknown)
                }
            });
        }
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
