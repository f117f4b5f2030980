//! Common types, enums, and error definitions for the FTMS treadmill daemon

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for treadmill operations
pub type Result<T> = std::result::Result<T, FtmsError>;

/// Error types for treadmill communication and workout parsing
#[derive(Error, Debug)]
pub enum FtmsError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Discovery cancelled")]
    Cancelled,

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(String),

    #[error("Command write failed: {0}")]
    CommandWrite(String),

    #[error("Frame too short: need {needed} bytes, got {got}")]
    TruncatedFrame { needed: usize, got: usize },

    #[error("Malformed XML: {0}")]
    MalformedXml(String),

    #[error("Missing <{0}> element")]
    MissingElement(&'static str),

    #[error("Invalid step line: {0}")]
    InvalidStep(String),

    #[error("Unknown duration unit in \"{0}\", must be 'm' or 's'")]
    UnknownDurationUnit(String),

    #[error("Invalid pace \"{0}\", expected mm:ss")]
    InvalidPace(String),

    #[error("Pace percentage must be positive, got {0}")]
    NonPositivePercentage(i64),

    #[error("Interval block \"{0}\" has no steps")]
    EmptyIntervalBlock(String),

    #[error("No valid workout steps found")]
    EmptyWorkout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection state of a fitness machine backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Transient failure state, auto-reverts to Disconnected
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Connecting => write!(f, "Connecting"),
            ConnectionStatus::Connected => write!(f, "Connected"),
            ConnectionStatus::Error => write!(f, "Error"),
        }
    }
}

/// One live telemetry reading from the treadmill
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySample {
    /// Belt speed in km/h
    pub speed_kmh: f64,
    /// Incline in percent grade
    pub incline_pct: f64,
    /// Accumulated distance in km, non-decreasing while connected
    pub distance_km: f64,
    /// Heart rate in bpm, when a heart-rate characteristic is available
    pub heart_rate_bpm: Option<u16>,
}

impl Default for TelemetrySample {
    fn default() -> Self {
        Self {
            speed_kmh: 0.0,
            incline_pct: 0.0,
            distance_km: 0.0,
            heart_rate_bpm: None,
        }
    }
}

/// Callback invoked with each decoded or synthesized telemetry sample
pub type TelemetryCallback = Arc<dyn Fn(&TelemetrySample) + Send + Sync>;

/// Callback invoked when the connection status changes
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionStatus::Error.to_string(), "Error");
    }

    #[test]
    fn test_default_sample_is_zeroed() {
        let sample = TelemetrySample::default();
        assert_eq!(sample.speed_kmh, 0.0);
        assert_eq!(sample.distance_km, 0.0);
        assert!(sample.heart_rate_bpm.is_none());
    }
}
