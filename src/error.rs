//! Custom error types for the measurement engine.
//!
//! This module defines the primary error type, `DaqError`, shared by every layer of
//! the engine. Using the `thiserror` crate, it provides one consistent vocabulary for
//! failures, from sequence validation through hardware faults to recording I/O.
//!
//! ## Error Hierarchy
//!
//! - **Validation** (`SequenceValidation`, `UnknownTemplate`, `IncompatibleUnit`,
//!   `UnknownUnit`): rejected before any hardware action. The caller fixes the input.
//! - **Hardware** (`Connection`, `Timeout`, `DeviceFault`, `UnsupportedCapability`,
//!   `NotConnected`, `UnknownDevice`, `DuplicateDevice`): `Connection` is recoverable
//!   (retry is the caller's call), `DeviceFault` ends the current run but not the process.
//! - **Arming** (`Arm`, `InvalidState`): the run never starts and devices are reset.
//! - **Recording** (`PathConflict`, `OutOfOrder`, `RecordFormat`, `Io`, `Csv`, `Json`):
//!   surfaced to the caller, never retried automatically.
//! - **Configuration** (`Config`, `Configuration`): settings could not be loaded or are
//!   semantically invalid.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying I/O and
//! serialization errors with the `?` operator.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Device '{0}' is already registered")]
    DuplicateDevice(String),

    #[error("Device '{0}' is not registered")]
    UnknownDevice(String),

    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    #[error("{device}: could not connect. Error: '{message}'")]
    Connection { device: String, message: String },

    #[error("{device}: '{operation}' timed out after {timeout:?}")]
    Timeout {
        device: String,
        operation: String,
        timeout: Duration,
    },

    #[error("{device}: channel '{channel}' does not support {operation}")]
    UnsupportedCapability {
        device: String,
        channel: String,
        operation: String,
    },

    #[error("{device}: hardware fault: {message}")]
    DeviceFault { device: String, message: String },

    #[error("Sequence validation failed{}: {reason}", segment_suffix(.segment))]
    SequenceValidation {
        segment: Option<usize>,
        reason: String,
    },

    #[error("Unknown pulse template '{0}'")]
    UnknownTemplate(String),

    #[error("Cannot convert '{from}' to '{to}': incompatible dimensions")]
    IncompatibleUnit { from: String, to: String },

    #[error("Unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("Failed to arm measurement: {0}")]
    Arm(String),

    #[error("Invalid orchestrator state: {0}")]
    InvalidState(String),

    #[error("Record already exists at {}", .0.display())]
    PathConflict(PathBuf),

    #[error("Sample index {got} appended where {expected} was expected")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("Malformed run record {}: {reason}", .path.display())]
    RecordFormat { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn segment_suffix(segment: &Option<usize>) -> String {
    segment
        .map(|index| format!(" at segment {index}"))
        .unwrap_or_default()
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Shorthand for a validation failure pinned to one segment.
    pub fn segment(index: usize, reason: impl Into<String>) -> Self {
        DaqError::SequenceValidation {
            segment: Some(index),
            reason: reason.into(),
        }
    }

    /// Whether the caller may fix the input or retry and expect a different outcome.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::SequenceValidation { .. }
                | DaqError::UnknownTemplate(_)
                | DaqError::IncompatibleUnit { .. }
                | DaqError::UnknownUnit(_)
                | DaqError::Connection { .. }
                | DaqError::NotConnected(_)
                | DaqError::Configuration(_)
        )
    }

    /// Whether this error ends a running measurement as a hardware fault.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            DaqError::DeviceFault { .. } | DaqError::Timeout { .. }
        )
    }

    /// Short stable label for logs and run reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            DaqError::Config(_) | DaqError::Configuration(_) => "config",
            DaqError::SequenceValidation { .. }
            | DaqError::UnknownTemplate(_)
            | DaqError::IncompatibleUnit { .. }
            | DaqError::UnknownUnit(_) => "validation",
            DaqError::DuplicateDevice(_)
            | DaqError::UnknownDevice(_)
            | DaqError::NotConnected(_)
            | DaqError::UnsupportedCapability { .. } => "device",
            DaqError::Connection { .. } => "connection",
            DaqError::Timeout { .. } | DaqError::DeviceFault { .. } => "fault",
            DaqError::Arm(_) | DaqError::InvalidState(_) => "arm",
            DaqError::PathConflict(_)
            | DaqError::OutOfOrder { .. }
            | DaqError::RecordFormat { .. }
            | DaqError::Io(_)
            | DaqError::Csv(_)
            | DaqError::Json(_) => "recording",
        }
    }
}
