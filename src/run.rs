//! Measurement run model: samples, abort flag and terminal status.

use crate::device::DeviceDescriptor;
use crate::error::DaqError;
use crate::metadata::{generate_run_id, RunMetadata};
use crate::sequence::CompiledSequence;
use crate::units::Unit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Why a running measurement is asked to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    UserRequested,
    ErrorDetected,
}

/// Persisted tri-state abort marker. Always serialized as `"none"`, `"user"` or `"error"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortFlag {
    #[default]
    None,
    User,
    Error,
}

impl AbortFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            AbortFlag::None => "none",
            AbortFlag::User => "user",
            AbortFlag::Error => "error",
        }
    }
}

impl fmt::Display for AbortFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AbortFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AbortFlag::None),
            "user" => Ok(AbortFlag::User),
            "error" => Ok(AbortFlag::Error),
            other => Err(format!("invalid abort flag '{other}'")),
        }
    }
}

impl From<AbortReason> for AbortFlag {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::UserRequested => AbortFlag::User,
            AbortReason::ErrorDetected => AbortFlag::Error,
        }
    }
}

/// Terminal outcome of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Aborted,
    Faulted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasuredValue {
    pub value: f64,
    pub unit: Unit,
}

/// One acquired data point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Zero-based acquisition index.
    pub index: u64,
    /// Monotonic nanoseconds since the run's origin.
    pub timestamp_ns: u64,
    /// Keyed `"<device>/<channel>"`.
    pub values: BTreeMap<String, MeasuredValue>,
}

impl Sample {
    pub fn channel_key(device: &str, channel: &str) -> String {
        format!("{device}/{channel}")
    }
}

/// A detector and the channels read back from it for every sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorBinding {
    pub device: String,
    pub channels: Vec<String>,
    /// Fire the detector's trigger before reading.
    #[serde(default)]
    pub trigger: bool,
}

impl DetectorBinding {
    pub fn new(device: impl Into<String>, channels: &[&str]) -> Self {
        Self {
            device: device.into(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            trigger: false,
        }
    }

    pub fn triggered(mut self) -> Self {
        self.trigger = true;
        self
    }
}

/// One execution of a measurement, from arm to terminal state.
///
/// Owned by the orchestrator while running and handed back to the caller afterwards.
#[derive(Clone, Debug)]
pub struct MeasurementRun {
    pub run_id: String,
    pub metadata: RunMetadata,
    /// Device id of the pulse generator.
    pub generator: String,
    pub detectors: Vec<DetectorBinding>,
    /// Descriptor snapshot taken at arm time.
    pub devices: Vec<DeviceDescriptor>,
    pub sequence: Option<CompiledSequence>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub abort_flag: AbortFlag,
    pub status: Option<RunStatus>,
    /// Human-readable reason attached to the terminal state.
    pub reason: Option<String>,
    pub samples: Vec<Sample>,
}

impl MeasurementRun {
    pub fn new(metadata: RunMetadata, generator: impl Into<String>) -> Self {
        Self {
            run_id: generate_run_id(&metadata.name, Utc::now()),
            metadata,
            generator: generator.into(),
            detectors: Vec::new(),
            devices: Vec::new(),
            sequence: None,
            start_time: None,
            stop_time: None,
            abort_flag: AbortFlag::None,
            status: None,
            reason: None,
            samples: Vec::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_detector(mut self, binding: DetectorBinding) -> Self {
        self.detectors.push(binding);
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    /// Record the terminal state.
    pub fn finish(&mut self, status: RunStatus, flag: AbortFlag, reason: String) {
        self.status = Some(status);
        self.abort_flag = flag;
        self.reason = Some(reason);
    }
}

/// Turn a run-ending error into the reason string kept with the run.
pub(crate) fn fault_reason(err: &DaqError) -> String {
    crate::diagnostics::FailureReport::from_error(err).to_string()
}
