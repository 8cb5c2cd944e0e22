//! Capability-described device abstraction.
//!
//! Hardware of every kind (pulse generators, detectors, stages) is described by a
//! [`DeviceDescriptor`] and driven through the [`DeviceDriver`] trait. The engine never
//! depends on a vendor protocol: it only sees the capability-typed channel surface.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator --> DeviceRegistry --[per-device Mutex]--> Box<dyn DeviceDriver>
//! ```
//!
//! Every call for one device funnels through that device's lock, so a driver is never
//! invoked concurrently with itself. Each call is bounded by the device's timeout.

pub mod mock;
pub mod registry;

use crate::error::{AppResult, DaqError};
use crate::sequence::CompiledSequence;
use crate::units::Unit;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use registry::DeviceRegistry;

/// Default bound on a single driver call.
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(5);

/// A declared hardware function a device advertises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    DigitalOutput,
    AnalogOutput,
    DigitalInput,
    AnalogInput,
    Counter,
    /// Device acquires on an explicit trigger.
    TriggerInput,
    /// Device can load and stream a compiled pulse sequence.
    PulseGeneration,
    Motion,
}

impl Capability {
    /// Channel capabilities that accept `write`.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Capability::DigitalOutput | Capability::AnalogOutput | Capability::Motion
        )
    }

    /// Channel capabilities that answer `read`.
    pub fn is_readable(self) -> bool {
        matches!(
            self,
            Capability::DigitalInput
                | Capability::AnalogInput
                | Capability::Counter
                | Capability::Motion
        )
    }
}

/// Broad device category, used for configuration and record headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    PulseGenerator,
    Detector,
    Actuator,
}

/// Connection lifecycle of a registered device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// A hardware fault was reported. Requires `reset` or a reconnect.
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Faulted => write!(f, "faulted"),
        }
    }
}

/// One hardware channel and the operation it supports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Hardware name (e.g. "D0").
    pub name: String,
    /// Optional user-facing alias (e.g. "laser").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub capability: Capability,
    /// Inclusive value range for analog channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(f64, f64)>,
    pub unit: Unit,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, capability: Capability, unit: Unit) -> Self {
        Self {
            name: name.into(),
            alias: None,
            capability,
            range: None,
            unit,
        }
    }

    pub fn digital_output(name: impl Into<String>) -> Self {
        Self::new(name, Capability::DigitalOutput, Unit::Dimensionless)
    }

    pub fn analog_output(name: impl Into<String>, min: f64, max: f64, unit: Unit) -> Self {
        Self::new(name, Capability::AnalogOutput, unit).with_range(min, max)
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    /// Whether `name` refers to this channel, by hardware name or alias.
    pub fn matches(&self, name: &str) -> bool {
        self.name == name || self.alias.as_deref() == Some(name)
    }

    /// Whether `value` lies inside the declared range (always true without one).
    pub fn accepts(&self, value: f64) -> bool {
        match self.range {
            Some((min, max)) => value.is_finite() && value >= min && value <= max,
            None => value.is_finite(),
        }
    }
}

/// Identity, capabilities and connection state of one device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Registry identity; unique within one registry.
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub kind: DeviceKind,
    pub channels: Vec<ChannelSpec>,
    /// Device-level capabilities that are not tied to a channel.
    #[serde(default)]
    pub features: BTreeSet<Capability>,
    /// Longest program the hardware can hold, if bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sequence_duration: Option<Duration>,
    #[serde(skip, default = "default_timeout")]
    pub timeout: Duration,
    pub state: ConnectionState,
}

fn default_timeout() -> Duration {
    DEFAULT_DEVICE_TIMEOUT
}

impl DeviceDescriptor {
    pub fn new(
        id: impl Into<String>,
        vendor: impl Into<String>,
        model: impl Into<String>,
        kind: DeviceKind,
    ) -> Self {
        Self {
            id: id.into(),
            vendor: vendor.into(),
            model: model.into(),
            kind,
            channels: Vec::new(),
            features: BTreeSet::new(),
            max_sequence_duration: None,
            timeout: DEFAULT_DEVICE_TIMEOUT,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn with_channel(mut self, channel: ChannelSpec) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn with_feature(mut self, capability: Capability) -> Self {
        self.features.insert(capability);
        self
    }

    pub fn with_max_sequence_duration(mut self, limit: Duration) -> Self {
        self.max_sequence_duration = Some(limit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Union of channel and device-level capabilities.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        self.channels
            .iter()
            .map(|c| c.capability)
            .chain(self.features.iter().copied())
            .collect()
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.features.contains(&capability)
            || self.channels.iter().any(|c| c.capability == capability)
    }

    /// Look up a channel by hardware name or alias.
    pub fn resolve_channel(&self, name: &str) -> AppResult<&ChannelSpec> {
        self.channels
            .iter()
            .find(|c| c.matches(name))
            .ok_or_else(|| DaqError::UnsupportedCapability {
                device: self.id.clone(),
                channel: name.to_string(),
                operation: "any operation (no such channel)".to_string(),
            })
    }

    /// Output channels in declaration order; the order a channel-state vector follows.
    pub fn output_channels(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(|c| {
            matches!(
                c.capability,
                Capability::DigitalOutput | Capability::AnalogOutput
            )
        })
    }
}

/// A value written to an output channel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelValue {
    Level(bool),
    Analog(f64),
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelValue::Level(level) => write!(f, "{}", u8::from(*level)),
            ChannelValue::Analog(value) => write!(f, "{value}"),
        }
    }
}

/// A value read back from an input channel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub unit: Unit,
}

/// Failure reported by a driver implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// Communication could not be established or was lost. Retrying may help.
    #[error("communication failed: {0}")]
    Communication(String),
    /// The hardware reported a fault.
    #[error("hardware fault: {0}")]
    Fault(String),
    /// The driver does not implement the requested operation.
    #[error("operation '{0}' is not supported")]
    Unsupported(String),
}

/// Result type returned by driver implementations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Contract every concrete device driver implements.
///
/// Drivers are only ever called through the [`DeviceRegistry`], which serializes
/// calls per device, enforces capabilities and applies the timeout. Operations a
/// device does not offer keep their default `Unsupported` implementation.
#[async_trait]
pub trait DeviceDriver: Send {
    async fn connect(&mut self) -> DriverResult<()>;

    async fn disconnect(&mut self) -> DriverResult<()>;

    /// Return the hardware to its default state.
    async fn reset(&mut self) -> DriverResult<()>;

    async fn write(&mut self, channel: &ChannelSpec, value: ChannelValue) -> DriverResult<()>;

    async fn read(&mut self, channel: &ChannelSpec) -> DriverResult<f64>;

    async fn trigger(&mut self) -> DriverResult<()> {
        Err(DriverError::Unsupported("trigger".to_string()))
    }

    async fn load_program(&mut self, _program: &CompiledSequence) -> DriverResult<()> {
        Err(DriverError::Unsupported("load_program".to_string()))
    }

    async fn start_program(&mut self) -> DriverResult<()> {
        Err(DriverError::Unsupported("start_program".to_string()))
    }

    async fn stop_program(&mut self) -> DriverResult<()> {
        Err(DriverError::Unsupported("stop_program".to_string()))
    }
}
