//! Configuration loading using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `PULSE_DAQ_`, nested keys split on `__`
//!
//! ```text
//! PULSE_DAQ_APPLICATION__LOG_LEVEL=debug
//! PULSE_DAQ_STORAGE__ROOT=/data/records
//! PULSE_DAQ_SEQUENCE__MAX_DURATION_NS=1000000000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pulse_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/pulse_daq.toml").unwrap();
//! println!("Records go to {}", settings.storage.root.display());
//! ```

use crate::device::{
    Capability, ChannelSpec, DeviceDescriptor, DeviceKind, DEFAULT_DEVICE_TIMEOUT,
};
use crate::error::{AppResult, DaqError};
use crate::sequence::TemplateParams;
use crate::units::Unit;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/pulse_daq.toml";
pub const ENV_PREFIX: &str = "PULSE_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub sequence: SequenceSettings,
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationSettings {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "pulse_daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Where and how run records are written
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSettings {
    pub root: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Pins the software revision written into record headers.
    #[serde(default)]
    pub revision_tag: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            extension: default_extension(),
            revision_tag: None,
        }
    }
}

/// Pulse sequence defaults and limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceSettings {
    /// Hardware time window applied on top of what generators declare.
    #[serde(default)]
    pub max_duration_ns: Option<u64>,
    #[serde(default = "default_template_duration_ns")]
    pub default_template_duration_ns: u64,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            max_duration_ns: None,
            default_template_duration_ns: default_template_duration_ns(),
        }
    }
}

impl SequenceSettings {
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ns.map(Duration::from_nanos)
    }

    pub fn default_template_duration(&self) -> Duration {
        Duration::from_nanos(self.default_template_duration_ns)
    }

    /// Template parameters for `channel_count` channels at the configured default duration.
    pub fn template_params(&self, channel_count: usize) -> TemplateParams {
        TemplateParams::new(channel_count).with_duration(self.default_template_duration())
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceDefinition {
    pub id: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_sequence_duration_ns: Option<u64>,
    #[serde(default)]
    pub features: Vec<Capability>,
    #[serde(default)]
    pub channels: Vec<ChannelDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelDefinition {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    pub capability: Capability,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub unit: Option<Unit>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_extension() -> String {
    crate::recorder::DEFAULT_EXTENSION.to_string()
}

fn default_template_duration_ns() -> u64 {
    1_000
}

fn default_timeout_ms() -> u64 {
    DEFAULT_DEVICE_TIMEOUT.as_millis() as u64
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Settings {
    /// Load from the default path and environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` (which may be missing) merged with defaults and environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Checks:
    /// - log level is one of trace, debug, info, warn, error
    /// - storage root and extension are non-empty
    /// - device ids are unique and timeouts non-zero
    /// - channel names are unique within a device
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.storage.root.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "storage.root must not be empty".to_string(),
            ));
        }
        if self.storage.extension.trim_start_matches('.').is_empty() {
            return Err(DaqError::Configuration(
                "storage.extension must not be empty".to_string(),
            ));
        }
        if self.sequence.default_template_duration_ns == 0 {
            return Err(DaqError::Configuration(
                "sequence.default_template_duration_ns must be positive".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(device.id.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate device ID: '{}'",
                    device.id
                )));
            }
            if device.timeout_ms == 0 {
                return Err(DaqError::Configuration(format!(
                    "Device '{}' has a zero timeout",
                    device.id
                )));
            }
            let mut names = HashSet::new();
            for channel in &device.channels {
                let aliases = channel.alias.iter().map(String::as_str);
                for name in std::iter::once(channel.name.as_str()).chain(aliases) {
                    if !names.insert(name) {
                        return Err(DaqError::Configuration(format!(
                            "Device '{}' declares channel '{}' twice",
                            device.id, name
                        )));
                    }
                }
                if let (Some(min), Some(max)) = (channel.min, channel.max) {
                    if min > max {
                        return Err(DaqError::Configuration(format!(
                            "Device '{}' channel '{}': min {} > max {}",
                            device.id, channel.name, min, max
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl DeviceDefinition {
    /// Build the descriptor this definition describes.
    pub fn descriptor(&self) -> DeviceDescriptor {
        let mut descriptor =
            DeviceDescriptor::new(&self.id, &self.vendor, &self.model, self.kind)
                .with_timeout(Duration::from_millis(self.timeout_ms));
        if let Some(ns) = self.max_sequence_duration_ns {
            descriptor = descriptor.with_max_sequence_duration(Duration::from_nanos(ns));
        }
        for feature in &self.features {
            descriptor = descriptor.with_feature(*feature);
        }
        for channel in &self.channels {
            descriptor = descriptor.with_channel(channel.spec());
        }
        descriptor
    }
}

impl ChannelDefinition {
    fn spec(&self) -> ChannelSpec {
        let mut spec = ChannelSpec::new(
            &self.name,
            self.capability,
            self.unit.unwrap_or(Unit::Dimensionless),
        );
        if let Some(alias) = &self.alias {
            spec = spec.with_alias(alias);
        }
        if self.min.is_some() || self.max.is_some() {
            spec = spec.with_range(
                self.min.unwrap_or(f64::MIN),
                self.max.unwrap_or(f64::MAX),
            );
        }
        spec
    }
}
