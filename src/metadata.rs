//! Run metadata and provenance.
//!
//! `RunMetadata` captures what a measurement is (name, measurement type), the free-form
//! parameters and comments a script attaches to it, and the software revision that
//! produced the data. It is built with [`RunMetadataBuilder`] when the run is created
//! and copied into the record header, so every record can be traced back to the exact
//! code and settings that wrote it.
//!
//! ## Run ids
//!
//! Run ids default to `<HHMMSS>_<name>_<8 hex>`: sortable within a day directory,
//! readable, and unique thanks to the random suffix.
//!
//! ## Software revision
//!
//! Resolved once per process, in order: explicit override (configuration), the
//! `PULSE_DAQ_REVISION` environment variable, `git describe --tags --always`, and
//! finally the crate version.
//!
//! ## Script provenance
//!
//! A run may also carry the script that drove it: its path, full source and the git
//! hash and tag of the repository it lives in (see [`ScriptProvenance::capture`]).

use crate::error::AppResult;
use crate::sweep::{Observable, Sweep, SweepAxis};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;
use uuid::Uuid;

/// Environment variable that pins the recorded software revision.
pub const REVISION_ENV: &str = "PULSE_DAQ_REVISION";

/// Descriptive metadata of one measurement run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    /// Human-readable run name.
    pub name: String,
    /// Measurement type; the first directory level of the record layout.
    pub measurement_type: String,
    /// User-defined parameters (e.g. sweep range, sample id).
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Free-text notes.
    pub comments: String,
    #[serde(default)]
    pub sweep: Sweep,
    #[serde(default)]
    pub observables: Vec<Observable>,
    #[serde(default)]
    pub script: Option<ScriptProvenance>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            name: "measurement".to_string(),
            measurement_type: "generic".to_string(),
            parameters: BTreeMap::new(),
            comments: String::new(),
            sweep: Sweep::default(),
            observables: Vec::new(),
            script: None,
        }
    }
}

impl RunMetadata {
    pub fn builder() -> RunMetadataBuilder {
        RunMetadataBuilder::default()
    }

    /// Validates the metadata.
    pub fn validate(&self) -> Result<(), String> {
        if sanitize(&self.name).is_empty() {
            return Err("Run name cannot be empty.".to_string());
        }
        if sanitize(&self.measurement_type).is_empty() {
            return Err("Measurement type cannot be empty.".to_string());
        }
        self.sweep.validate()?;
        let mut names = HashSet::new();
        for observable in &self.observables {
            if observable.name.trim().is_empty() {
                return Err("Observable name cannot be empty.".to_string());
            }
            if !names.insert(observable.name.as_str()) {
                return Err(format!("Observable '{}' is declared twice.", observable.name));
            }
        }
        Ok(())
    }
}

/// A builder for constructing `RunMetadata` instances.
#[derive(Default)]
pub struct RunMetadataBuilder {
    inner: RunMetadata,
}

impl RunMetadataBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.inner.name = name.to_string();
        self
    }

    pub fn measurement_type(mut self, measurement_type: &str) -> Self {
        self.inner.measurement_type = measurement_type.to_string();
        self
    }

    pub fn parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.inner.parameters.insert(key.to_string(), value);
        self
    }

    pub fn comments(mut self, comments: &str) -> Self {
        self.inner.comments = comments.to_string();
        self
    }

    pub fn sweep_axis(mut self, axis: SweepAxis) -> Self {
        self.inner.sweep.axes.push(axis);
        self
    }

    pub fn observable(mut self, observable: Observable) -> Self {
        self.inner.observables.push(observable);
        self
    }

    pub fn script(mut self, script: ScriptProvenance) -> Self {
        self.inner.script = Some(script);
        self
    }

    pub fn build(self) -> RunMetadata {
        self.inner
    }
}

/// Reduce `raw` to a file-system safe token: ASCII alphanumerics, `-` and `_`.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Build a run id of the form `<HHMMSS>_<name>_<8 hex>`.
pub fn generate_run_id(name: &str, at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    let name = match sanitize(name) {
        n if n.is_empty() => "run".to_string(),
        n => n,
    };
    format!("{}_{}_{}", at.format("%H%M%S"), name, &suffix[..8])
}

/// Resolve the revision tag written into every record header.
pub fn software_revision(override_tag: Option<&str>) -> String {
    if let Some(tag) = override_tag.map(str::trim).filter(|t| !t.is_empty()) {
        return tag.to_string();
    }
    if let Ok(tag) = std::env::var(REVISION_ENV) {
        if !tag.trim().is_empty() {
            return tag.trim().to_string();
        }
    }
    match git_describe() {
        Some(tag) => tag,
        None => format!("v{}", env!("CARGO_PKG_VERSION")),
    }
}

fn git_describe() -> Option<String> {
    git_output(None, &["describe", "--tags", "--always", "--dirty"])
}

fn git_output(dir: Option<&Path>, args: &[&str]) -> Option<String> {
    let mut command = Command::new("git");
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    let output = command
        .args(args)
        .output()
        .map_err(|e| debug!("git not available: {}", e))
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let tag = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!tag.is_empty()).then_some(tag)
}

/// The script that drove a run, as it was when the run started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptProvenance {
    pub path: PathBuf,
    pub source: String,
    /// Short commit hash of the repository containing the script.
    #[serde(default)]
    pub git_hash: Option<String>,
    /// Nearest tag of that commit.
    #[serde(default)]
    pub git_tag: Option<String>,
}

impl ScriptProvenance {
    /// Read the script at `path` and ask git about the directory it lives in.
    /// Outside a repository both git fields are `None`.
    pub fn capture(path: &Path) -> AppResult<Self> {
        let source = fs::read_to_string(path)?;
        let path = path.canonicalize()?;
        let dir = path.parent();
        Ok(Self {
            git_hash: git_output(dir, &["rev-parse", "--short", "HEAD"]),
            git_tag: git_output(dir, &["describe", "--tags"]),
            path,
            source,
        })
    }
}
