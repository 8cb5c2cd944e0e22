//! On-disk record format and reader.
//!
//! A record is a CSV file in long form, one row per (sample, channel):
//!
//! ```text
//! # header {"schema_version":1,"software_revision":"v0.3.0-4-gdeadbee",...}
//! index,timestamp_ns,channel,value,unit
//! 0,1200,det/signal,0.12,V
//! 0,1200,det/counts,1,counts
//! ...
//! # finalize {"stop_time":"...","abort_flag":"none","status":"completed",...}
//! ```
//!
//! A file without the `# finalize` line is incomplete.

use crate::device::DeviceDescriptor;
use crate::error::{AppResult, DaqError};
use crate::metadata::ScriptProvenance;
use crate::run::{AbortFlag, MeasuredValue, RunStatus, Sample};
use crate::sequence::SequenceSummary;
use crate::sweep::{Observable, Sweep};
use crate::units::Unit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: u32 = 1;
pub(crate) const HEADER_PREFIX: &str = "# header ";
pub(crate) const FINALIZE_PREFIX: &str = "# finalize ";
pub(crate) const COLUMNS: [&str; 5] = ["index", "timestamp_ns", "channel", "value", "unit"];

/// Written once when the record is opened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub schema_version: u32,
    pub software_revision: String,
    pub run_id: String,
    pub name: String,
    pub measurement_type: String,
    pub start_time: DateTime<Utc>,
    pub devices: Vec<DeviceDescriptor>,
    pub sequence: Option<SequenceSummary>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub sweep: Sweep,
    #[serde(default)]
    pub observables: Vec<Observable>,
    #[serde(default)]
    pub script: Option<ScriptProvenance>,
}

/// Written exactly once, by finalize.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finalization {
    pub stop_time: DateTime<Utc>,
    pub abort_flag: AbortFlag,
    pub status: RunStatus,
    pub reason: String,
    pub sample_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Row {
    pub index: u64,
    pub timestamp_ns: u64,
    pub channel: String,
    pub value: f64,
    pub unit: Unit,
}

/// A record read back from disk.
#[derive(Clone, Debug)]
pub struct RunRecord {
    pub path: PathBuf,
    pub header: RecordHeader,
    pub finalization: Option<Finalization>,
    pub samples: Vec<Sample>,
}

impl RunRecord {
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let malformed = |reason: String| DaqError::RecordFormat {
            path: path.to_path_buf(),
            reason,
        };

        let mut header = None;
        let mut finalization = None;
        for line in text.lines() {
            if let Some(json) = line.strip_prefix(HEADER_PREFIX) {
                header = Some(serde_json::from_str::<RecordHeader>(json)?);
            } else if let Some(json) = line.strip_prefix(FINALIZE_PREFIX) {
                if finalization.is_some() {
                    return Err(malformed("finalized more than once".to_string()));
                }
                finalization = Some(serde_json::from_str::<Finalization>(json)?);
            }
        }
        let header = header.ok_or_else(|| malformed("missing header line".to_string()))?;

        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .from_reader(text.as_bytes());
        let mut samples: Vec<Sample> = Vec::new();
        for row in reader.deserialize::<Row>() {
            let row = row?;
            let value = MeasuredValue {
                value: row.value,
                unit: row.unit,
            };
            match samples.last_mut() {
                Some(last) if last.index == row.index => {
                    last.values.insert(row.channel, value);
                }
                _ => {
                    let expected = samples.len() as u64;
                    if row.index != expected {
                        return Err(malformed(format!(
                            "sample {} found where {expected} was expected",
                            row.index
                        )));
                    }
                    samples.push(Sample {
                        index: row.index,
                        timestamp_ns: row.timestamp_ns,
                        values: BTreeMap::from([(row.channel, value)]),
                    });
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            finalization,
            samples,
        })
    }

    /// True once the stop time and abort flag have been written.
    pub fn is_complete(&self) -> bool {
        self.finalization.is_some()
    }

    pub fn abort_flag(&self) -> Option<AbortFlag> {
        self.finalization.as_ref().map(|f| f.abort_flag)
    }
}

/// Whether `path` holds a finalized record. Unreadable files count as incomplete.
pub(crate) fn is_finalized(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|text| text.lines().any(|line| line.starts_with(FINALIZE_PREFIX)))
        .unwrap_or(false)
}
