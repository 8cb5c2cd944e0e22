//! Data recorder: streams samples of a run into a record file.
//!
//! Records live at `<root>/<measurement-type>/<YYYY-MM-DD>/<run-id>.<ext>`. The header is
//! written by [`DataRecorder::open`], every sample is appended and flushed immediately,
//! and [`DataRecorder::finalize`] seals the record with the stop time and abort flag.
//! Nothing is written to a record after it has been finalized.

pub mod record;

use crate::error::{AppResult, DaqError};
use crate::metadata::{sanitize, software_revision};
use crate::run::{AbortFlag, MeasurementRun, RunStatus, Sample};
use chrono::Utc;
use record::{is_finalized, Finalization, RecordHeader, COLUMNS, FINALIZE_PREFIX, HEADER_PREFIX};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub use record::{RunRecord, SCHEMA_VERSION};

pub const DEFAULT_EXTENSION: &str = "csv";

/// Open record of one run. Owned by the acquisition worker until finalized.
#[derive(Debug)]
pub struct RecordHandle {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    next_index: u64,
    finalized: bool,
}

impl RecordHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of samples persisted so far; also the index the next append must carry.
    pub fn samples_written(&self) -> u64 {
        self.next_index
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Writes run records below a root directory.
#[derive(Clone, Debug)]
pub struct DataRecorder {
    root: PathBuf,
    extension: String,
    revision: String,
}

impl DataRecorder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            revision: software_revision(None),
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Target path for `run`.
    pub fn record_path(&self, run: &MeasurementRun) -> PathBuf {
        let date = run.start_time.unwrap_or_else(Utc::now).format("%Y-%m-%d");
        self.root
            .join(sanitize(&run.metadata.measurement_type))
            .join(date.to_string())
            .join(format!("{}.{}", sanitize(&run.run_id), self.extension))
    }

    /// Create the record file and write its header.
    ///
    /// A finalized record at the same path is a conflict. An incomplete one is stale
    /// (left behind by a crash) and is replaced.
    pub fn open(&self, run: &MeasurementRun) -> AppResult<RecordHandle> {
        let path = self.record_path(run);
        if path.exists() {
            if is_finalized(&path) {
                return Err(DaqError::PathConflict(path));
            }
            warn!(path = %path.display(), "Replacing stale incomplete record");
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let header = RecordHeader {
            schema_version: SCHEMA_VERSION,
            software_revision: self.revision.clone(),
            run_id: run.run_id.clone(),
            name: run.metadata.name.clone(),
            measurement_type: run.metadata.measurement_type.clone(),
            start_time: run.start_time.unwrap_or_else(Utc::now),
            devices: run.devices.clone(),
            sequence: run.sequence.as_ref().map(|s| s.summary()),
            parameters: run.metadata.parameters.clone(),
            comments: run.metadata.comments.clone(),
            sweep: run.metadata.sweep.clone(),
            observables: run.metadata.observables.clone(),
            script: run.metadata.script.clone(),
        };

        let mut file = File::create(&path)?;
        writeln!(file, "{}{}", HEADER_PREFIX, serde_json::to_string(&header)?)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(COLUMNS)?;
        writer.flush()?;

        info!(run_id = %run.run_id, path = %path.display(), "Opened run record");
        Ok(RecordHandle {
            path,
            writer: Some(writer),
            next_index: 0,
            finalized: false,
        })
    }

    /// Persist one sample. The Nth call must carry acquisition index N.
    pub fn append(&self, handle: &mut RecordHandle, sample: &Sample) -> AppResult<()> {
        if handle.finalized {
            return Err(DaqError::InvalidState(format!(
                "record {} is finalized",
                handle.path.display()
            )));
        }
        if sample.index != handle.next_index {
            return Err(DaqError::OutOfOrder {
                expected: handle.next_index,
                got: sample.index,
            });
        }
        if sample.values.is_empty() {
            return Err(DaqError::RecordFormat {
                path: handle.path.clone(),
                reason: format!("sample {} carries no values", sample.index),
            });
        }
        let writer = handle
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::InvalidState("record is closed".to_string()))?;

        for (channel, measured) in &sample.values {
            writer.write_record([
                sample.index.to_string(),
                sample.timestamp_ns.to_string(),
                channel.clone(),
                measured.value.to_string(),
                measured.unit.symbol().to_string(),
            ])?;
        }
        writer.flush()?;
        handle.next_index += 1;
        debug!(index = sample.index, "Appended sample");
        Ok(())
    }

    /// Seal the record with the run's stop time, abort flag and status.
    ///
    /// Calling this again on a finalized handle does nothing.
    pub fn finalize(&self, handle: &mut RecordHandle, run: &MeasurementRun) -> AppResult<()> {
        if handle.finalized {
            debug!(path = %handle.path.display(), "Record already finalized");
            return Ok(());
        }
        let status = run.status.ok_or_else(|| {
            DaqError::InvalidState(format!("run {} has no terminal status", run.run_id))
        })?;
        let finalization = Finalization {
            stop_time: run.stop_time.unwrap_or_else(Utc::now),
            abort_flag: run.abort_flag,
            status,
            reason: run.reason.clone().unwrap_or_else(|| default_reason(status)),
            sample_count: handle.next_index,
        };

        let mut writer = handle
            .writer
            .take()
            .ok_or_else(|| DaqError::InvalidState("record is closed".to_string()))?;
        writer.flush()?;
        let mut file = writer.into_inner().map_err(|e| e.into_error())?;
        writeln!(
            file,
            "{}{}",
            FINALIZE_PREFIX,
            serde_json::to_string(&finalization)?
        )?;
        file.sync_all()?;
        handle.finalized = true;

        info!(
            run_id = %run.run_id,
            abort_flag = %finalization.abort_flag,
            samples = finalization.sample_count,
            "Finalized run record"
        );
        Ok(())
    }

    /// Seal a record whose writer is gone, e.g. after the acquisition worker died.
    ///
    /// The samples already on disk are kept and counted; the run is marked faulted with
    /// abort flag `error`. A record that is already finalized is left untouched.
    pub fn seal_interrupted(&self, path: &Path, reason: &str) -> AppResult<()> {
        if is_finalized(path) {
            debug!(path = %path.display(), "Record already finalized");
            return Ok(());
        }
        let partial = RunRecord::load(path)?;
        let finalization = Finalization {
            stop_time: Utc::now(),
            abort_flag: AbortFlag::Error,
            status: RunStatus::Faulted,
            reason: reason.to_string(),
            sample_count: partial.samples.len() as u64,
        };
        let mut file = OpenOptions::new().append(true).open(path)?;
        writeln!(
            file,
            "{}{}",
            FINALIZE_PREFIX,
            serde_json::to_string(&finalization)?
        )?;
        file.sync_all()?;
        warn!(
            run_id = %partial.header.run_id,
            samples = finalization.sample_count,
            "Sealed interrupted run record"
        );
        Ok(())
    }
}

fn default_reason(status: RunStatus) -> String {
    match status {
        RunStatus::Completed => "all samples acquired".to_string(),
        RunStatus::Aborted => "aborted".to_string(),
        RunStatus::Faulted => "device fault".to_string(),
    }
}
