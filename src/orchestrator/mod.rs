//! Measurement orchestrator: arms a run, drives the acquisition loop and seals the record.
//!
//! # State machine
//!
//! ```text
//! Idle --arm--> Armed --start--> Running --+--> Completed
//!  ^              |                        +--> Aborted
//!  +---abort------+                        +--> Faulted
//! ```
//!
//! A terminal state accepts a new `arm`. One run is active at a time.
//!
//! # Acquisition loop
//!
//! `start` hands the armed run to a spawned worker so the caller never waits on hardware.
//! For every played segment the worker checks the abort signal, triggers and reads the
//! bound detectors, stamps the sample with a monotonic clock, appends it to the record and
//! publishes it as a [`RunEvent`]. Wall-clock time is taken only at start and stop.

pub mod abort;

use crate::device::{Capability, ConnectionState, DeviceDescriptor, DeviceRegistry};
use crate::error::{AppResult, DaqError};
use crate::recorder::DataRecorder;
use crate::run::{
    fault_reason, AbortFlag, AbortReason, MeasuredValue, MeasurementRun, RunStatus, Sample,
};
use crate::sequence::{compile, CompiledSequence, PulseSequence, Slot, TargetCapabilities};
use crate::units::Unit;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub use abort::AbortSignal;

const EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Armed,
    Running,
    Completed,
    Aborted,
    Faulted,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::Aborted | EngineState::Faulted
        )
    }
}

impl From<RunStatus> for EngineState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => EngineState::Completed,
            RunStatus::Aborted => EngineState::Aborted,
            RunStatus::Faulted => EngineState::Faulted,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Armed => "armed",
            EngineState::Running => "running",
            EngineState::Completed => "completed",
            EngineState::Aborted => "aborted",
            EngineState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// How the loop spaces acquisitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Wait for each segment's nominal end before the next acquisition.
    #[default]
    Nominal,
    /// Acquire back to back; the generator runs on its own clock.
    FreeRunning,
}

/// Published by a running measurement.
#[derive(Clone, Debug, PartialEq)]
pub enum RunEvent {
    Sample(Sample),
    Finished { status: RunStatus, reason: String },
}

/// Everything a finished run hands back to its caller.
#[derive(Debug)]
pub struct RunOutcome {
    pub run: MeasurementRun,
    pub status: RunStatus,
    /// The device error that faulted the run.
    pub fault: Option<DaqError>,
    /// First recording failure, if persisting fell behind the in-memory run.
    pub recording_error: Option<DaqError>,
    pub record_path: Option<PathBuf>,
}

/// Caller's side of a started run.
pub struct RunHandle {
    signal: AbortSignal,
    events: broadcast::Sender<RunEvent>,
    first_receiver: Option<broadcast::Receiver<RunEvent>>,
    task: JoinHandle<RunOutcome>,
    cleanup: Cleanup,
}

/// What `join` needs to tidy up after a worker that died without finishing.
struct Cleanup {
    run_id: String,
    generator: String,
    record_path: PathBuf,
    registry: Arc<DeviceRegistry>,
    recorder: Arc<DataRecorder>,
    state: Arc<watch::Sender<EngineState>>,
}

impl RunHandle {
    /// Event stream of the run. The first call sees every event since start.
    pub fn subscribe(&mut self) -> broadcast::Receiver<RunEvent> {
        self.first_receiver
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    /// Ask the loop to stop before the next acquisition.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.signal.request(reason)
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to reach its terminal state.
    ///
    /// If the worker died (panicked or was cancelled) the generator is stopped, the
    /// partial record is sealed as faulted and the engine returns to idle.
    pub async fn join(self) -> AppResult<RunOutcome> {
        match self.task.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let cleanup = self.cleanup;
                let reason = format!("acquisition worker failed: {e}");
                error!(run_id = %cleanup.run_id, %reason, "Run ended without finishing");
                if let Err(stop_err) = cleanup.registry.stop_program(&cleanup.generator).await {
                    warn!(device = %cleanup.generator, error = %stop_err, "Could not stop pulse program");
                }
                if let Err(seal_err) = cleanup
                    .recorder
                    .seal_interrupted(&cleanup.record_path, &reason)
                {
                    warn!(path = %cleanup.record_path.display(), error = %seal_err, "Could not seal record");
                }
                cleanup.state.send_replace(EngineState::Idle);
                Err(DaqError::InvalidState(reason))
            }
        }
    }
}

struct ArmedRun {
    run: MeasurementRun,
    program: CompiledSequence,
}

/// Runs measurements against the devices of one registry.
pub struct Orchestrator {
    registry: Arc<DeviceRegistry>,
    recorder: Arc<DataRecorder>,
    state: Arc<watch::Sender<EngineState>>,
    armed: Mutex<Option<ArmedRun>>,
    active: Mutex<Option<AbortSignal>>,
    pacing: Pacing,
    max_duration: Option<Duration>,
}

impl Orchestrator {
    pub fn new(registry: Arc<DeviceRegistry>, recorder: Arc<DataRecorder>) -> Self {
        let (state, _rx) = watch::channel(EngineState::Idle);
        Self {
            registry,
            recorder,
            state: Arc::new(state),
            armed: Mutex::new(None),
            active: Mutex::new(None),
            pacing: Pacing::default(),
            max_duration: None,
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Apply a time window on top of what generators declare themselves.
    pub fn with_max_duration(mut self, limit: Option<Duration>) -> Self {
        self.max_duration = limit;
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Compile `sequence` for the generator `generator`. Touches no hardware.
    pub async fn compile_for(
        &self,
        generator: &str,
        sequence: &PulseSequence,
    ) -> AppResult<CompiledSequence> {
        let descriptor = self.registry.descriptor(generator).await?;
        let mut target = TargetCapabilities::from_descriptor(&descriptor);
        if let Some(limit) = self.max_duration {
            target = target.with_max_duration(limit);
        }
        compile(sequence, &target)
    }

    /// Bind devices and load `program` onto the run's generator.
    ///
    /// Every precondition is checked before the first device call. If loading fails the
    /// generator is reset and the orchestrator stays idle.
    pub async fn arm(&self, mut run: MeasurementRun, program: CompiledSequence) -> AppResult<()> {
        let state = self.state();
        if state != EngineState::Idle && !state.is_terminal() {
            return Err(DaqError::InvalidState(format!("cannot arm while {state}")));
        }
        run.metadata.validate().map_err(DaqError::Arm)?;

        let generator = self.bound_descriptor(&run.generator).await?;
        check_generator(&generator, &program)?;
        let mut devices = vec![generator];
        for binding in &run.detectors {
            let detector = self.bound_descriptor(&binding.device).await?;
            for channel in &binding.channels {
                let spec = detector
                    .resolve_channel(channel)
                    .map_err(|e| DaqError::Arm(e.to_string()))?;
                if !spec.capability.is_readable() {
                    return Err(DaqError::Arm(format!(
                        "{}: channel '{channel}' cannot be read",
                        detector.id
                    )));
                }
            }
            if binding.trigger && !detector.has_capability(Capability::TriggerInput) {
                return Err(DaqError::Arm(format!(
                    "{}: device has no trigger input",
                    detector.id
                )));
            }
            if !devices.iter().any(|d| d.id == detector.id) {
                devices.push(detector);
            }
        }

        for observable in &run.metadata.observables {
            let Some(key) = &observable.channel else { continue };
            if !records_channel(&run, &program, key) {
                return Err(DaqError::Arm(format!(
                    "observable '{}' reads '{key}', which this run does not record",
                    observable.name
                )));
            }
        }

        if let Err(e) = self.registry.load_program(&run.generator, &program).await {
            if let Err(reset_err) = self.registry.reset(&run.generator).await {
                warn!(device = %run.generator, error = %reset_err, "Reset after failed load also failed");
            }
            self.state.send_replace(EngineState::Idle);
            return Err(DaqError::Arm(format!(
                "loading program onto '{}' failed: {e}",
                run.generator
            )));
        }

        run.devices = devices;
        run.sequence = Some(program.clone());
        info!(run_id = %run.run_id, generator = %run.generator, "Run armed");
        *self.armed.lock().await = Some(ArmedRun { run, program });
        self.state.send_replace(EngineState::Armed);
        Ok(())
    }

    async fn bound_descriptor(&self, id: &str) -> AppResult<DeviceDescriptor> {
        let descriptor = self
            .registry
            .descriptor(id)
            .await
            .map_err(|e| DaqError::Arm(e.to_string()))?;
        if descriptor.state != ConnectionState::Connected {
            return Err(DaqError::Arm(format!("{id}: device is {}", descriptor.state)));
        }
        Ok(descriptor)
    }

    /// Start the armed run on a worker task.
    pub async fn start(&self) -> AppResult<RunHandle> {
        let armed = self
            .armed
            .lock()
            .await
            .take()
            .ok_or_else(|| DaqError::InvalidState(format!("cannot start while {}", self.state())))?;

        let ArmedRun { mut run, program } = armed;
        run.start_time = Some(Utc::now());
        let cleanup = Cleanup {
            run_id: run.run_id.clone(),
            generator: run.generator.clone(),
            record_path: self.recorder.record_path(&run),
            registry: Arc::clone(&self.registry),
            recorder: Arc::clone(&self.recorder),
            state: Arc::clone(&self.state),
        };

        let signal = AbortSignal::new();
        *self.active.lock().await = Some(signal.clone());
        let (events, first_receiver) = broadcast::channel(EVENT_CAPACITY);
        self.state.send_replace(EngineState::Running);

        let worker = Acquisition {
            registry: Arc::clone(&self.registry),
            recorder: Arc::clone(&self.recorder),
            state: Arc::clone(&self.state),
            signal: signal.clone(),
            events: events.clone(),
            pacing: self.pacing,
        };
        let task = tokio::spawn(worker.run(run, program));

        Ok(RunHandle {
            signal,
            events,
            first_receiver: Some(first_receiver),
            task,
            cleanup,
        })
    }

    /// Abort the current run, or disarm an armed one.
    pub async fn abort(&self, reason: AbortReason) -> AppResult<()> {
        match self.state() {
            EngineState::Running => {
                if let Some(signal) = self.active.lock().await.as_ref() {
                    signal.request(reason);
                }
                Ok(())
            }
            EngineState::Armed => {
                let armed = self.armed.lock().await.take();
                // Disarmed even if the reset below fails.
                self.state.send_replace(EngineState::Idle);
                if let Some(armed) = armed {
                    info!(run_id = %armed.run.run_id, "Run disarmed");
                    self.registry.reset(&armed.run.generator).await?;
                }
                Ok(())
            }
            state => Err(DaqError::InvalidState(format!("nothing to abort while {state}"))),
        }
    }
}

fn check_generator(generator: &DeviceDescriptor, program: &CompiledSequence) -> AppResult<()> {
    if !generator.has_capability(Capability::PulseGeneration) {
        return Err(DaqError::Arm(format!(
            "{}: device cannot play pulse programs",
            generator.id
        )));
    }
    let outputs: Vec<&str> = generator.output_channels().map(|c| c.name.as_str()).collect();
    if let Some(missing) = program
        .channel_names()
        .iter()
        .find(|name| !outputs.contains(&name.as_str()))
    {
        return Err(DaqError::Arm(format!(
            "{}: program drives unknown channel '{missing}'",
            generator.id
        )));
    }
    Ok(())
}

/// State owned by the acquisition worker for one run.
struct Acquisition {
    registry: Arc<DeviceRegistry>,
    recorder: Arc<DataRecorder>,
    state: Arc<watch::Sender<EngineState>>,
    signal: AbortSignal,
    events: broadcast::Sender<RunEvent>,
    pacing: Pacing,
}

impl Acquisition {
    async fn run(self, mut run: MeasurementRun, program: CompiledSequence) -> RunOutcome {
        let origin = Instant::now();
        info!(run_id = %run.run_id, expected = ?program.expected_samples(), "Run started");

        let mut recording_error = None;
        let mut record = match self.recorder.open(&run) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Could not open record; keeping samples in memory");
                recording_error = Some(e);
                None
            }
        };
        let mut persisting = record.is_some();

        let mut fault = None;
        let mut abort = None;
        let mut last_ts = None;

        if let Err(e) = self.registry.start_program(&run.generator).await {
            fault = Some(e);
        } else {
            for slot in program.schedule() {
                if let Some(reason) = self.signal.requested() {
                    abort = Some(reason);
                    break;
                }
                let values = match self.acquire(&run, &program, &slot).await {
                    Ok(values) => values,
                    Err(e) => {
                        error!(run_id = %run.run_id, index = slot.index, error = %e, "Device fault during run");
                        fault = Some(e);
                        break;
                    }
                };
                let sample = Sample {
                    index: slot.index,
                    timestamp_ns: next_timestamp(origin, &mut last_ts),
                    values,
                };

                if let (true, Some(handle)) = (persisting, record.as_mut()) {
                    if let Err(e) = self.recorder.append(handle, &sample) {
                        error!(run_id = %run.run_id, index = sample.index, error = %e, "Recording failed; continuing in memory");
                        recording_error.get_or_insert(e);
                        persisting = false;
                    }
                }
                // No subscribers is fine.
                let _ = self.events.send(RunEvent::Sample(sample.clone()));
                run.samples.push(sample);

                if self.pacing == Pacing::Nominal {
                    tokio::select! {
                        _ = sleep_until(origin + slot.end) => {}
                        _ = self.signal.cancelled() => {}
                    }
                }
            }
        }

        if let Err(e) = self.registry.stop_program(&run.generator).await {
            warn!(device = %run.generator, error = %e, "Could not stop pulse program");
        }

        let span = origin
            .elapsed()
            .max(Duration::from_nanos(last_ts.unwrap_or(0)));
        let start = run.start_time.unwrap_or_else(Utc::now);
        let span = chrono::Duration::from_std(span).unwrap_or_else(|_| chrono::Duration::zero());
        run.stop_time = Some(start + span);

        let (status, flag, mut reason) = match (&fault, abort) {
            (Some(err), _) => (RunStatus::Faulted, AbortFlag::Error, fault_reason(err)),
            (None, Some(reason)) => (
                RunStatus::Aborted,
                AbortFlag::from(reason),
                match reason {
                    AbortReason::UserRequested => "aborted by user request".to_string(),
                    AbortReason::ErrorDetected => "aborted after an error was reported".to_string(),
                },
            ),
            (None, None) => (
                RunStatus::Completed,
                AbortFlag::None,
                format!("{} samples acquired", run.samples.len()),
            ),
        };
        if let Some(e) = &recording_error {
            reason = format!("{reason}; recording failed: {e}");
        }
        if status != RunStatus::Completed {
            self.release(&run).await;
        }
        run.finish(status, flag, reason.clone());

        let record_path = record.as_ref().map(|h| h.path().to_path_buf());
        if let Some(handle) = record.as_mut() {
            if let Err(e) = self.recorder.finalize(handle, &run) {
                error!(run_id = %run.run_id, error = %e, "Could not finalize record");
                recording_error.get_or_insert(e);
            }
        }

        info!(run_id = %run.run_id, %status, abort_flag = %flag, samples = run.samples.len(), "Run finished");
        self.state.send_replace(EngineState::from(status));
        let _ = self.events.send(RunEvent::Finished {
            status,
            reason: reason.clone(),
        });

        RunOutcome {
            run,
            status,
            fault,
            recording_error,
            record_path,
        }
    }

    /// Return the run's detectors to their default state after an abort or fault.
    /// Faulted devices are left as they are so the caller can inspect them.
    async fn release(&self, run: &MeasurementRun) {
        for id in run
            .devices
            .iter()
            .map(|d| d.id.as_str())
            .filter(|id| *id != run.generator)
        {
            match self.registry.state(id).await {
                Ok(ConnectionState::Connected) => {
                    if let Err(e) = self.registry.reset(id).await {
                        warn!(device = %id, error = %e, "Could not release device");
                    }
                }
                Ok(state) => debug!(device = %id, %state, "Not releasing device"),
                Err(e) => warn!(device = %id, error = %e, "Unknown device on release"),
            }
        }
    }

    /// Trigger and read every bound detector for one played segment.
    async fn acquire(
        &self,
        run: &MeasurementRun,
        program: &CompiledSequence,
        slot: &Slot,
    ) -> AppResult<BTreeMap<String, MeasuredValue>> {
        let mut values = BTreeMap::new();
        let segment = &program.segments()[slot.segment];
        for (name, state) in program.channel_names().iter().zip(&segment.states) {
            values.insert(
                Sample::channel_key(&run.generator, name),
                MeasuredValue {
                    value: state.level(),
                    unit: Unit::Dimensionless,
                },
            );
        }
        for binding in &run.detectors {
            if binding.trigger {
                self.registry.trigger(&binding.device).await?;
            }
            for channel in &binding.channels {
                let reading = self.registry.read(&binding.device, channel).await?;
                values.insert(
                    Sample::channel_key(&binding.device, channel),
                    MeasuredValue {
                        value: reading.value,
                        unit: reading.unit,
                    },
                );
            }
        }
        debug!(index = slot.index, segment = slot.segment, channels = values.len(), "Acquired sample");
        Ok(values)
    }
}

fn records_channel(run: &MeasurementRun, program: &CompiledSequence, key: &str) -> bool {
    let generated = program
        .channel_names()
        .iter()
        .any(|name| Sample::channel_key(&run.generator, name) == key);
    generated
        || run.detectors.iter().any(|binding| {
            binding
                .channels
                .iter()
                .any(|channel| Sample::channel_key(&binding.device, channel) == key)
        })
}

/// Monotonic nanoseconds since `origin`, forced strictly above the previous stamp.
fn next_timestamp(origin: Instant, last: &mut Option<u64>) -> u64 {
    let now = u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
    let ts = match *last {
        Some(prev) if now <= prev => prev + 1,
        _ => now,
    };
    *last = Some(ts);
    ts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let origin = Instant::now();
        let mut last = None;
        let stamps: Vec<u64> = (0..1000).map(|_| next_timestamp(origin, &mut last)).collect();
        assert!(stamps.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn engine_state_from_status() {
        assert_eq!(EngineState::from(RunStatus::Aborted), EngineState::Aborted);
        assert!(EngineState::Faulted.is_terminal());
        assert!(!EngineState::Armed.is_terminal());
        assert_eq!(EngineState::Running.to_string(), "running");
    }
}
