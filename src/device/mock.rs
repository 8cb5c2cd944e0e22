//! Mock devices that simulate a pulse generator and a triggered detector.
//!
//! Both drivers share a [`MockControl`] handle with the test or demo that created them,
//! so failures can be injected and every driver call inspected afterwards.
use super::{
    Capability, ChannelSpec, ChannelValue, DeviceDescriptor, DeviceDriver, DeviceKind,
    DriverError, DriverResult,
};
use crate::sequence::CompiledSequence;
use crate::units::Unit;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const NO_FAULT: u64 = u64::MAX;

#[derive(Default)]
struct ControlInner {
    connect_failures: AtomicU32,
    fail_load: AtomicBool,
    fail_start: AtomicBool,
    panic_on_read: AtomicBool,
    reads_before_fault: AtomicU64,
    reads: AtomicU64,
    latency_us: AtomicU64,
    calls: Mutex<Vec<String>>,
}

/// Failure injection and call inspection for mock drivers.
#[derive(Clone)]
pub struct MockControl {
    inner: Arc<ControlInner>,
}

impl Default for MockControl {
    fn default() -> Self {
        let control = Self {
            inner: Arc::new(ControlInner::default()),
        };
        control.clear_faults();
        control
    }
}

impl MockControl {
    /// Fail the next `n` connect attempts with a communication error.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_load(&self, fail: bool) {
        self.inner.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.inner.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make the next detector read panic inside the driver.
    pub fn panic_on_read(&self, panic: bool) {
        self.inner.panic_on_read.store(panic, Ordering::SeqCst);
    }

    /// Report a hardware fault once `n` more reads have succeeded.
    pub fn fault_after_reads(&self, n: u64) {
        let done = self.inner.reads.load(Ordering::SeqCst);
        self.inner
            .reads_before_fault
            .store(done.saturating_add(n), Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.inner.connect_failures.store(0, Ordering::SeqCst);
        self.inner.fail_load.store(false, Ordering::SeqCst);
        self.inner.fail_start.store(false, Ordering::SeqCst);
        self.inner.panic_on_read.store(false, Ordering::SeqCst);
        self.inner.reads_before_fault.store(NO_FAULT, Ordering::SeqCst);
    }

    /// Delay every driver call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_us
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    /// Every driver call so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.log().clone()
    }

    /// Number of logged calls whose name starts with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.log().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn log(&self) -> MutexGuard<'_, Vec<String>> {
        // A poisoned log only means a test panicked mid-push; the entries are still valid.
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self, call: impl Into<String>) {
        self.log().push(call.into());
        let latency = self.inner.latency_us.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
    }

    fn connect_outcome(&self) -> DriverResult<()> {
        let remaining = self.inner.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::Communication("mock link refused".to_string()));
        }
        Ok(())
    }

    #[allow(clippy::panic)]
    fn read_outcome(&self) -> DriverResult<u64> {
        if self.inner.panic_on_read.swap(false, Ordering::SeqCst) {
            panic!("mock detector driver crashed");
        }
        let done = self.inner.reads.fetch_add(1, Ordering::SeqCst);
        if done >= self.inner.reads_before_fault.load(Ordering::SeqCst) {
            return Err(DriverError::Fault("mock detector overload".to_string()));
        }
        Ok(done)
    }
}

/// Simulated multi-channel pulse generator with digital outputs `D0..Dn`.
#[derive(Default)]
pub struct MockPulseGenerator {
    levels: Vec<bool>,
    program: Option<CompiledSequence>,
    streaming: bool,
    control: MockControl,
}

impl MockPulseGenerator {
    pub fn new(channels: usize) -> Self {
        Self {
            levels: vec![false; channels],
            ..Self::default()
        }
    }

    pub fn control(&self) -> MockControl {
        self.control.clone()
    }

    /// Descriptor matching [`MockPulseGenerator::new`] with the same channel count.
    pub fn descriptor(id: &str, channels: usize) -> DeviceDescriptor {
        (0..channels).fold(
            DeviceDescriptor::new(id, "Mock", "PulseGen", DeviceKind::PulseGenerator)
                .with_feature(Capability::PulseGeneration),
            |descriptor, n| descriptor.with_channel(ChannelSpec::digital_output(format!("D{n}"))),
        )
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }
}

#[async_trait]
impl DeviceDriver for MockPulseGenerator {
    async fn connect(&mut self) -> DriverResult<()> {
        self.control.enter("connect").await;
        self.control.connect_outcome()?;
        info!("Mock pulse generator online with {} channels", self.levels.len());
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        self.control.enter("disconnect").await;
        self.streaming = false;
        Ok(())
    }

    async fn reset(&mut self) -> DriverResult<()> {
        self.control.enter("reset").await;
        self.levels.iter_mut().for_each(|level| *level = false);
        self.program = None;
        self.streaming = false;
        Ok(())
    }

    async fn write(&mut self, channel: &ChannelSpec, value: ChannelValue) -> DriverResult<()> {
        self.control
            .enter(format!("write {}={}", channel.name, value))
            .await;
        let index = channel
            .name
            .strip_prefix('D')
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n < self.levels.len())
            .ok_or_else(|| DriverError::Unsupported(format!("write {}", channel.name)))?;
        match value {
            ChannelValue::Level(level) => {
                self.levels[index] = level;
                Ok(())
            }
            ChannelValue::Analog(_) => Err(DriverError::Unsupported("analog write".to_string())),
        }
    }

    async fn read(&mut self, channel: &ChannelSpec) -> DriverResult<f64> {
        self.control.enter(format!("read {}", channel.name)).await;
        Err(DriverError::Unsupported("read".to_string()))
    }

    async fn load_program(&mut self, program: &CompiledSequence) -> DriverResult<()> {
        self.control.enter("load_program").await;
        if self.control.inner.fail_load.load(Ordering::SeqCst) {
            return Err(DriverError::Fault("program memory rejected upload".to_string()));
        }
        debug!(
            "Mock pulse generator loaded {} segments, period {:?}",
            program.segments().len(),
            program.period()
        );
        self.program = Some(program.clone());
        Ok(())
    }

    async fn start_program(&mut self) -> DriverResult<()> {
        self.control.enter("start_program").await;
        if self.control.inner.fail_start.load(Ordering::SeqCst) {
            return Err(DriverError::Fault("stream start refused".to_string()));
        }
        if self.program.is_none() {
            return Err(DriverError::Fault("no program loaded".to_string()));
        }
        self.streaming = true;
        Ok(())
    }

    async fn stop_program(&mut self) -> DriverResult<()> {
        self.control.enter("stop_program").await;
        self.streaming = false;
        Ok(())
    }
}

/// Simulated triggered detector with an analog `signal` input (V) and a `counts` counter.
#[derive(Default)]
pub struct MockDetector {
    triggers: u64,
    control: MockControl,
}

impl MockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&self) -> MockControl {
        self.control.clone()
    }

    pub fn descriptor(id: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(id, "Mock", "Detector", DeviceKind::Detector)
            .with_feature(Capability::TriggerInput)
            .with_channel(ChannelSpec::new(
                "signal",
                Capability::AnalogInput,
                Unit::Volt,
            ))
            .with_channel(ChannelSpec::new("counts", Capability::Counter, Unit::Counts))
    }
}

#[async_trait]
impl DeviceDriver for MockDetector {
    async fn connect(&mut self) -> DriverResult<()> {
        self.control.enter("connect").await;
        self.control.connect_outcome()
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        self.control.enter("disconnect").await;
        Ok(())
    }

    async fn reset(&mut self) -> DriverResult<()> {
        self.control.enter("reset").await;
        self.triggers = 0;
        Ok(())
    }

    async fn write(&mut self, channel: &ChannelSpec, _value: ChannelValue) -> DriverResult<()> {
        self.control.enter(format!("write {}", channel.name)).await;
        Err(DriverError::Unsupported("write".to_string()))
    }

    async fn read(&mut self, channel: &ChannelSpec) -> DriverResult<f64> {
        self.control.enter(format!("read {}", channel.name)).await;
        let n = self.control.read_outcome()?;
        match channel.name.as_str() {
            "counts" => Ok(self.triggers as f64),
            _ => {
                // Deterministic pseudo-signal so recorded runs are reproducible.
                let phase = n as f64 * 0.1;
                Ok(phase.sin() + (phase * 37.0).sin() * 0.05)
            }
        }
    }

    async fn trigger(&mut self) -> DriverResult<()> {
        self.control.enter("trigger").await;
        self.triggers += 1;
        Ok(())
    }
}
