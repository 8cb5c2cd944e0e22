//! Device registry: the single synchronization boundary in front of every driver.
//!
//! The registry is an explicit context object. It is built by the process, populated
//! with `register`, and handed to the orchestrator at construction; nothing in the
//! engine reaches for a global device table.

use super::{
    Capability, ChannelSpec, ChannelValue, ConnectionState, DeviceDescriptor, DeviceDriver,
    DriverError, DriverResult, Reading,
};
use crate::error::{AppResult, DaqError};
use crate::sequence::CompiledSequence;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, info, warn};

struct DeviceSlot {
    descriptor: DeviceDescriptor,
    driver: Box<dyn DeviceDriver>,
}

impl DeviceSlot {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn ensure_connected(&self) -> AppResult<()> {
        match self.descriptor.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => Err(DaqError::NotConnected(self.id().to_string())),
            ConnectionState::Faulted => Err(DaqError::DeviceFault {
                device: self.id().to_string(),
                message: "device is faulted; reset or reconnect first".to_string(),
            }),
        }
    }

    fn ensure_feature(&self, capability: Capability, operation: &str) -> AppResult<()> {
        if self.descriptor.features.contains(&capability) {
            Ok(())
        } else {
            Err(DaqError::UnsupportedCapability {
                device: self.id().to_string(),
                channel: "*".to_string(),
                operation: operation.to_string(),
            })
        }
    }

    /// Map the outcome of a bounded driver call onto the engine's error taxonomy.
    ///
    /// Hardware faults, lost communication and timeouts move the device to `Faulted`.
    fn settle<T>(
        &mut self,
        operation: &str,
        limit: Duration,
        outcome: Result<DriverResult<T>, Elapsed>,
    ) -> AppResult<T> {
        let err = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(DriverError::Unsupported(op))) => {
                return Err(DaqError::UnsupportedCapability {
                    device: self.id().to_string(),
                    channel: "*".to_string(),
                    operation: op,
                })
            }
            Ok(Err(DriverError::Fault(message) | DriverError::Communication(message))) => {
                DaqError::DeviceFault {
                    device: self.id().to_string(),
                    message,
                }
            }
            Err(_) => DaqError::Timeout {
                device: self.id().to_string(),
                operation: operation.to_string(),
                timeout: limit,
            },
        };
        warn!(device = %self.id(), operation, error = %err, "Device faulted");
        self.descriptor.state = ConnectionState::Faulted;
        Err(err)
    }
}

/// Registry of devices keyed by descriptor id.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Mutex<DeviceSlot>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a driver to a descriptor. The device starts out disconnected.
    pub async fn register(
        &self,
        mut descriptor: DeviceDescriptor,
        driver: Box<dyn DeviceDriver>,
    ) -> AppResult<()> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&descriptor.id) {
            return Err(DaqError::DuplicateDevice(descriptor.id));
        }
        descriptor.state = ConnectionState::Disconnected;
        info!(device = %descriptor.id, vendor = %descriptor.vendor, model = %descriptor.model, "Registered device");
        let id = descriptor.id.clone();
        devices.insert(id, Arc::new(Mutex::new(DeviceSlot { descriptor, driver })));
        Ok(())
    }

    /// Registered device ids, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn slot(&self, id: &str) -> AppResult<Arc<Mutex<DeviceSlot>>> {
        self.devices
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DaqError::UnknownDevice(id.to_string()))
    }

    /// Establish communication. On failure the device is left disconnected.
    pub async fn connect(&self, id: &str) -> AppResult<()> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        if slot.descriptor.state == ConnectionState::Connected {
            debug!(device = %id, "Already connected");
            return Ok(());
        }

        let limit = slot.descriptor.timeout;
        let message = match timeout(limit, slot.driver.connect()).await {
            Ok(Ok(())) => {
                slot.descriptor.state = ConnectionState::Connected;
                info!(device = %id, "Connected");
                return Ok(());
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("no response within {limit:?}"),
        };

        // Roll back whatever the driver managed to open.
        if let Ok(Err(err)) = timeout(limit, slot.driver.disconnect()).await {
            debug!(device = %id, error = %err, "Cleanup after failed connect reported an error");
        }
        slot.descriptor.state = ConnectionState::Disconnected;
        warn!(device = %id, %message, "Connect failed");
        Err(DaqError::Connection {
            device: id.to_string(),
            message,
        })
    }

    /// Close communication. The device ends up disconnected even if the driver complains.
    pub async fn disconnect(&self, id: &str) -> AppResult<()> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        if slot.descriptor.state == ConnectionState::Disconnected {
            return Ok(());
        }
        let limit = slot.descriptor.timeout;
        let outcome = timeout(limit, slot.driver.disconnect()).await;
        slot.descriptor.state = ConnectionState::Disconnected;
        info!(device = %id, "Disconnected");
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DaqError::DeviceFault {
                device: id.to_string(),
                message: err.to_string(),
            }),
            Err(_) => Err(DaqError::Timeout {
                device: id.to_string(),
                operation: "disconnect".to_string(),
                timeout: limit,
            }),
        }
    }

    pub async fn state(&self, id: &str) -> AppResult<ConnectionState> {
        let slot = self.slot(id).await?;
        let state = slot.lock().await.descriptor.state;
        Ok(state)
    }

    /// Capabilities advertised by the device.
    pub async fn capability_query(&self, id: &str) -> AppResult<BTreeSet<Capability>> {
        let slot = self.slot(id).await?;
        let caps = slot.lock().await.descriptor.capabilities();
        Ok(caps)
    }

    /// Snapshot of one descriptor, including its current state.
    pub async fn descriptor(&self, id: &str) -> AppResult<DeviceDescriptor> {
        let slot = self.slot(id).await?;
        let descriptor = slot.lock().await.descriptor.clone();
        Ok(descriptor)
    }

    /// Snapshots of every registered device, sorted by id.
    pub async fn snapshot(&self) -> Vec<DeviceDescriptor> {
        let slots: Vec<_> = self.devices.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.descriptor.clone());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn write(&self, id: &str, channel: &str, value: ChannelValue) -> AppResult<()> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.ensure_connected()?;
        let spec = writable_channel(&slot.descriptor, channel, value)?;
        debug!("{}: send '{}' = {}", id, spec.name, value);
        let limit = slot.descriptor.timeout;
        let outcome = timeout(limit, slot.driver.write(&spec, value)).await;
        slot.settle("write", limit, outcome)
    }

    pub async fn read(&self, id: &str, channel: &str) -> AppResult<Reading> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.ensure_connected()?;
        let spec = slot.descriptor.resolve_channel(channel)?.clone();
        if !spec.capability.is_readable() {
            return Err(DaqError::UnsupportedCapability {
                device: id.to_string(),
                channel: channel.to_string(),
                operation: "read".to_string(),
            });
        }
        let limit = slot.descriptor.timeout;
        let outcome = timeout(limit, slot.driver.read(&spec)).await;
        let value = slot.settle("read", limit, outcome)?;
        debug!("{}: recv '{}' = {}", id, spec.name, value);
        Ok(Reading {
            value,
            unit: spec.unit,
        })
    }

    pub async fn trigger(&self, id: &str) -> AppResult<()> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.ensure_connected()?;
        slot.ensure_feature(Capability::TriggerInput, "trigger")?;
        let limit = slot.descriptor.timeout;
        let outcome = timeout(limit, slot.driver.trigger()).await;
        slot.settle("trigger", limit, outcome)
    }

    /// Load a compiled program onto a pulse generator.
    pub async fn load_program(&self, id: &str, program: &CompiledSequence) -> AppResult<()> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.ensure_connected()?;
        slot.ensure_feature(Capability::PulseGeneration, "load_program")?;
        let limit = slot.descriptor.timeout;
        let outcome = timeout(limit, slot.driver.load_program(program)).await;
        slot.settle("load_program", limit, outcome)?;
        info!(device = %id, period = ?program.period(), "Loaded pulse program");
        Ok(())
    }

    pub async fn start_program(&self, id: &str) -> AppResult<()> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.ensure_connected()?;
        slot.ensure_feature(Capability::PulseGeneration, "start_program")?;
        let limit = slot.descriptor.timeout;
        let outcome = timeout(limit, slot.driver.start_program()).await;
        slot.settle("start_program", limit, outcome)
    }

    pub async fn stop_program(&self, id: &str) -> AppResult<()> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.ensure_connected()?;
        slot.ensure_feature(Capability::PulseGeneration, "stop_program")?;
        let limit = slot.descriptor.timeout;
        let outcome = timeout(limit, slot.driver.stop_program()).await;
        slot.settle("stop_program", limit, outcome)
    }

    /// Return a device to its default state. A faulted device that resets cleanly
    /// is considered connected again.
    pub async fn reset(&self, id: &str) -> AppResult<()> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        if slot.descriptor.state == ConnectionState::Disconnected {
            return Err(DaqError::NotConnected(id.to_string()));
        }
        let limit = slot.descriptor.timeout;
        let outcome = timeout(limit, slot.driver.reset()).await;
        slot.settle("reset", limit, outcome)?;
        slot.descriptor.state = ConnectionState::Connected;
        info!(device = %id, "Reset");
        Ok(())
    }
}

fn writable_channel(
    descriptor: &DeviceDescriptor,
    channel: &str,
    value: ChannelValue,
) -> AppResult<ChannelSpec> {
    let spec = descriptor.resolve_channel(channel)?;
    let unsupported = |operation: &str| DaqError::UnsupportedCapability {
        device: descriptor.id.clone(),
        channel: channel.to_string(),
        operation: operation.to_string(),
    };
    match (spec.capability, value) {
        (Capability::DigitalOutput, ChannelValue::Level(_)) => Ok(spec.clone()),
        (Capability::AnalogOutput | Capability::Motion, ChannelValue::Analog(v)) => {
            if spec.accepts(v) {
                Ok(spec.clone())
            } else {
                Err(unsupported(&format!("value {v} outside {:?}", spec.range)))
            }
        }
        (capability, _) if capability.is_writable() => Err(unsupported(&format!(
            "{value:?} on a {capability:?} channel"
        ))),
        _ => Err(unsupported("write")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDetector, MockPulseGenerator};

    async fn registry_with_generator() -> (DeviceRegistry, crate::device::mock::MockControl) {
        let registry = DeviceRegistry::new();
        let generator = MockPulseGenerator::new(2);
        let control = generator.control();
        registry
            .register(MockPulseGenerator::descriptor("pg", 2), Box::new(generator))
            .await
            .unwrap();
        (registry, control)
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (registry, _) = registry_with_generator().await;
        let err = registry
            .register(
                MockPulseGenerator::descriptor("pg", 2),
                Box::new(MockPulseGenerator::new(2)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::DuplicateDevice(id) if id == "pg"));
    }

    #[tokio::test]
    async fn failed_connect_leaves_device_disconnected() {
        let (registry, control) = registry_with_generator().await;
        control.fail_next_connects(1);

        let err = registry.connect("pg").await.unwrap_err();
        assert!(matches!(err, DaqError::Connection { .. }));
        assert!(err.is_recoverable());
        assert_eq!(registry.state("pg").await.unwrap(), ConnectionState::Disconnected);

        registry.connect("pg").await.unwrap();
        assert_eq!(registry.state("pg").await.unwrap(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let (registry, _) = registry_with_generator().await;
        let err = registry
            .write("pg", "D0", ChannelValue::Level(true))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::NotConnected(_)));
    }

    #[tokio::test]
    async fn write_checks_capability() {
        let (registry, control) = registry_with_generator().await;
        registry.connect("pg").await.unwrap();

        registry.write("pg", "D1", ChannelValue::Level(true)).await.unwrap();
        let err = registry.read("pg", "D1").await.unwrap_err();
        assert!(matches!(err, DaqError::UnsupportedCapability { .. }));
        let err = registry
            .write("pg", "D0", ChannelValue::Analog(0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::UnsupportedCapability { .. }));

        assert_eq!(control.calls_matching("write"), 1);
    }

    #[tokio::test]
    async fn fault_transitions_to_faulted_without_retry() {
        let registry = DeviceRegistry::new();
        let detector = MockDetector::new();
        let control = detector.control();
        registry
            .register(MockDetector::descriptor("det"), Box::new(detector))
            .await
            .unwrap();
        registry.connect("det").await.unwrap();

        control.fault_after_reads(0);
        let err = registry.read("det", "signal").await.unwrap_err();
        assert!(err.is_fault());
        assert_eq!(registry.state("det").await.unwrap(), ConnectionState::Faulted);
        assert_eq!(control.calls_matching("read"), 1);

        // Further calls are refused until reset.
        assert!(registry.read("det", "signal").await.is_err());
        assert_eq!(control.calls_matching("read"), 1);

        control.clear_faults();
        registry.reset("det").await.unwrap();
        assert!(registry.read("det", "signal").await.is_ok());
    }

    #[tokio::test]
    async fn slow_driver_times_out() {
        let registry = DeviceRegistry::new();
        let detector = MockDetector::new();
        let control = detector.control();
        control.set_latency(Duration::from_millis(200));
        registry
            .register(
                MockDetector::descriptor("det").with_timeout(Duration::from_millis(20)),
                Box::new(detector),
            )
            .await
            .unwrap();

        let err = registry.connect("det").await.unwrap_err();
        assert!(matches!(err, DaqError::Connection { .. }));
    }

    #[tokio::test]
    async fn snapshot_is_sorted() {
        let (registry, _) = registry_with_generator().await;
        registry
            .register(MockDetector::descriptor("det"), Box::new(MockDetector::new()))
            .await
            .unwrap();
        let ids: Vec<_> = registry.snapshot().await.into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["det", "pg"]);
        assert_eq!(registry.ids().await, vec!["det", "pg"]);
    }
}
