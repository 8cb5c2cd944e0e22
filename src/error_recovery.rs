//! Retry policies for recoverable device failures.
//!
//! Only connection failures are retried. Hardware faults end the current run and are
//! never retried here.

use crate::device::DeviceRegistry;
use crate::error::{AppResult, DaqError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Connect `id`, retrying recoverable failures according to `policy`.
///
/// Non-recoverable errors (unknown device, hardware fault) are returned immediately.
pub async fn connect_with_retry(
    registry: &DeviceRegistry,
    id: &str,
    policy: &RetryPolicy,
) -> AppResult<()> {
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match registry.connect(id).await {
            Ok(()) => {
                if attempt > 1 {
                    info!(device = %id, attempt, "Connected after retry");
                }
                return Ok(());
            }
            Err(e) if e.is_recoverable() => {
                warn!(device = %id, attempt, max = attempts, error = %e, "Connect attempt failed");
                last_err = Some(e);
                if attempt < attempts {
                    sleep(policy.backoff_delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| DaqError::Connection {
        device: id.to_string(),
        message: format!("Failed to connect after {attempts} attempts."),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockPulseGenerator;
    use crate::device::ConnectionState;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_until_connected() {
        let registry = DeviceRegistry::new();
        let generator = MockPulseGenerator::new(1);
        let control = generator.control();
        control.fail_next_connects(2);
        registry
            .register(MockPulseGenerator::descriptor("pg", 1), Box::new(generator))
            .await
            .unwrap();

        connect_with_retry(&registry, "pg", &fast(3)).await.unwrap();
        assert_eq!(registry.state("pg").await.unwrap(), ConnectionState::Connected);
        assert_eq!(control.calls_matching("connect"), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let registry = DeviceRegistry::new();
        let generator = MockPulseGenerator::new(1);
        generator.control().fail_next_connects(5);
        registry
            .register(MockPulseGenerator::descriptor("pg", 1), Box::new(generator))
            .await
            .unwrap();

        let err = connect_with_retry(&registry, "pg", &fast(2)).await.unwrap_err();
        assert!(matches!(err, DaqError::Connection { .. }));
    }

    #[tokio::test]
    async fn unknown_device_is_not_retried() {
        let registry = DeviceRegistry::new();
        let err = connect_with_retry(&registry, "nope", &fast(3)).await.unwrap_err();
        assert!(matches!(err, DaqError::UnknownDevice(_)));
    }
}
