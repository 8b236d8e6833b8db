// src/supervisor.rs
//
// Start-up retry around the connection manager, which itself makes a single
// attempt per request.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::rabbitmq::{ConnectionManager, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Spread `delay` by up to 15% either way.
fn with_jitter(delay: Duration) -> Duration {
    let jitter = rand::random::<f64>() * 0.3 - 0.15;
    delay.mul_f64(1.0 + jitter)
}

/// Connect through `manager`, retrying with exponential backoff.
pub async fn connect_with_retry(manager: &ConnectionManager, policy: &ReconnectPolicy) -> Result<()> {
    let mut attempt = 0;

    loop {
        attempt += 1;
        info!(target_uri = %manager.describe(), attempt, "Attempting to connect to RabbitMQ");

        match manager.connection().await {
            Ok(_) => {
                info!(attempt, "Successfully connected to RabbitMQ");
                return Ok(());
            }
            Err(err) => {
                error!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "Failed to connect to RabbitMQ"
                );

                if attempt >= policy.max_attempts {
                    error!("Max reconnection attempts reached. Giving up.");
                    return Err(err);
                }

                let delay = with_jitter(policy.base_delay(attempt));
                warn!(delay_ms = delay.as_millis() as u64, "Waiting before next reconnect attempt");
                sleep(delay).await;
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
