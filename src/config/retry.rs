use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Configuration for the exponential backoff retry strategy used when
/// re-establishing the schema-change stream.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct BackoffPolicy {
    /// Maximum number of attempts (0 means retry until the proxy closes;
    /// the cache keeps serving reads from the backing store meanwhile)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Single attempt timeout (unit: milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Delay growth factor between attempts
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffPolicy {
    /// Validates backoff policy parameters.
    /// # Errors
    /// Returns a configuration error when:
    /// - Timeout is zero
    /// - Base delay is not below max delay
    /// - Multiplier would shrink the delay
    pub fn validate(
        &self,
        policy_name: &str,
    ) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::from(ConfigError::Message(format!(
                "{policy_name}: timeout_ms cannot be 0"
            ))));
        }

        if self.base_delay_ms == 0 {
            return Err(Error::from(ConfigError::Message(format!(
                "{policy_name}: base_delay_ms cannot be 0"
            ))));
        }

        if self.base_delay_ms >= self.max_delay_ms {
            return Err(Error::from(ConfigError::Message(format!(
                "{}: base_delay_ms({}) must be less than max_delay_ms({})",
                policy_name, self.base_delay_ms, self.max_delay_ms
            ))));
        }

        if self.max_delay_ms > 120_000 {
            // 2 minutes
            return Err(Error::from(ConfigError::Message(format!(
                "{}: max_delay_ms({}) exceeds 2min limit",
                policy_name, self.max_delay_ms
            ))));
        }

        if self.multiplier < 1.0 {
            return Err(Error::from(ConfigError::Message(format!(
                "{}: multiplier({}) must be at least 1.0",
                policy_name, self.multiplier
            ))));
        }

        Ok(())
    }
}

fn default_max_retries() -> usize {
    0
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
