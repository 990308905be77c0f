//! Subscription manager configuration.

use crate::error::{Result, SubmgrError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Operational parameters of the subscription manager.
///
/// Retry budget and timeouts are deployment settings; defaults match the
/// reference deployment (2 s response timeout, one re-send).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmgrConfig {
    /// RIC requestor id stamped into every downstream request.
    pub requestor_id: u32,

    /// Time to wait for a downstream response before re-sending.
    pub response_timeout_ms: u64,

    /// Re-sends allowed after the first send before the transaction expires.
    pub max_retries: u32,

    /// Each re-send waits `response_timeout * backoff_multiplier^attempt`.
    pub backoff_multiplier: f64,

    /// Inclusive range of downstream instance ids handed out.
    pub instance_id_min: u32,
    pub instance_id_max: u32,

    /// Completed outcomes remembered per idempotency key.
    pub idempotency_cache_size: usize,
}

impl Default for SubmgrConfig {
    fn default() -> Self {
        Self {
            requestor_id: 123,
            response_timeout_ms: 2000,
            max_retries: 1,
            backoff_multiplier: 1.0,
            instance_id_min: 1,
            instance_id_max: 65535,
            idempotency_cache_size: 1024,
        }
    }
}

impl SubmgrConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| SubmgrError::Config(format!("invalid config document: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.response_timeout_ms == 0 {
            return Err(SubmgrError::Config("response_timeout_ms must be > 0".into()));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(SubmgrError::Config(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.instance_id_min == 0 || self.instance_id_min > self.instance_id_max {
            return Err(SubmgrError::Config(format!(
                "invalid instance id range {}..={}",
                self.instance_id_min, self.instance_id_max
            )));
        }
        if self.idempotency_cache_size == 0 {
            return Err(SubmgrError::Config("idempotency_cache_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Wait before declaring attempt `attempt` (0 = first send) unanswered.
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        self.response_timeout().mul_f64(factor)
    }
}
