//! Backoff policy and per-connector retry state

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::debug;

/// Maximum allowed connection attempts
const MAX_ATTEMPTS: u32 = 1000;
/// Maximum backoff duration to prevent excessive delays
const MAX_BACKOFF_SECONDS: u64 = 3600; // 1 hour
/// Maximum multiplier to prevent exponential explosion
const MAX_MULTIPLIER: f64 = 100.0;

fn validate_max_attempts<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u32::deserialize(deserializer)?;
    if value == 0 || value > MAX_ATTEMPTS {
        return Err(serde::de::Error::custom(format!(
            "max_attempts {} must be between 1 and {}",
            value, MAX_ATTEMPTS
        )));
    }
    Ok(value)
}

fn validate_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let duration = Duration::deserialize(deserializer)?;
    if duration.as_secs() > MAX_BACKOFF_SECONDS {
        return Err(serde::de::Error::custom(format!(
            "duration {:?} exceeds maximum allowed {} seconds",
            duration, MAX_BACKOFF_SECONDS
        )));
    }
    Ok(duration)
}

fn validate_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "backoff_multiplier {} must be finite and between 1.0 and {}",
            value, MAX_MULTIPLIER
        )));
    }
    Ok(value)
}

/// Connection retry policy with validated bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of connection attempts, including the first
    #[serde(deserialize_with = "validate_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(deserialize_with = "validate_duration")]
    pub initial_backoff: Duration,
    /// Ceiling for any single delay
    #[serde(deserialize_with = "validate_duration")]
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    #[serde(deserialize_with = "validate_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a doubling policy
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: initial,
            max_backoff: max,
            backoff_multiplier: 2.0,
        }
    }

    /// Create a policy with fixed backoff
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: backoff,
            max_backoff: backoff,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after the failed attempt with zero-based index `attempt`.
    ///
    /// `min(initial * multiplier^attempt, max)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        // Past 64 doublings every sane policy is already at its ceiling.
        if attempt >= 64 {
            return self.max_backoff;
        }

        // Whole multipliers stay in integer nanoseconds so the series is exact.
        if self.backoff_multiplier.fract() == 0.0 {
            let factor = (self.backoff_multiplier as u128).checked_pow(attempt);
            let nanos = factor.and_then(|f| self.initial_backoff.as_nanos().checked_mul(f));
            return match nanos {
                Some(n) if n < self.max_backoff.as_nanos() => Duration::from_nanos(n as u64),
                _ => self.max_backoff,
            };
        }

        let factor = self.backoff_multiplier.powi(attempt as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs).min(self.max_backoff)
    }

    /// Sum of the delays slept before attempt number `failures` (zero-based).
    pub fn total_backoff(&self, failures: u32) -> Duration {
        (0..failures).map(|i| self.backoff_for(i)).sum()
    }
}

/// Mutable retry bookkeeping owned by a single connector.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    current_delay: Duration,
}

impl RetryState {
    /// Fresh state for a policy
    pub fn new(policy: RetryPolicy) -> Self {
        let current_delay = policy.backoff_for(0);
        Self {
            policy,
            attempt: 0,
            current_delay,
        }
    }

    /// Failed attempts recorded since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay that will follow the next failure
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// The policy this state follows
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay to sleep before the next attempt, or `None` once the
    /// attempt budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.current_delay;
        self.current_delay = self.policy.backoff_for(self.attempt);
        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduled connection retry"
        );
        Some(delay)
    }

    /// Forget all failures after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.policy.backoff_for(0);
    }
}
