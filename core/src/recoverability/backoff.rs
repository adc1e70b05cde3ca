// portage/src/recoverability/backoff.rs

//! Delay growth for delayed retries.

use crate::error::{PortageError, PortageResult};
use std::fmt::Debug;
use std::time::Duration;

/// Maps a 1-based delayed-retry attempt to the delay before that attempt.
/// Over the attempts the configured retry count allows, delays must strictly
/// increase; `RecoverabilityConfig::validate` checks this at startup.
pub trait BackoffPolicy: Debug + Send + Sync + 'static {
  fn delay_for(&self, attempt: u32) -> Duration;
}

/// `increment * attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
  increment: Duration,
}

impl LinearBackoff {
  pub fn new(increment: Duration) -> PortageResult<Self> {
    if increment.is_zero() {
      return Err(PortageError::configuration("linear backoff increment must be greater than zero"));
    }
    Ok(LinearBackoff { increment })
  }

  pub fn increment(&self) -> Duration {
    self.increment
  }
}

impl Default for LinearBackoff {
  fn default() -> Self {
    LinearBackoff {
      increment: Duration::from_secs(10),
    }
  }
}

impl BackoffPolicy for LinearBackoff {
  fn delay_for(&self, attempt: u32) -> Duration {
    self.increment.saturating_mul(attempt.max(1))
  }
}

/// `initial * factor^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
  initial: Duration,
  factor: f64,
  max: Duration,
}

impl ExponentialBackoff {
  pub fn new(initial: Duration, factor: f64, max: Duration) -> PortageResult<Self> {
    if initial.is_zero() {
      return Err(PortageError::configuration("exponential backoff needs a non-zero initial delay"));
    }
    if !factor.is_finite() || factor <= 1.0 {
      return Err(PortageError::configuration(format!(
        "exponential backoff factor must be greater than 1.0, got {factor}"
      )));
    }
    if max < initial {
      return Err(PortageError::configuration("exponential backoff cap is below the initial delay"));
    }
    Ok(ExponentialBackoff { initial, factor, max })
  }
}

impl BackoffPolicy for ExponentialBackoff {
  // Past the cap the delay stops growing; configure `max` above the largest
  // delay the retry count can reach.
  fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.max(1).saturating_sub(1) as i32;
    let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
    if !secs.is_finite() || secs >= self.max.as_secs_f64() {
      return self.max;
    }
    Duration::from_secs_f64(secs)
  }
}

/// An explicit schedule: attempt `n` waits `delays[n - 1]`. Attempts past the
/// end reuse the last delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBackoff {
  delays: Vec<Duration>,
}

impl ScheduledBackoff {
  pub fn new(delays: Vec<Duration>) -> PortageResult<Self> {
    if delays.is_empty() {
      return Err(PortageError::configuration("a backoff schedule needs at least one delay"));
    }
    if delays[0].is_zero() {
      return Err(PortageError::configuration("backoff schedule delays must be greater than zero"));
    }
    if delays.windows(2).any(|pair| pair[1] <= pair[0]) {
      return Err(PortageError::configuration("backoff schedule delays must be strictly increasing"));
    }
    Ok(ScheduledBackoff { delays })
  }

  pub fn delays(&self) -> &[Duration] {
    &self.delays
  }
}

impl BackoffPolicy for ScheduledBackoff {
  fn delay_for(&self, attempt: u32) -> Duration {
    let idx = (attempt.max(1) as usize - 1).min(self.delays.len() - 1);
    self.delays[idx]
  }
}
