// portage/src/config.rs

use crate::error::{PortageError, PortageResult};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Scalar endpoint settings. Collaborators, routing and handlers are supplied
/// through [`EndpointConfiguration`](crate::endpoint::EndpointConfiguration).
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSettings {
  pub endpoint_name: String,
  /// Gives this instance its own queue (`{endpoint_name}-{discriminator}`),
  /// which it receives from in addition to the shared endpoint queue.
  pub instance_discriminator: Option<String>,
  /// Maximum messages processed concurrently.
  pub concurrency: usize,
  pub immediate_retries: u32,
  pub delayed_retries: u32,
  /// Linear backoff step, used unless another backoff policy is configured.
  pub delayed_retry_increment: Duration,
  pub error_queue: String,
  /// How long dispatched outbox records are kept before cleanup.
  pub outbox_retention: Duration,
  pub outbox_cleanup_interval: Duration,
  /// How long shutdown waits for in-flight messages before abandoning them.
  pub shutdown_grace: Duration,
}

impl EndpointSettings {
  pub fn new(endpoint_name: impl Into<String>) -> Self {
    EndpointSettings {
      endpoint_name: endpoint_name.into(),
      ..Self::default()
    }
  }

  /// Reads `PORTAGE_*` variables, honouring a `.env` file if present.
  /// `PORTAGE_ENDPOINT_NAME` is required; everything else has a default.
  pub fn from_env() -> PortageResult<Self> {
    dotenv().ok();

    let get_env = |var_name: &str| env::var(var_name).ok().filter(|value| !value.trim().is_empty());
    let defaults = Self::default();

    let endpoint_name = get_env("PORTAGE_ENDPOINT_NAME").ok_or_else(|| {
      PortageError::configuration("Missing environment variable 'PORTAGE_ENDPOINT_NAME'")
    })?;

    let settings = EndpointSettings {
      endpoint_name,
      instance_discriminator: get_env("PORTAGE_INSTANCE_DISCRIMINATOR"),
      concurrency: parse_or("PORTAGE_CONCURRENCY", get_env("PORTAGE_CONCURRENCY"), defaults.concurrency)?,
      immediate_retries: parse_or(
        "PORTAGE_IMMEDIATE_RETRIES",
        get_env("PORTAGE_IMMEDIATE_RETRIES"),
        defaults.immediate_retries,
      )?,
      delayed_retries: parse_or(
        "PORTAGE_DELAYED_RETRIES",
        get_env("PORTAGE_DELAYED_RETRIES"),
        defaults.delayed_retries,
      )?,
      delayed_retry_increment: secs_or(
        "PORTAGE_DELAYED_RETRY_INCREMENT_SECS",
        get_env("PORTAGE_DELAYED_RETRY_INCREMENT_SECS"),
        defaults.delayed_retry_increment,
      )?,
      error_queue: get_env("PORTAGE_ERROR_QUEUE").unwrap_or(defaults.error_queue),
      outbox_retention: secs_or(
        "PORTAGE_OUTBOX_RETENTION_SECS",
        get_env("PORTAGE_OUTBOX_RETENTION_SECS"),
        defaults.outbox_retention,
      )?,
      outbox_cleanup_interval: secs_or(
        "PORTAGE_OUTBOX_CLEANUP_INTERVAL_SECS",
        get_env("PORTAGE_OUTBOX_CLEANUP_INTERVAL_SECS"),
        defaults.outbox_cleanup_interval,
      )?,
      shutdown_grace: secs_or(
        "PORTAGE_SHUTDOWN_GRACE_SECS",
        get_env("PORTAGE_SHUTDOWN_GRACE_SECS"),
        defaults.shutdown_grace,
      )?,
    };

    settings.validate()?;
    tracing::info!(endpoint = %settings.endpoint_name, "Endpoint settings loaded.");
    Ok(settings)
  }

  pub fn validate(&self) -> PortageResult<()> {
    if self.endpoint_name.trim().is_empty() {
      return Err(PortageError::configuration("endpoint name must not be empty"));
    }
    if self.concurrency == 0 {
      return Err(PortageError::configuration("concurrency must be at least 1"));
    }
    if self.error_queue.trim().is_empty() {
      return Err(PortageError::configuration("error queue must not be empty"));
    }
    if self.error_queue == self.endpoint_name {
      return Err(PortageError::configuration(
        "error queue must differ from the endpoint's own queue",
      ));
    }
    if matches!(&self.instance_discriminator, Some(d) if d.trim().is_empty()) {
      return Err(PortageError::configuration("instance discriminator must not be blank"));
    }
    if self.outbox_cleanup_interval.is_zero() {
      return Err(PortageError::configuration("outbox cleanup interval must be greater than zero"));
    }
    Ok(())
  }

  pub fn local_address(&self) -> &str {
    &self.endpoint_name
  }

  pub fn instance_address(&self) -> Option<String> {
    self
      .instance_discriminator
      .as_ref()
      .map(|discriminator| format!("{}-{}", self.endpoint_name, discriminator))
  }
}

impl Default for EndpointSettings {
  fn default() -> Self {
    EndpointSettings {
      endpoint_name: String::new(),
      instance_discriminator: None,
      concurrency: std::thread::available_parallelism().map_or(4, |n| n.get()),
      immediate_retries: 5,
      delayed_retries: 3,
      delayed_retry_increment: Duration::from_secs(10),
      error_queue: "error".to_string(),
      outbox_retention: Duration::from_secs(7 * 24 * 60 * 60),
      outbox_cleanup_interval: Duration::from_secs(60),
      shutdown_grace: Duration::from_secs(30),
    }
  }
}

fn parse_or<T>(var_name: &str, raw: Option<String>, default: T) -> PortageResult<T>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match raw {
    None => Ok(default),
    Some(value) => value
      .trim()
      .parse::<T>()
      .map_err(|e| PortageError::configuration(format!("Invalid {var_name}: {e}"))),
  }
}

fn secs_or(var_name: &str, raw: Option<String>, default: Duration) -> PortageResult<Duration> {
  let fallback = default.as_secs();
  parse_or::<u64>(var_name, raw, fallback).map(Duration::from_secs)
}
