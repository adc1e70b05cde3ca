// portage/src/recoverability/mod.rs

//! Decides what happens to a message whose receive pipeline faulted:
//! retry it now, retry it later, or move it to the error queue.

pub mod backoff;
pub mod executor;
pub mod failure_info;

pub use backoff::{BackoffPolicy, ExponentialBackoff, LinearBackoff, ScheduledBackoff};
pub use executor::RecoverabilityExecutor;
pub use failure_info::FailureInfoStorage;

use crate::error::{PortageError, PortageResult};
use crate::headers::{self, Headers};
use crate::transport::{IncomingMessage, TransportTransaction};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

/// Everything known about one failed processing attempt.
#[derive(Debug)]
pub struct ErrorContext {
  pub error: PortageError,
  pub message: IncomingMessage,
  pub transport_transaction: TransportTransaction,
  /// Failures of this message in this process so far, including this one.
  pub immediate_processing_failures: u32,
  /// Delayed retries already performed, read from the message headers.
  pub delayed_deliveries_performed: u32,
  pub receive_address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoverabilityAction {
  ImmediateRetry,
  DelayedRetry { delay: Duration, destination: String },
  MoveToError { error_queue: String, headers: Headers },
  /// Drops the message without routing it anywhere.
  Discard { reason: String },
}

impl RecoverabilityAction {
  pub fn name(&self) -> &'static str {
    match self {
      RecoverabilityAction::ImmediateRetry => "ImmediateRetry",
      RecoverabilityAction::DelayedRetry { .. } => "DelayedRetry",
      RecoverabilityAction::MoveToError { .. } => "MoveToError",
      RecoverabilityAction::Discard { .. } => "Discard",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandleResult {
  /// The message has been dealt with and can be acknowledged.
  Handled,
  /// Run the receive pipeline again with the same message.
  RetryRequired,
}

type FailureMatcher = Arc<dyn Fn(&PortageError) -> bool + Send + Sync>;

/// A failure kind that skips both retry tiers.
#[derive(Clone)]
pub struct UnrecoverableFailure {
  description: String,
  matches: FailureMatcher,
}

impl UnrecoverableFailure {
  /// Matches failures with an `E` anywhere in their cause chain.
  pub fn of_type<E: std::error::Error + Send + Sync + 'static>() -> Self {
    UnrecoverableFailure {
      description: std::any::type_name::<E>().to_string(),
      matches: Arc::new(|err: &PortageError| err.is_caused_by::<E>()),
    }
  }

  pub fn matching<F>(description: impl Into<String>, predicate: F) -> Self
  where
    F: Fn(&PortageError) -> bool + Send + Sync + 'static,
  {
    UnrecoverableFailure {
      description: description.into(),
      matches: Arc::new(predicate),
    }
  }

  pub fn matches(&self, err: &PortageError) -> bool {
    (self.matches)(err)
  }

  pub fn description(&self) -> &str {
    &self.description
  }
}

impl fmt::Debug for UnrecoverableFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("UnrecoverableFailure").field(&self.description).finish()
  }
}

#[derive(Debug, Clone)]
pub struct ImmediateConfig {
  pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct DelayedConfig {
  pub max_retries: u32,
  pub backoff: Arc<dyn BackoffPolicy>,
}

#[derive(Debug, Clone)]
pub struct FailedConfig {
  pub error_queue: String,
  pub unrecoverable: Vec<UnrecoverableFailure>,
}

#[derive(Debug, Clone)]
pub struct RecoverabilityConfig {
  pub immediate: ImmediateConfig,
  pub delayed: DelayedConfig,
  pub failed: FailedConfig,
}

impl Default for RecoverabilityConfig {
  fn default() -> Self {
    RecoverabilityConfig {
      immediate: ImmediateConfig { max_retries: 5 },
      delayed: DelayedConfig {
        max_retries: 3,
        backoff: Arc::new(LinearBackoff::default()),
      },
      failed: FailedConfig {
        error_queue: "error".to_string(),
        unrecoverable: Vec::new(),
      },
    }
  }
}

impl RecoverabilityConfig {
  pub fn validate(&self) -> PortageResult<()> {
    if self.failed.error_queue.trim().is_empty() {
      return Err(PortageError::configuration("the error queue address must not be empty"));
    }
    let mut previous = Duration::ZERO;
    for attempt in 1..=self.delayed.max_retries {
      let delay = self.delayed.backoff.delay_for(attempt);
      if delay <= previous {
        return Err(PortageError::configuration(format!(
          "delayed retry {attempt} would wait {delay:?}, which does not exceed the previous delay of {previous:?}"
        )));
      }
      previous = delay;
    }
    Ok(())
  }
}

pub type CustomPolicy = Arc<dyn Fn(&RecoverabilityConfig, &ErrorContext) -> RecoverabilityAction + Send + Sync>;

/// A pure function of the error context and the configuration: classifying the
/// same context twice yields the same action.
#[derive(Clone)]
pub struct RecoverabilityPolicy {
  config: RecoverabilityConfig,
  custom: Option<CustomPolicy>,
}

impl RecoverabilityPolicy {
  pub fn new(config: RecoverabilityConfig) -> Self {
    RecoverabilityPolicy { config, custom: None }
  }

  /// Replaces the default decision. The custom function can still fall back
  /// to [`RecoverabilityPolicy::default_action`].
  pub fn with_custom(mut self, custom: CustomPolicy) -> Self {
    self.custom = Some(custom);
    self
  }

  pub fn config(&self) -> &RecoverabilityConfig {
    &self.config
  }

  pub fn classify(&self, ctx: &ErrorContext) -> RecoverabilityAction {
    let action = match &self.custom {
      Some(custom) => custom(&self.config, ctx),
      None => Self::default_action(&self.config, ctx),
    };
    event!(
      Level::TRACE,
      message_id = %ctx.message.message_id,
      failures = ctx.immediate_processing_failures,
      delayed = ctx.delayed_deliveries_performed,
      action = action.name(),
      "Classified failure."
    );
    action
  }

  pub fn default_action(config: &RecoverabilityConfig, ctx: &ErrorContext) -> RecoverabilityAction {
    let unrecoverable =
      ctx.error.is_unrecoverable() || config.failed.unrecoverable.iter().any(|kind| kind.matches(&ctx.error));
    if unrecoverable {
      return Self::move_to_error(config, ctx);
    }

    if ctx.immediate_processing_failures <= config.immediate.max_retries {
      return RecoverabilityAction::ImmediateRetry;
    }

    if ctx.delayed_deliveries_performed < config.delayed.max_retries {
      return RecoverabilityAction::DelayedRetry {
        delay: config.delayed.backoff.delay_for(ctx.delayed_deliveries_performed.saturating_add(1)),
        destination: ctx.receive_address.clone(),
      };
    }

    Self::move_to_error(config, ctx)
  }

  fn move_to_error(config: &RecoverabilityConfig, ctx: &ErrorContext) -> RecoverabilityAction {
    RecoverabilityAction::MoveToError {
      error_queue: config.failed.error_queue.clone(),
      headers: exception_headers(&ctx.error, &ctx.receive_address),
    }
  }
}

impl fmt::Debug for RecoverabilityPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RecoverabilityPolicy")
      .field("config", &self.config)
      .field("custom", &self.custom.is_some())
      .finish()
  }
}

/// Diagnostic headers describing `error`, added to messages moved to the
/// error queue. The stack trace header holds the rendered cause chain.
pub fn exception_headers(error: &PortageError, receive_address: &str) -> Headers {
  let mut trace = error.to_string();
  let mut source = std::error::Error::source(error);
  while let Some(cause) = source {
    trace.push_str("\n  caused by: ");
    trace.push_str(&cause.to_string());
    source = cause.source();
  }

  let mut added = Headers::new();
  added.insert(headers::EXCEPTION_TYPE.to_string(), error.kind().to_string());
  added.insert(headers::EXCEPTION_MESSAGE.to_string(), error.root().to_string());
  added.insert(headers::EXCEPTION_STACK_TRACE.to_string(), trace);
  added.insert(headers::FAILED_QUEUE.to_string(), receive_address.to_string());
  if let Some(step) = error.faulted_step() {
    added.insert(headers::EXCEPTION_STEP.to_string(), step.to_string());
  }
  added
}
