// portage/src/error.rs
use anyhow::Error as AnyhowError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum PortageError {
  /// A fault raised inside a pipeline step, annotated with the step that raised it.
  /// Nested annotations are never created; see [`PortageError::in_step`].
  #[error("Step '{step_name}' failed: {source}")]
  Step {
    step_name: String,
    #[source]
    source: Box<PortageError>,
  },

  #[error("Error in message handler. Source: {source}")]
  Handler {
    #[source]
    source: AnyhowError,
  },

  #[error("Message '{message_id}' could not be deserialized: {reason}")]
  MessageDeserialization { message_id: String, reason: String },

  #[error("No handlers could be found for message type '{message_type}'")]
  NoHandlers { message_type: String },

  #[error("Type mismatch during context downcast (expected {expected_type}, step: '{step_name}')")]
  TypeMismatch { step_name: String, expected_type: String },

  #[error("Configuration error: {message}")]
  Configuration { message: String },

  #[error("Step '{step_name}' is already registered")]
  DuplicateStep { step_name: String },

  #[error("Step not found: {step_name}")]
  StepNotFound { step_name: String },

  #[error("Step '{step_name}' is ordered relative to '{dependency}', which is not registered")]
  MissingStepDependency { step_name: String, dependency: String },

  #[error("Step ordering constraints form a cycle between: {}", steps.join(", "))]
  CyclicStepOrdering { steps: Vec<String> },

  #[error("Step '{step_name}' expects context '{found}' but the pipeline provides '{expected}' at that point")]
  StepContextMismatch {
    step_name: String,
    expected: String,
    found: String,
  },

  #[error("No destination could be determined for message type '{message_type}': {reason}")]
  UnroutableMessage { message_type: String, reason: String },

  #[error("The destination queue '{queue}' could not be found. The destination may be misconfigured for this kind of message ({message_type}) in the routing configuration. It may also be the case that the given queue hasn't been created yet, or has been deleted.")]
  QueueNotFound { queue: String, message_type: String },

  #[error("Transport failure: {source}")]
  Transport {
    #[from]
    source: TransportError,
  },

  /// The storage uniqueness constraint rejected a second record for the same message id.
  #[error("An outbox record for message '{message_id}' already exists")]
  DuplicateOutboxRecord { message_id: String },

  #[error("The outbox transaction has already been completed")]
  TransactionCompleted,

  #[error("Outbox storage failure. Source: {source}")]
  Storage {
    #[source]
    source: AnyhowError,
  },

  #[error("Internal portage error: {0}")]
  Internal(String),
}

// Handler code uses anyhow; a PortageError that travelled through anyhow comes back out intact.
impl From<AnyhowError> for PortageError {
  fn from(err: AnyhowError) -> Self {
    match err.downcast::<PortageError>() {
      Ok(portage_err) => portage_err,
      Err(source) => PortageError::Handler { source },
    }
  }
}

impl PortageError {
  pub fn configuration(message: impl Into<String>) -> Self {
    PortageError::Configuration {
      message: message.into(),
    }
  }

  /// Attaches the name of the faulting step. Errors that already carry a step
  /// pass through unchanged, so outer steps never hide the innermost one.
  pub fn in_step(self, step_name: &str) -> Self {
    match self {
      already @ PortageError::Step { .. } => already,
      other => PortageError::Step {
        step_name: step_name.to_string(),
        source: Box::new(other),
      },
    }
  }

  /// The failure underneath any step annotation.
  pub fn root(&self) -> &PortageError {
    match self {
      PortageError::Step { source, .. } => source.root(),
      other => other,
    }
  }

  pub fn faulted_step(&self) -> Option<&str> {
    match self {
      PortageError::Step { step_name, .. } => Some(step_name),
      _ => None,
    }
  }

  /// Short, stable name of the failure kind, used in diagnostic headers.
  pub fn kind(&self) -> &'static str {
    match self.root() {
      PortageError::Step { .. } => "Step",
      PortageError::Handler { .. } => "Handler",
      PortageError::MessageDeserialization { .. } => "MessageDeserialization",
      PortageError::NoHandlers { .. } => "NoHandlers",
      PortageError::TypeMismatch { .. } => "TypeMismatch",
      PortageError::Configuration { .. } => "Configuration",
      PortageError::DuplicateStep { .. } => "DuplicateStep",
      PortageError::StepNotFound { .. } => "StepNotFound",
      PortageError::MissingStepDependency { .. } => "MissingStepDependency",
      PortageError::CyclicStepOrdering { .. } => "CyclicStepOrdering",
      PortageError::StepContextMismatch { .. } => "StepContextMismatch",
      PortageError::UnroutableMessage { .. } => "UnroutableMessage",
      PortageError::QueueNotFound { .. } => "QueueNotFound",
      PortageError::Transport { .. } => "Transport",
      PortageError::DuplicateOutboxRecord { .. } => "DuplicateOutboxRecord",
      PortageError::TransactionCompleted => "TransactionCompleted",
      PortageError::Storage { .. } => "Storage",
      PortageError::Internal(_) => "Internal",
    }
  }

  /// Poison messages and configuration mistakes (including a message type with
  /// no route) skip both retry tiers: another attempt cannot succeed.
  pub fn is_unrecoverable(&self) -> bool {
    matches!(
      self.root(),
      PortageError::MessageDeserialization { .. } | PortageError::UnroutableMessage { .. }
    ) || self.is_configuration()
  }

  /// Another worker is (or was) handling the same message id.
  pub fn is_outbox_contention(&self) -> bool {
    matches!(self.root(), PortageError::DuplicateOutboxRecord { .. })
  }

  pub fn is_configuration(&self) -> bool {
    matches!(
      self.root(),
      PortageError::Configuration { .. }
        | PortageError::DuplicateStep { .. }
        | PortageError::StepNotFound { .. }
        | PortageError::MissingStepDependency { .. }
        | PortageError::CyclicStepOrdering { .. }
        | PortageError::StepContextMismatch { .. }
    )
  }

  /// True when an error of type `E` appears anywhere in the root failure's source chain.
  pub fn is_caused_by<E>(&self) -> bool
  where
    E: std::error::Error + 'static,
  {
    match self.root() {
      PortageError::Handler { source } | PortageError::Storage { source } => source.chain().any(|cause| cause.is::<E>()),
      PortageError::Transport { source } => {
        let cause: &(dyn std::error::Error + 'static) = source;
        cause.is::<E>()
      }
      other => {
        let cause: &(dyn std::error::Error + 'static) = other;
        cause.is::<E>()
      }
    }
  }
}

pub type PortageResult<T, E = PortageError> = std::result::Result<T, E>;
