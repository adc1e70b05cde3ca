// portage/src/endpoint/configuration.rs
use crate::config::EndpointSettings;
use crate::core::context::ContextType;
use crate::core::step::RegisterStep;
use crate::error::{PortageError, PortageResult};
use crate::notifications::Notifications;
use crate::outbox::OutboxStorage;
use crate::pipeline::contexts::{OutgoingLogicalContext, RoutingContext};
use crate::pipeline::definition::StepRegistry;
use crate::receive::{EnclosedTypeDeserializer, HandlerContext, LogicalMessage, MessageDeserializer, MessageHandler};
use crate::recoverability::{BackoffPolicy, CustomPolicy, ErrorContext, RecoverabilityAction, RecoverabilityConfig, UnrecoverableFailure};
use crate::registry::HandlerRegistry;
use crate::routing::RoutingTable;
use crate::transport::Transport;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub(crate) enum StepCustomization {
  Register(RegisterStep),
  Replace { step_name: String, step: RegisterStep },
  Remove(String),
}

/// Everything an [`Endpoint`](super::Endpoint) is built from. Nothing is
/// validated until `Endpoint::create`.
pub struct EndpointConfiguration {
  pub(crate) settings: EndpointSettings,
  pub(crate) transport: Option<Arc<dyn Transport>>,
  pub(crate) outbox: Option<Arc<dyn OutboxStorage>>,
  pub(crate) deserializer: Arc<dyn MessageDeserializer>,
  pub(crate) routing: RoutingTable,
  pub(crate) handlers: HandlerRegistry,
  pub(crate) customizations: Vec<StepCustomization>,
  pub(crate) backoff: Option<Arc<dyn BackoffPolicy>>,
  pub(crate) unrecoverable: Vec<UnrecoverableFailure>,
  pub(crate) custom_policy: Option<CustomPolicy>,
  pub(crate) notifications: Arc<Notifications>,
}

impl EndpointConfiguration {
  pub fn new(settings: EndpointSettings) -> Self {
    EndpointConfiguration {
      settings,
      transport: None,
      outbox: None,
      deserializer: Arc::new(EnclosedTypeDeserializer),
      routing: RoutingTable::new(),
      handlers: HandlerRegistry::new(),
      customizations: Vec::new(),
      backoff: None,
      unrecoverable: Vec::new(),
      custom_policy: None,
      notifications: Arc::new(Notifications::new()),
    }
  }

  pub fn settings(&self) -> &EndpointSettings {
    &self.settings
  }

  pub fn settings_mut(&mut self) -> &mut EndpointSettings {
    &mut self.settings
  }

  pub fn use_transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
    self.transport = Some(transport);
    self
  }

  /// Handles every message inside an outbox transaction instead of batching
  /// its outgoing messages in memory.
  pub fn enable_outbox(&mut self, storage: Arc<dyn OutboxStorage>) -> &mut Self {
    self.outbox = Some(storage);
    self
  }

  pub fn use_deserializer(&mut self, deserializer: Arc<dyn MessageDeserializer>) -> &mut Self {
    self.deserializer = deserializer;
    self
  }

  pub fn routing(&mut self) -> &mut RoutingTable {
    &mut self.routing
  }

  pub fn handle<H: MessageHandler>(&mut self, message_type: impl Into<String>, name: impl Into<String>, handler: H) -> &mut Self {
    self.handlers.register(message_type, name, handler);
    self
  }

  pub fn handle_fn<F, Fut>(&mut self, message_type: impl Into<String>, name: impl Into<String>, f: F) -> &mut Self
  where
    F: Fn(LogicalMessage, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    self.handlers.register_fn(message_type, name, f);
    self
  }

  /// Adds a step to the receive or outgoing pipeline, chosen by the context
  /// type the step operates on.
  pub fn register_step(&mut self, step: RegisterStep) -> &mut Self {
    self.customizations.push(StepCustomization::Register(step));
    self
  }

  pub fn replace_step(&mut self, step_name: impl Into<String>, step: RegisterStep) -> &mut Self {
    self.customizations.push(StepCustomization::Replace {
      step_name: step_name.into(),
      step,
    });
    self
  }

  pub fn remove_step(&mut self, step_name: impl Into<String>) -> &mut Self {
    self.customizations.push(StepCustomization::Remove(step_name.into()));
    self
  }

  pub fn delayed_retry_backoff(&mut self, backoff: Arc<dyn BackoffPolicy>) -> &mut Self {
    self.backoff = Some(backoff);
    self
  }

  pub fn add_unrecoverable_failure(&mut self, failure: UnrecoverableFailure) -> &mut Self {
    self.unrecoverable.push(failure);
    self
  }

  pub fn custom_recoverability_policy<F>(&mut self, policy: F) -> &mut Self
  where
    F: Fn(&RecoverabilityConfig, &ErrorContext) -> RecoverabilityAction + Send + Sync + 'static,
  {
    self.custom_policy = Some(Arc::new(policy));
    self
  }

  /// Subscribe before the endpoint starts; the same instance is shared with it.
  pub fn notifications(&self) -> Arc<Notifications> {
    Arc::clone(&self.notifications)
  }
}

impl fmt::Debug for EndpointConfiguration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EndpointConfiguration")
      .field("settings", &self.settings)
      .field("has_transport", &self.transport.is_some())
      .field("outbox_enabled", &self.outbox.is_some())
      .field("routing", &self.routing)
      .field("message_types", &self.handlers.message_types())
      .field("customizations", &self.customizations.len())
      .finish()
  }
}

fn targets_outgoing(step: &RegisterStep) -> bool {
  let input = step.input();
  input == ContextType::of::<OutgoingLogicalContext>() || input == ContextType::of::<RoutingContext>()
}

/// Applies user step changes, in the order they were configured.
pub(crate) fn apply_customizations(
  customizations: Vec<StepCustomization>,
  receive: &mut StepRegistry,
  outgoing: &mut StepRegistry,
) -> PortageResult<()> {
  for customization in customizations {
    match customization {
      StepCustomization::Register(step) => {
        if targets_outgoing(&step) {
          outgoing.register(step)?;
        } else {
          receive.register(step)?;
        }
      }
      StepCustomization::Replace { step_name, step } => {
        if outgoing.contains(&step_name) {
          outgoing.replace(&step_name, step)?;
        } else {
          receive.replace(&step_name, step)?;
        }
      }
      StepCustomization::Remove(step_name) => {
        if outgoing.contains(&step_name) {
          outgoing.remove(&step_name)?;
        } else if receive.contains(&step_name) {
          receive.remove(&step_name)?;
        } else {
          return Err(PortageError::StepNotFound { step_name });
        }
      }
    }
  }
  Ok(())
}
