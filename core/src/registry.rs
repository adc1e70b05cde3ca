// portage/src/registry.rs

//! `HandlerRegistry`: message handlers keyed by logical message type.

use crate::receive::{handler_fn, HandlerContext, LogicalMessage, MessageHandler};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{event, Level};

/// A handler plus the name it is reported under in diagnostics.
#[derive(Clone)]
pub struct RegisteredHandler {
  pub name: String,
  pub handler: Arc<dyn MessageHandler>,
}

impl fmt::Debug for RegisteredHandler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RegisteredHandler").field("name", &self.name).finish()
  }
}

/// Handlers for one message type run in registration order.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
  handlers: HashMap<String, Vec<RegisteredHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<H: MessageHandler>(&mut self, message_type: impl Into<String>, name: impl Into<String>, handler: H) {
    let message_type = message_type.into();
    let name = name.into();
    event!(Level::DEBUG, %message_type, handler = %name, "Registering message handler.");
    self
      .handlers
      .entry(message_type)
      .or_default()
      .push(RegisteredHandler {
        name,
        handler: Arc::new(handler),
      });
  }

  pub fn register_fn<F, Fut>(&mut self, message_type: impl Into<String>, name: impl Into<String>, f: F)
  where
    F: Fn(LogicalMessage, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    self.register(message_type, name, handler_fn(f));
  }

  pub fn handlers_for(&self, message_type: &str) -> Vec<RegisteredHandler> {
    self.handlers.get(message_type).cloned().unwrap_or_default()
  }

  pub fn handles(&self, message_type: &str) -> bool {
    self.handlers.get(message_type).is_some_and(|handlers| !handlers.is_empty())
  }

  /// Registered message types, sorted.
  pub fn message_types(&self) -> Vec<&str> {
    let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
    types.sort_unstable();
    types
  }
}
