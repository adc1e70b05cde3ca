// portage/src/routing/mod.rs

//! Resolves logical message types to transport addresses.

pub mod dispatch;
pub mod steps;

pub use dispatch::MessageDispatcher;

use crate::error::{PortageError, PortageResult};
use crate::headers::MessageIntent;
use crate::pipeline::contexts::IncomingMessageInfo;
use crate::session::SendOptions;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{event, Level};

type ConventionPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
struct RoutingConvention {
  description: String,
  matches: ConventionPredicate,
  destination: String,
}

/// Static routing rules. Explicit endpoint mappings win over conventions;
/// conventions are tried in registration order.
#[derive(Clone, Default)]
pub struct RoutingTable {
  endpoints: HashMap<String, String>,
  conventions: Vec<RoutingConvention>,
  subscribers: HashMap<String, Vec<String>>,
}

impl RoutingTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route_to_endpoint(&mut self, message_type: impl Into<String>, destination: impl Into<String>) -> &mut Self {
    self.endpoints.insert(message_type.into(), destination.into());
    self
  }

  /// Routes every message type accepted by `matches` to `destination`.
  pub fn route_by_convention<F>(
    &mut self,
    description: impl Into<String>,
    matches: F,
    destination: impl Into<String>,
  ) -> &mut Self
  where
    F: Fn(&str) -> bool + Send + Sync + 'static,
  {
    self.conventions.push(RoutingConvention {
      description: description.into(),
      matches: Arc::new(matches),
      destination: destination.into(),
    });
    self
  }

  /// Adds `subscriber` as a recipient of every publish of `message_type`.
  pub fn register_subscriber(&mut self, message_type: impl Into<String>, subscriber: impl Into<String>) -> &mut Self {
    let subscriber = subscriber.into();
    let entry = self.subscribers.entry(message_type.into()).or_default();
    if !entry.contains(&subscriber) {
      entry.push(subscriber);
    }
    self
  }

  pub fn destination_for(&self, message_type: &str) -> Option<&str> {
    if let Some(destination) = self.endpoints.get(message_type) {
      return Some(destination);
    }
    self
      .conventions
      .iter()
      .find(|convention| (convention.matches)(message_type))
      .map(|convention| {
        event!(Level::TRACE, message_type, convention = %convention.description, "Routed by convention.");
        convention.destination.as_str()
      })
  }

  pub fn subscribers_for(&self, message_type: &str) -> &[String] {
    self.subscribers.get(message_type).map(Vec::as_slice).unwrap_or(&[])
  }
}

impl fmt::Debug for RoutingTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let conventions: Vec<_> = self
      .conventions
      .iter()
      .map(|c| (c.description.as_str(), c.destination.as_str()))
      .collect();
    f.debug_struct("RoutingTable")
      .field("endpoints", &self.endpoints)
      .field("conventions", &conventions)
      .field("subscribers", &self.subscribers)
      .finish()
  }
}

/// Applies the routing table together with the per-message options and this
/// endpoint's own addresses.
#[derive(Debug, Clone)]
pub struct UnicastRouter {
  table: RoutingTable,
  local_address: String,
  instance_address: Option<String>,
}

impl UnicastRouter {
  pub fn new(table: RoutingTable, local_address: impl Into<String>, instance_address: Option<String>) -> Self {
    UnicastRouter {
      table,
      local_address: local_address.into(),
      instance_address,
    }
  }

  pub fn local_address(&self) -> &str {
    &self.local_address
  }

  pub fn instance_address(&self) -> Option<&str> {
    self.instance_address.as_deref()
  }

  /// The address replies to this message should go to.
  pub fn reply_to_address(&self, options: &SendOptions) -> PortageResult<&str> {
    if options.is_route_reply_to_this_instance() {
      return self.require_instance_address();
    }
    Ok(&self.local_address)
  }

  /// Every destination the message must be delivered to. An empty list is
  /// only possible for a publish with no subscribers.
  pub fn route(
    &self,
    intent: MessageIntent,
    message_type: &str,
    options: &SendOptions,
    incoming: Option<&IncomingMessageInfo>,
  ) -> PortageResult<Vec<String>> {
    if let Some(destination) = options.explicit_destination() {
      return Ok(vec![destination.to_string()]);
    }
    if options.is_route_to_this_instance() {
      return Ok(vec![self.require_instance_address()?.to_string()]);
    }

    match intent {
      MessageIntent::Send => {
        if options.is_route_to_this_endpoint() {
          return Ok(vec![self.local_address.clone()]);
        }
        self
          .table
          .destination_for(message_type)
          .map(|destination| vec![destination.to_string()])
          .ok_or_else(|| PortageError::UnroutableMessage {
            message_type: message_type.to_string(),
            reason: "no endpoint mapping or routing convention matches it; add one to the routing table or pass an explicit destination".to_string(),
          })
      }
      MessageIntent::Publish => {
        let subscribers = self.table.subscribers_for(message_type);
        if subscribers.is_empty() {
          event!(Level::DEBUG, message_type, "No subscribers for published message.");
        }
        Ok(subscribers.to_vec())
      }
      MessageIntent::Reply => incoming
        .and_then(|info| info.reply_to.clone())
        .map(|reply_to| vec![reply_to])
        .ok_or_else(|| PortageError::UnroutableMessage {
          message_type: message_type.to_string(),
          reason: "the message being replied to carries no reply-to address; pass an explicit destination".to_string(),
        }),
    }
  }

  fn require_instance_address(&self) -> PortageResult<&str> {
    self.instance_address.as_deref().ok_or_else(|| {
      PortageError::configuration("instance-specific routing requires an instance discriminator to be configured")
    })
  }
}
