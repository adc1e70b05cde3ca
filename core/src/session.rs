// portage/src/session.rs

//! `MessageSession`: the entry point into the outgoing pipeline, used by
//! handlers and by application code outside a handler.

use crate::core::context_bag::ContextBag;
use crate::core::context_data::ContextData;
use crate::error::PortageResult;
use crate::headers::{Headers, MessageIntent};
use crate::pipeline::contexts::OutgoingLogicalContext;
use crate::pipeline::execution::Pipeline;
use bytes::Bytes;
use std::fmt;
use tracing::{event, Level};

/// A message before routing: a type name plus an opaque, already-serialized body.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingLogicalMessage {
  pub message_type: String,
  pub body: Bytes,
}

impl OutgoingLogicalMessage {
  pub fn new(message_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
    OutgoingLogicalMessage {
      message_type: message_type.into(),
      body: body.into(),
    }
  }
}

/// Per-message routing and header overrides.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
  pub(crate) destination: Option<String>,
  pub(crate) route_to_this_endpoint: bool,
  pub(crate) route_to_this_instance: bool,
  pub(crate) route_reply_to_this_instance: bool,
  pub(crate) message_id: Option<String>,
  pub(crate) headers: Headers,
}

impl SendOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Bypasses the routing table.
  pub fn destination(mut self, destination: impl Into<String>) -> Self {
    self.destination = Some(destination.into());
    self
  }

  pub fn route_to_this_endpoint(mut self) -> Self {
    self.route_to_this_endpoint = true;
    self
  }

  /// Sends to this endpoint's instance-specific queue. Requires an instance
  /// discriminator.
  pub fn route_to_this_instance(mut self) -> Self {
    self.route_to_this_instance = true;
    self
  }

  /// Asks the receiver to reply to this instance rather than to the shared
  /// endpoint queue.
  pub fn route_reply_to_this_instance(mut self) -> Self {
    self.route_reply_to_this_instance = true;
    self
  }

  pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
    self.message_id = Some(message_id.into());
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn explicit_destination(&self) -> Option<&str> {
    self.destination.as_deref()
  }

  pub fn is_route_to_this_endpoint(&self) -> bool {
    self.route_to_this_endpoint
  }

  pub fn is_route_to_this_instance(&self) -> bool {
    self.route_to_this_instance
  }

  pub fn is_route_reply_to_this_instance(&self) -> bool {
    self.route_reply_to_this_instance
  }
}

/// Sends run the outgoing pipeline inside a child of the session's bag, so a
/// session created while handling a message inherits that message's pending
/// operations and outbox transaction.
#[derive(Clone)]
pub struct MessageSession {
  outgoing: Pipeline<OutgoingLogicalContext>,
  bag: ContextBag,
}

impl MessageSession {
  pub(crate) fn new(outgoing: Pipeline<OutgoingLogicalContext>, bag: ContextBag) -> Self {
    MessageSession { outgoing, bag }
  }

  pub async fn send(&self, message: OutgoingLogicalMessage, options: SendOptions) -> PortageResult<()> {
    self.dispatch(MessageIntent::Send, message, options).await
  }

  pub async fn send_local(&self, message: OutgoingLogicalMessage) -> PortageResult<()> {
    self
      .dispatch(MessageIntent::Send, message, SendOptions::new().route_to_this_endpoint())
      .await
  }

  /// Publishing to a type with no subscribers succeeds without sending anything.
  pub async fn publish(&self, message: OutgoingLogicalMessage) -> PortageResult<()> {
    self.dispatch(MessageIntent::Publish, message, SendOptions::new()).await
  }

  pub async fn reply(&self, message: OutgoingLogicalMessage, options: SendOptions) -> PortageResult<()> {
    self.dispatch(MessageIntent::Reply, message, options).await
  }

  async fn dispatch(
    &self,
    intent: MessageIntent,
    message: OutgoingLogicalMessage,
    options: SendOptions,
  ) -> PortageResult<()> {
    let message_id = options
      .message_id
      .clone()
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    event!(Level::TRACE, %intent, %message_id, message_type = %message.message_type, "Outgoing message.");

    let ctx = OutgoingLogicalContext {
      message_id,
      intent,
      headers: options.headers.clone(),
      message,
      options,
      bag: self.bag.child(),
    };
    self.outgoing.execute(ContextData::new(ctx)).await
  }
}

impl fmt::Debug for MessageSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MessageSession")
      .field("outgoing", &self.outgoing)
      .finish()
  }
}
