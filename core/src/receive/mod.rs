// portage/src/receive/mod.rs

//! The receive side: logical messages, the handler contract, and the
//! built-in receive-pipeline steps.

pub mod steps;

use crate::core::context_bag::{ContextBag, ContextKey};
use crate::error::{PortageError, PortageResult};
use crate::headers::{self, Headers};
use crate::outbox::{OutboxTransaction, OUTBOX_TRANSACTION};
use crate::session::{MessageSession, OutgoingLogicalMessage, SendOptions};
use crate::transport::IncomingMessage;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// A message after deserialization: its logical type and body.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalMessage {
  pub message_type: String,
  pub body: Bytes,
}

impl LogicalMessage {
  pub fn new(message_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
    LogicalMessage {
      message_type: message_type.into(),
      body: body.into(),
    }
  }

  pub fn body_str(&self) -> Option<&str> {
    std::str::from_utf8(&self.body).ok()
  }
}

/// Turns a raw delivery into a logical message. A failure here marks the
/// message as poison: it is never retried.
pub trait MessageDeserializer: Send + Sync + 'static {
  fn deserialize(&self, message: &IncomingMessage) -> PortageResult<LogicalMessage>;
}

/// Takes the logical type from the first entry of the enclosed-types header
/// and passes the body through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnclosedTypeDeserializer;

impl MessageDeserializer for EnclosedTypeDeserializer {
  fn deserialize(&self, message: &IncomingMessage) -> PortageResult<LogicalMessage> {
    let message_type = message
      .header(headers::ENCLOSED_MESSAGE_TYPES)
      .and_then(|types| types.split(';').next())
      .map(str::trim)
      .filter(|first| !first.is_empty())
      .ok_or_else(|| PortageError::MessageDeserialization {
        message_id: message.message_id.clone(),
        reason: format!("missing or empty '{}' header", headers::ENCLOSED_MESSAGE_TYPES),
      })?;
    Ok(LogicalMessage::new(message_type, message.body.clone()))
  }
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
  async fn handle(&self, message: &LogicalMessage, ctx: &HandlerContext) -> anyhow::Result<()>;
}

pub struct FnHandler<F, Fut> {
  f: F,
  _fut: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure as a [`MessageHandler`]. The closure receives owned
/// copies so its future can be `'static`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
  F: Fn(LogicalMessage, HandlerContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
  FnHandler { f, _fut: PhantomData }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
  F: Fn(LogicalMessage, HandlerContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
  async fn handle(&self, message: &LogicalMessage, ctx: &HandlerContext) -> anyhow::Result<()> {
    (self.f)(message.clone(), ctx.clone()).await
  }
}

/// What a handler sees of the message being processed and of the endpoint.
/// Messages sent through it are held back until every handler for the
/// incoming message has succeeded.
#[derive(Clone)]
pub struct HandlerContext {
  message_id: String,
  headers: Headers,
  session: MessageSession,
  bag: ContextBag,
}

impl HandlerContext {
  pub(crate) fn new(message_id: String, headers: Headers, session: MessageSession, bag: ContextBag) -> Self {
    HandlerContext {
      message_id,
      headers,
      session,
      bag,
    }
  }

  pub fn message_id(&self) -> &str {
    &self.message_id
  }

  pub fn headers(&self) -> &Headers {
    &self.headers
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).map(String::as_str)
  }

  pub fn get<T: Clone + Send + Sync + 'static>(&self, key: ContextKey<T>) -> Option<T> {
    self.bag.get(key)
  }

  /// The outbox transaction the current message is handled in, if the outbox
  /// is enabled. Enlist state changes here to commit them together with the
  /// outgoing messages.
  pub fn storage_transaction(&self) -> Option<Arc<dyn OutboxTransaction>> {
    self.bag.get(OUTBOX_TRANSACTION)
  }

  pub async fn send(&self, message: OutgoingLogicalMessage, options: SendOptions) -> PortageResult<()> {
    self.session.send(message, options).await
  }

  pub async fn send_local(&self, message: OutgoingLogicalMessage) -> PortageResult<()> {
    self.session.send_local(message).await
  }

  pub async fn publish(&self, message: OutgoingLogicalMessage) -> PortageResult<()> {
    self.session.publish(message).await
  }

  /// Replies to the incoming message's reply-to address.
  pub async fn reply(&self, message: OutgoingLogicalMessage) -> PortageResult<()> {
    self.session.reply(message, SendOptions::new()).await
  }

  pub async fn reply_with(&self, message: OutgoingLogicalMessage, options: SendOptions) -> PortageResult<()> {
    self.session.reply(message, options).await
  }
}

impl fmt::Debug for HandlerContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HandlerContext")
      .field("message_id", &self.message_id)
      .field("headers", &self.headers)
      .finish()
  }
}
