// portage/src/transport/mod.rs

//! The transport collaborator: the narrow interface the runtime needs from a
//! queueing system, plus the message shapes that cross it.
//!
//! Broker-specific clients implement [`Transport`]. [`InMemoryTransport`] is a
//! process-local implementation for tests and demos.

pub mod in_memory;

pub use in_memory::InMemoryTransport;

use crate::headers::{self, Headers};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
  /// Kept distinct from other send failures so routing mistakes are diagnosable.
  #[error("Queue '{queue}' not found")]
  QueueNotFound { queue: String },

  #[error("Transport operation failed. Source: {source}")]
  Other {
    #[from]
    source: anyhow::Error,
  },
}

/// A message as delivered by the transport: raw body plus headers.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
  pub message_id: String,
  pub headers: Headers,
  pub body: Bytes,
}

impl IncomingMessage {
  pub fn new(message_id: impl Into<String>, headers: Headers, body: impl Into<Bytes>) -> Self {
    Self {
      message_id: message_id.into(),
      headers,
      body: body.into(),
    }
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).map(String::as_str)
  }

  pub fn delayed_retries(&self) -> u32 {
    headers::delayed_retries(&self.headers)
  }
}

/// A fully formed physical message ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
  pub message_id: String,
  pub headers: Headers,
  pub body: Bytes,
}

impl OutgoingMessage {
  pub fn new(message_id: impl Into<String>, headers: Headers, body: impl Into<Bytes>) -> Self {
    Self {
      message_id: message_id.into(),
      headers,
      body: body.into(),
    }
  }

  pub fn message_type(&self) -> Option<&str> {
    self.headers.get(headers::ENCLOSED_MESSAGE_TYPES).map(String::as_str)
  }
}

impl From<OutgoingMessage> for IncomingMessage {
  fn from(message: OutgoingMessage) -> Self {
    IncomingMessage {
      message_id: message.message_id,
      headers: message.headers,
      body: message.body,
    }
  }
}

/// One unit of outbound work: one message to one destination. The operation id
/// is what the transport deduplicates on. It is assigned when the operation is
/// created and travels with it through the outbox, so a replay reuses it while
/// a new copy of the same message (a delayed retry, a second trip to the error
/// queue) gets a fresh one.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOperation {
  pub operation_id: String,
  pub message: OutgoingMessage,
  pub destination: String,
}

impl TransportOperation {
  pub fn new(message: OutgoingMessage, destination: impl Into<String>) -> Self {
    Self::with_id(uuid::Uuid::new_v4().to_string(), message, destination)
  }

  pub fn with_id(operation_id: impl Into<String>, message: OutgoingMessage, destination: impl Into<String>) -> Self {
    Self {
      operation_id: operation_id.into(),
      message,
      destination: destination.into(),
    }
  }

  pub fn operation_id(&self) -> &str {
    &self.operation_id
  }
}

/// Opaque receipt for one delivery; handed back to the transport to
/// acknowledge or release the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportTransaction {
  receipt: String,
}

impl TransportTransaction {
  pub fn new(receipt: impl Into<String>) -> Self {
    Self { receipt: receipt.into() }
  }

  pub fn receipt(&self) -> &str {
    &self.receipt
  }
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
  pub message: IncomingMessage,
  pub transaction: TransportTransaction,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
  /// Waits for the next message on `queue`. `Ok(None)` means the transport has
  /// shut down and no further messages will arrive.
  async fn receive(&self, queue: &str) -> Result<Option<ReceivedMessage>, TransportError>;

  async fn send(&self, operation: &TransportOperation) -> Result<(), TransportError>;

  /// Delivers `operation` after `delay`; used for delayed retries.
  async fn defer(&self, operation: &TransportOperation, delay: Duration) -> Result<(), TransportError>;

  /// The message was handled (or routed elsewhere) and must not be redelivered.
  async fn acknowledge(&self, transaction: &TransportTransaction) -> Result<(), TransportError>;

  /// Processing was abandoned; the message becomes available for redelivery.
  async fn release(&self, transaction: &TransportTransaction) -> Result<(), TransportError>;
}
