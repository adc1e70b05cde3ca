// portage/src/pipeline/contexts.rs

//! The stage contexts of the receive and outgoing pipelines, and the bag keys
//! the built-in steps share.
//!
//! Receive: `IncomingPhysicalContext` -> `IncomingLogicalContext` -> `InvokeHandlerContext`.
//! Outgoing: `OutgoingLogicalContext` -> `RoutingContext`.

use crate::core::context::BehaviorContext;
use crate::core::context_bag::{ContextBag, ContextKey};
use crate::headers::{self, Headers, MessageIntent};
use crate::pipeline::execution::Pipeline;
use crate::receive::LogicalMessage;
use crate::registry::RegisteredHandler;
use crate::session::{OutgoingLogicalMessage, SendOptions};
use crate::transport::{IncomingMessage, OutgoingMessage, TransportOperation};
use parking_lot::Mutex;
use std::sync::Arc;

/// Outgoing operations collected during one receive, dispatched only after the
/// handlers succeed.
pub const PENDING_OPERATIONS: ContextKey<Arc<PendingOperations>> = ContextKey::new("portage.pending_operations");

pub const INCOMING_MESSAGE: ContextKey<IncomingMessageInfo> = ContextKey::new("portage.incoming_message");

pub const OUTGOING_PIPELINE: ContextKey<Pipeline<OutgoingLogicalContext>> = ContextKey::new("portage.outgoing_pipeline");

#[derive(Debug, Default)]
pub struct PendingOperations {
  operations: Mutex<Vec<TransportOperation>>,
}

impl PendingOperations {
  pub fn push(&self, operation: TransportOperation) {
    self.operations.lock().push(operation);
  }

  pub fn drain(&self) -> Vec<TransportOperation> {
    std::mem::take(&mut *self.operations.lock())
  }

  pub fn len(&self) -> usize {
    self.operations.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.operations.lock().is_empty()
  }
}

/// What outgoing messages need to know about the message being handled.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessageInfo {
  pub message_id: String,
  pub reply_to: Option<String>,
  pub correlation_id: Option<String>,
  pub conversation_id: Option<String>,
}

impl IncomingMessageInfo {
  pub fn from_message(message: &IncomingMessage) -> Self {
    IncomingMessageInfo {
      message_id: message.message_id.clone(),
      reply_to: message.header(headers::REPLY_TO_ADDRESS).map(str::to_string),
      correlation_id: message.header(headers::CORRELATION_ID).map(str::to_string),
      conversation_id: message.header(headers::CONVERSATION_ID).map(str::to_string),
    }
  }
}

/// Root of the receive pipeline: the raw delivery.
#[derive(Debug)]
pub struct IncomingPhysicalContext {
  pub message: IncomingMessage,
  pub receive_address: String,
  pub bag: ContextBag,
}

#[derive(Debug)]
pub struct IncomingLogicalContext {
  pub message_id: String,
  pub headers: Headers,
  pub message: LogicalMessage,
  pub bag: ContextBag,
}

/// One handler about to run for one logical message.
pub struct InvokeHandlerContext {
  pub message_id: String,
  pub headers: Headers,
  pub message: LogicalMessage,
  pub handler: RegisteredHandler,
  pub bag: ContextBag,
}

/// Root of the outgoing pipeline: a logical message one handler (or the
/// application) wants sent.
#[derive(Debug)]
pub struct OutgoingLogicalContext {
  pub message_id: String,
  pub intent: MessageIntent,
  pub message: OutgoingLogicalMessage,
  pub options: SendOptions,
  pub headers: Headers,
  pub bag: ContextBag,
}

/// A physical message with its resolved destinations.
#[derive(Debug)]
pub struct RoutingContext {
  pub message: OutgoingMessage,
  pub destinations: Vec<String>,
  pub bag: ContextBag,
}

macro_rules! impl_behavior_context {
  ($($ctx:ty),* $(,)?) => {
    $(
      impl BehaviorContext for $ctx {
        fn extensions(&self) -> &ContextBag {
          &self.bag
        }

        fn extensions_mut(&mut self) -> &mut ContextBag {
          &mut self.bag
        }
      }
    )*
  };
}

impl_behavior_context!(
  IncomingPhysicalContext,
  IncomingLogicalContext,
  InvokeHandlerContext,
  OutgoingLogicalContext,
  RoutingContext,
);
