// portage/src/receive/steps.rs

//! Built-in receive-pipeline steps, in execution order:
//! `batch_dispatch` (or `outbox`), `deserialize`, `load_handlers`, `invoke_handler`.

use super::{HandlerContext, MessageDeserializer};
use crate::core::context_data::ContextData;
use crate::core::step::{Behavior, StageConnector};
use crate::error::{PortageError, PortageResult};
use crate::pipeline::contexts::{
  IncomingLogicalContext, IncomingPhysicalContext, InvokeHandlerContext, PendingOperations, OUTGOING_PIPELINE,
  PENDING_OPERATIONS,
};
use crate::pipeline::execution::Next;
use crate::registry::HandlerRegistry;
use crate::routing::MessageDispatcher;
use crate::session::MessageSession;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{event, Level};

pub const BATCH_DISPATCH: &str = "batch_dispatch";
pub const DESERIALIZE: &str = "deserialize";
pub const LOAD_HANDLERS: &str = "load_handlers";
pub const INVOKE_HANDLER: &str = "invoke_handler";

/// Collects every message sent while handling and dispatches them only once
/// the rest of the pipeline has succeeded. Used when the outbox is disabled.
pub struct BatchDispatchBehavior {
  dispatcher: Arc<MessageDispatcher>,
}

impl BatchDispatchBehavior {
  pub fn new(dispatcher: Arc<MessageDispatcher>) -> Self {
    BatchDispatchBehavior { dispatcher }
  }
}

#[async_trait]
impl Behavior<IncomingPhysicalContext> for BatchDispatchBehavior {
  async fn invoke(&self, ctx: ContextData<IncomingPhysicalContext>, next: Next<IncomingPhysicalContext>) -> PortageResult<()> {
    let pending = Arc::new(PendingOperations::default());
    ctx.set_extension(PENDING_OPERATIONS, Arc::clone(&pending));

    next.run(ctx).await?;

    let operations = pending.drain();
    if !operations.is_empty() {
      event!(Level::DEBUG, count = operations.len(), "Dispatching batched operations.");
      self.dispatcher.dispatch(&operations).await?;
    }
    Ok(())
  }
}

pub struct DeserializeConnector {
  deserializer: Arc<dyn MessageDeserializer>,
}

impl DeserializeConnector {
  pub fn new(deserializer: Arc<dyn MessageDeserializer>) -> Self {
    DeserializeConnector { deserializer }
  }
}

#[async_trait]
impl StageConnector<IncomingPhysicalContext, IncomingLogicalContext> for DeserializeConnector {
  async fn invoke(
    &self,
    ctx: ContextData<IncomingPhysicalContext>,
    stage: Next<IncomingLogicalContext>,
  ) -> PortageResult<()> {
    let logical = ctx.inspect(|c| -> PortageResult<IncomingLogicalContext> {
      let message = self.deserializer.deserialize(&c.message)?;
      Ok(IncomingLogicalContext {
        message_id: c.message.message_id.clone(),
        headers: c.message.headers.clone(),
        message,
        bag: c.bag.child(),
      })
    })?;
    stage.run(ContextData::new(logical)).await
  }
}

pub struct LoadHandlersConnector {
  handlers: Arc<HandlerRegistry>,
}

impl LoadHandlersConnector {
  pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
    LoadHandlersConnector { handlers }
  }
}

#[async_trait]
impl StageConnector<IncomingLogicalContext, InvokeHandlerContext> for LoadHandlersConnector {
  async fn invoke(&self, ctx: ContextData<IncomingLogicalContext>, stage: Next<InvokeHandlerContext>) -> PortageResult<()> {
    let (message_id, headers, message, bag) = ctx.inspect(|c| (c.message_id.clone(), c.headers.clone(), c.message.clone(), c.bag.clone()));

    let handlers = self.handlers.handlers_for(&message.message_type);
    if handlers.is_empty() {
      return Err(PortageError::NoHandlers {
        message_type: message.message_type,
      });
    }

    for handler in handlers {
      let invoke = InvokeHandlerContext {
        message_id: message_id.clone(),
        headers: headers.clone(),
        message: message.clone(),
        handler,
        bag: bag.child(),
      };
      stage.run(ContextData::new(invoke)).await?;
    }
    Ok(())
  }
}

/// Runs the user handler, then the rest of the stage.
#[derive(Debug, Default)]
pub struct InvokeHandlerBehavior;

#[async_trait]
impl Behavior<InvokeHandlerContext> for InvokeHandlerBehavior {
  async fn invoke(&self, ctx: ContextData<InvokeHandlerContext>, next: Next<InvokeHandlerContext>) -> PortageResult<()> {
    let (handler, message, handler_ctx) = ctx.inspect(|c| -> PortageResult<_> {
      let outgoing = c
        .bag
        .get(OUTGOING_PIPELINE)
        .ok_or_else(|| PortageError::Internal("outgoing pipeline missing from the receive context".to_string()))?;
      let session = MessageSession::new(outgoing, c.bag.clone());
      let handler_ctx = HandlerContext::new(c.message_id.clone(), c.headers.clone(), session, c.bag.clone());
      Ok((c.handler.clone(), c.message.clone(), handler_ctx))
    })?;

    event!(Level::DEBUG, handler = %handler.name, message_type = %message.message_type, "Invoking handler.");
    handler
      .handler
      .handle(&message, &handler_ctx)
      .await
      .map_err(PortageError::from)?;

    next.run(ctx).await
  }
}
