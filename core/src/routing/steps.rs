// portage/src/routing/steps.rs

//! Built-in outgoing-pipeline steps, in execution order:
//! `populate_headers`, `routing`, `dispatch`.

use super::{MessageDispatcher, UnicastRouter};
use crate::core::context_data::ContextData;
use crate::core::step::{Behavior, StageConnector};
use crate::error::PortageResult;
use crate::headers::{self, MessageIntent};
use crate::pipeline::contexts::{OutgoingLogicalContext, RoutingContext, INCOMING_MESSAGE, PENDING_OPERATIONS};
use crate::pipeline::execution::Next;
use crate::transport::{OutgoingMessage, TransportOperation};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{event, Level};

pub const POPULATE_HEADERS: &str = "populate_headers";
pub const ROUTING: &str = "routing";
pub const DISPATCH: &str = "dispatch";

/// Stamps the standard headers. Correlation, conversation and reply-to values
/// already present (set through `SendOptions::header`) are kept.
pub struct PopulateHeadersBehavior {
  endpoint_name: String,
  router: Arc<UnicastRouter>,
}

impl PopulateHeadersBehavior {
  pub fn new(endpoint_name: impl Into<String>, router: Arc<UnicastRouter>) -> Self {
    PopulateHeadersBehavior {
      endpoint_name: endpoint_name.into(),
      router,
    }
  }
}

#[async_trait]
impl Behavior<OutgoingLogicalContext> for PopulateHeadersBehavior {
  async fn invoke(&self, ctx: ContextData<OutgoingLogicalContext>, next: Next<OutgoingLogicalContext>) -> PortageResult<()> {
    ctx.update(|c| -> PortageResult<()> {
      let incoming = c.bag.get(INCOMING_MESSAGE);
      let reply_to = self.router.reply_to_address(&c.options)?.to_string();
      let own_id = c.message_id.clone();

      let h = &mut c.headers;
      h.insert(headers::MESSAGE_ID.to_string(), own_id.clone());
      h.insert(headers::ENCLOSED_MESSAGE_TYPES.to_string(), c.message.message_type.clone());
      h.insert(headers::MESSAGE_INTENT.to_string(), c.intent.to_string());
      h.insert(headers::TIME_SENT.to_string(), headers::format_timestamp(Utc::now()));
      h.insert(headers::ORIGINATING_ENDPOINT.to_string(), self.endpoint_name.clone());
      h.entry(headers::REPLY_TO_ADDRESS.to_string()).or_insert(reply_to);

      let correlation_id = match (&incoming, c.intent) {
        (Some(info), MessageIntent::Reply) => info.correlation_id.clone().unwrap_or_else(|| info.message_id.clone()),
        (Some(info), _) => info.correlation_id.clone().unwrap_or_else(|| own_id.clone()),
        (None, _) => own_id.clone(),
      };
      h.entry(headers::CORRELATION_ID.to_string()).or_insert(correlation_id);

      let conversation_id = incoming
        .as_ref()
        .and_then(|info| info.conversation_id.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
      h.entry(headers::CONVERSATION_ID.to_string()).or_insert(conversation_id);

      if let Some(info) = &incoming {
        h.insert(headers::RELATED_TO.to_string(), info.message_id.clone());
      }
      Ok(())
    })?;
    next.run(ctx).await
  }
}

pub struct RoutingConnector {
  router: Arc<UnicastRouter>,
}

impl RoutingConnector {
  pub fn new(router: Arc<UnicastRouter>) -> Self {
    RoutingConnector { router }
  }
}

#[async_trait]
impl StageConnector<OutgoingLogicalContext, RoutingContext> for RoutingConnector {
  async fn invoke(&self, ctx: ContextData<OutgoingLogicalContext>, stage: Next<RoutingContext>) -> PortageResult<()> {
    let routing = ctx.inspect(|c| -> PortageResult<RoutingContext> {
      let incoming = c.bag.get(INCOMING_MESSAGE);
      let destinations = self
        .router
        .route(c.intent, &c.message.message_type, &c.options, incoming.as_ref())?;
      Ok(RoutingContext {
        message: OutgoingMessage::new(c.message_id.clone(), c.headers.clone(), c.message.body.clone()),
        destinations,
        bag: c.bag.child(),
      })
    })?;
    stage.run(ContextData::new(routing)).await
  }
}

/// Hands the routed message off. Inside a receive the operations join the
/// pending batch (or the outbox); anywhere else they go straight to the
/// transport. Steps placed after it run once the hand-off succeeded.
pub struct DispatchBehavior {
  dispatcher: Arc<MessageDispatcher>,
}

impl DispatchBehavior {
  pub fn new(dispatcher: Arc<MessageDispatcher>) -> Self {
    DispatchBehavior { dispatcher }
  }
}

#[async_trait]
impl Behavior<RoutingContext> for DispatchBehavior {
  async fn invoke(&self, ctx: ContextData<RoutingContext>, next: Next<RoutingContext>) -> PortageResult<()> {
    let operations: Vec<TransportOperation> = ctx.inspect(|c| {
      c.destinations
        .iter()
        .map(|destination| TransportOperation::new(c.message.clone(), destination.clone()))
        .collect()
    });

    match ctx.extension(PENDING_OPERATIONS) {
      Some(pending) => {
        event!(Level::TRACE, count = operations.len(), "Deferring operations until the receive completes.");
        for operation in operations {
          pending.push(operation);
        }
      }
      None => self.dispatcher.dispatch(&operations).await?,
    }
    next.run(ctx).await
  }
}
