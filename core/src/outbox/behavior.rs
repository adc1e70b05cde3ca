// portage/src/outbox/behavior.rs
use super::{OutboxMessage, OutboxStorage, OUTBOX_TRANSACTION};
use crate::core::context_data::ContextData;
use crate::core::step::Behavior;
use crate::error::PortageResult;
use crate::pipeline::contexts::{IncomingPhysicalContext, PendingOperations, PENDING_OPERATIONS};
use crate::pipeline::execution::Next;
use crate::routing::MessageDispatcher;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{event, instrument, Level};

pub const OUTBOX: &str = "outbox";

/// Replaces batched dispatch when the outbox is enabled.
///
/// - record found and dispatched: the handlers already ran and their messages
///   went out; only the stored operations (normally none) are dispatched again.
/// - record found, not dispatched: the handlers already ran; dispatch what they
///   produced and mark the record dispatched.
/// - no record: run the handlers inside a new transaction, store what they
///   produced, commit, then dispatch and mark dispatched.
pub struct OutboxBehavior {
  storage: Arc<dyn OutboxStorage>,
  dispatcher: Arc<MessageDispatcher>,
}

impl OutboxBehavior {
  pub fn new(storage: Arc<dyn OutboxStorage>, dispatcher: Arc<MessageDispatcher>) -> Self {
    OutboxBehavior { storage, dispatcher }
  }
}

#[async_trait]
impl Behavior<IncomingPhysicalContext> for OutboxBehavior {
  #[instrument(name = "OutboxBehavior::invoke", skip_all, fields(message_id))]
  async fn invoke(&self, ctx: ContextData<IncomingPhysicalContext>, next: Next<IncomingPhysicalContext>) -> PortageResult<()> {
    let message_id = ctx.inspect(|c| c.message.message_id.clone());
    tracing::Span::current().record("message_id", message_id.as_str());

    if let Some(record) = self.storage.get(&message_id).await? {
      if record.dispatched {
        event!(Level::DEBUG, "Message already processed and dispatched; skipping handlers.");
        self.dispatcher.dispatch(&record.transport_operations).await?;
        return Ok(());
      }
      event!(
        Level::DEBUG,
        count = record.transport_operations.len(),
        "Message already processed; dispatching stored operations."
      );
      self.dispatcher.dispatch(&record.transport_operations).await?;
      self.storage.set_as_dispatched(&message_id).await?;
      return Ok(());
    }

    // Dropping `transaction` on any early return rolls it back.
    let transaction = self.storage.begin_transaction().await?;
    let pending = Arc::new(PendingOperations::default());
    ctx.set_extension(PENDING_OPERATIONS, Arc::clone(&pending));
    ctx.set_extension(OUTBOX_TRANSACTION, Arc::clone(&transaction));

    next.run(ctx.clone()).await?;

    let operations = pending.drain();
    self
      .storage
      .store(OutboxMessage::new(message_id.clone(), operations.clone()), transaction.as_ref())
      .await?;
    if let Err(err) = transaction.commit().await {
      if err.is_outbox_contention() {
        event!(Level::WARN, "Another delivery of this message committed first.");
      }
      return Err(err);
    }
    ctx.remove_extension(OUTBOX_TRANSACTION);

    self.dispatcher.dispatch(&operations).await?;
    self.storage.set_as_dispatched(&message_id).await?;
    event!(Level::DEBUG, count = operations.len(), "Outbox record stored and dispatched.");
    Ok(())
  }
}
