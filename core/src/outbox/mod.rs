// portage/src/outbox/mod.rs

//! The outbox: per incoming message id, the outgoing operations its handlers
//! produced, committed atomically with the handlers' own state changes.
//!
//! A record exists at most once per message id; the storage's uniqueness
//! constraint is what turns a redelivery into a replay instead of a second run
//! of the handlers.

pub mod behavior;
pub mod in_memory;

pub use behavior::{OutboxBehavior, OUTBOX};
pub use in_memory::{InMemoryOutboxStorage, InMemoryOutboxTransaction};

use crate::core::context_bag::ContextKey;
use crate::error::PortageResult;
use crate::transport::TransportOperation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::Arc;

/// The transaction the current message is being handled in.
pub const OUTBOX_TRANSACTION: ContextKey<Arc<dyn OutboxTransaction>> = ContextKey::new("portage.outbox_transaction");

/// What gets stored: the incoming message id and the operations to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
  pub message_id: String,
  pub transport_operations: Vec<TransportOperation>,
}

impl OutboxMessage {
  pub fn new(message_id: impl Into<String>, transport_operations: Vec<TransportOperation>) -> Self {
    OutboxMessage {
      message_id: message_id.into(),
      transport_operations,
    }
  }
}

/// A stored record. Once dispatched the operations are cleared and
/// `dispatched` never goes back to false.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
  pub message_id: String,
  pub transport_operations: Vec<TransportOperation>,
  pub dispatched: bool,
  pub stored_at: DateTime<Utc>,
  pub dispatched_at: Option<DateTime<Utc>>,
}

/// A state change a handler wants applied atomically with the outbox record.
///
/// Commit is two-phase: every enlisted change is prepared first, and only when
/// all of them prepared and the record is reserved are they applied. A change
/// must not make anything visible in `prepare`, and `apply` cannot fail.
pub trait EnlistedAction: Send {
  fn prepare(&mut self) -> anyhow::Result<()>;

  fn apply(self: Box<Self>);
}

/// Builds an [`EnlistedAction`] from a fallible check and an infallible write.
pub fn enlisted<P, A>(prepare: P, apply: A) -> Box<dyn EnlistedAction>
where
  P: FnOnce() -> anyhow::Result<()> + Send + 'static,
  A: FnOnce() + Send + 'static,
{
  Box::new(FnAction {
    prepare: Some(prepare),
    apply,
  })
}

/// An infallible write with nothing to check first.
pub fn enlisted_write<A>(apply: A) -> Box<dyn EnlistedAction>
where
  A: FnOnce() + Send + 'static,
{
  enlisted(|| Ok(()), apply)
}

struct FnAction<P, A> {
  prepare: Option<P>,
  apply: A,
}

impl<P, A> EnlistedAction for FnAction<P, A>
where
  P: FnOnce() -> anyhow::Result<()> + Send,
  A: FnOnce() + Send,
{
  fn prepare(&mut self) -> anyhow::Result<()> {
    match self.prepare.take() {
      Some(prepare) => prepare(),
      None => Ok(()),
    }
  }

  fn apply(self: Box<Self>) {
    (self.apply)()
  }
}

/// A scoped storage transaction. Dropping it without a successful `commit`
/// discards everything stored or enlisted in it.
#[async_trait]
pub trait OutboxTransaction: Send + Sync + 'static {
  /// Makes the transaction's writes visible. A second commit is rejected with
  /// `TransactionCompleted`.
  async fn commit(&self) -> PortageResult<()>;

  fn enlist(&self, action: Box<dyn EnlistedAction>) -> PortageResult<()>;

  fn is_completed(&self) -> bool;

  /// Lets a storage recover its own concrete transaction type.
  fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait OutboxStorage: Send + Sync + 'static {
  async fn get(&self, message_id: &str) -> PortageResult<Option<OutboxRecord>>;

  async fn begin_transaction(&self) -> PortageResult<Arc<dyn OutboxTransaction>>;

  /// Fails with `DuplicateOutboxRecord` if a record for the message id already
  /// exists; nothing is visible until the transaction commits.
  async fn store(&self, message: OutboxMessage, transaction: &dyn OutboxTransaction) -> PortageResult<()>;

  /// Idempotent.
  async fn set_as_dispatched(&self, message_id: &str) -> PortageResult<()>;

  /// Deletes dispatched records whose dispatch time is before `cutoff`.
  async fn remove_dispatched_older_than(&self, cutoff: DateTime<Utc>) -> PortageResult<usize>;
}
