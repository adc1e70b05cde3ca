// portage/src/outbox/in_memory.rs
use super::{EnlistedAction, OutboxMessage, OutboxRecord, OutboxStorage, OutboxTransaction};
use crate::error::{PortageError, PortageResult};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

type Records = Arc<Mutex<HashMap<String, OutboxRecord>>>;

/// Outbox storage held in process memory. The record map's key is the
/// uniqueness constraint.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStorage {
  records: Records,
}

impl InMemoryOutboxStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.records.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.lock().is_empty()
  }
}

#[derive(Default)]
struct PendingWrites {
  messages: Vec<OutboxMessage>,
  actions: Vec<Box<dyn EnlistedAction>>,
  completed: bool,
}

pub struct InMemoryOutboxTransaction {
  records: Records,
  pending: Mutex<PendingWrites>,
}

impl InMemoryOutboxTransaction {
  fn stage(&self, message: OutboxMessage) -> PortageResult<()> {
    let mut pending = self.pending.lock();
    if pending.completed {
      return Err(PortageError::TransactionCompleted);
    }
    let already_staged = pending.messages.iter().any(|m| m.message_id == message.message_id);
    if already_staged || self.records.lock().contains_key(&message.message_id) {
      return Err(PortageError::DuplicateOutboxRecord {
        message_id: message.message_id,
      });
    }
    pending.messages.push(message);
    Ok(())
  }
}

#[async_trait]
impl OutboxTransaction for InMemoryOutboxTransaction {
  async fn commit(&self) -> PortageResult<()> {
    let (messages, mut actions) = {
      let mut pending = self.pending.lock();
      if pending.completed {
        return Err(PortageError::TransactionCompleted);
      }
      pending.completed = true;
      (std::mem::take(&mut pending.messages), std::mem::take(&mut pending.actions))
    };

    // Prepare outside the records lock so an action may read this storage.
    for action in actions.iter_mut() {
      action.prepare().map_err(|source| PortageError::Storage { source })?;
    }

    {
      let mut records = self.records.lock();
      // Another transaction may have committed the same id since `store`.
      if let Some(taken) = messages.iter().find(|m| records.contains_key(&m.message_id)) {
        return Err(PortageError::DuplicateOutboxRecord {
          message_id: taken.message_id.clone(),
        });
      }

      let stored_at = Utc::now();
      for message in messages {
        records.insert(
          message.message_id.clone(),
          OutboxRecord {
            message_id: message.message_id,
            transport_operations: message.transport_operations,
            dispatched: false,
            stored_at,
            dispatched_at: None,
          },
        );
      }
    }

    for action in actions {
      action.apply();
    }
    Ok(())
  }

  fn enlist(&self, action: Box<dyn EnlistedAction>) -> PortageResult<()> {
    let mut pending = self.pending.lock();
    if pending.completed {
      return Err(PortageError::TransactionCompleted);
    }
    pending.actions.push(action);
    Ok(())
  }

  fn is_completed(&self) -> bool {
    self.pending.lock().completed
  }

  fn as_any(&self) -> &dyn Any {
    self
  }
}

impl Drop for InMemoryOutboxTransaction {
  fn drop(&mut self) {
    let pending = self.pending.get_mut();
    if !pending.completed && (!pending.messages.is_empty() || !pending.actions.is_empty()) {
      event!(
        Level::DEBUG,
        staged = pending.messages.len(),
        enlisted = pending.actions.len(),
        "Outbox transaction dropped without commit; rolling back."
      );
    }
  }
}

#[async_trait]
impl OutboxStorage for InMemoryOutboxStorage {
  async fn get(&self, message_id: &str) -> PortageResult<Option<OutboxRecord>> {
    Ok(self.records.lock().get(message_id).cloned())
  }

  async fn begin_transaction(&self) -> PortageResult<Arc<dyn OutboxTransaction>> {
    Ok(Arc::new(InMemoryOutboxTransaction {
      records: Arc::clone(&self.records),
      pending: Mutex::new(PendingWrites::default()),
    }))
  }

  async fn store(&self, message: OutboxMessage, transaction: &dyn OutboxTransaction) -> PortageResult<()> {
    let transaction = transaction
      .as_any()
      .downcast_ref::<InMemoryOutboxTransaction>()
      .ok_or_else(|| PortageError::Storage {
        source: anyhow!("transaction was not started by the in-memory outbox storage"),
      })?;
    if !Arc::ptr_eq(&transaction.records, &self.records) {
      return Err(PortageError::Storage {
        source: anyhow!("transaction belongs to a different outbox storage"),
      });
    }
    transaction.stage(message)
  }

  async fn set_as_dispatched(&self, message_id: &str) -> PortageResult<()> {
    let mut records = self.records.lock();
    match records.get_mut(message_id) {
      Some(record) if !record.dispatched => {
        record.dispatched = true;
        record.dispatched_at = Some(Utc::now());
        record.transport_operations.clear();
      }
      Some(_) => {}
      None => {
        event!(Level::DEBUG, message_id, "No outbox record to mark as dispatched.");
      }
    }
    Ok(())
  }

  async fn remove_dispatched_older_than(&self, cutoff: DateTime<Utc>) -> PortageResult<usize> {
    let mut records = self.records.lock();
    let before = records.len();
    records.retain(|_, record| !(record.dispatched && record.dispatched_at.is_some_and(|at| at < cutoff)));
    Ok(before - records.len())
  }
}
