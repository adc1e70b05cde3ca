// portage/src/transport/in_memory.rs

//! A process-local transport built on tokio channels. Every queue must be
//! created up front; sending to an unknown queue fails with `QueueNotFound`
//! just like a real broker would.

use super::{
  IncomingMessage, OutgoingMessage, ReceivedMessage, Transport, TransportError, TransportOperation,
  TransportTransaction,
};
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{event, Instrument, Level};

struct Queue {
  sender: UnboundedSender<IncomingMessage>,
  receiver: tokio::sync::Mutex<UnboundedReceiver<IncomingMessage>>,
}

impl Queue {
  fn new() -> Self {
    let (sender, receiver) = mpsc::unbounded_channel();
    Queue {
      sender,
      receiver: tokio::sync::Mutex::new(receiver),
    }
  }

  fn push(&self, message: IncomingMessage) -> Result<(), TransportError> {
    self
      .sender
      .send(message)
      .map_err(|_| TransportError::Other {
        source: anyhow!("in-memory queue receiver dropped"),
      })
  }
}

#[derive(Default)]
struct Journal {
  sent: Vec<TransportOperation>,
  deferred: Vec<(TransportOperation, Duration)>,
  acknowledged: Vec<String>,
  released: Vec<String>,
  delivered: DeliveredOperations,
}

/// Operation ids already sent, per destination. Bounded: once full, the
/// oldest id is forgotten.
#[derive(Default)]
struct DeliveredOperations {
  seen: HashSet<(String, String)>,
  order: VecDeque<(String, String)>,
}

impl DeliveredOperations {
  /// Returns false if the key was already recorded.
  fn record(&mut self, key: (String, String), capacity: usize) -> bool {
    if self.seen.contains(&key) {
      return false;
    }
    while self.order.len() >= capacity {
      match self.order.pop_front() {
        Some(oldest) => {
          self.seen.remove(&oldest);
        }
        None => break,
      }
    }
    self.seen.insert(key.clone());
    self.order.push_back(key);
    true
  }
}

pub struct InMemoryTransport {
  queues: Mutex<HashMap<String, Arc<Queue>>>,
  in_flight: Mutex<HashMap<TransportTransaction, (String, IncomingMessage)>>,
  journal: Mutex<Journal>,
  dedupe_capacity: usize,
  shutdown: CancellationToken,
}

impl Default for InMemoryTransport {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryTransport {
  /// How many sent operation ids are remembered for deduplication.
  pub const DEFAULT_DEDUPE_CAPACITY: usize = 10_000;

  pub fn new() -> Self {
    InMemoryTransport {
      queues: Mutex::new(HashMap::new()),
      in_flight: Mutex::new(HashMap::new()),
      journal: Mutex::new(Journal::default()),
      dedupe_capacity: Self::DEFAULT_DEDUPE_CAPACITY,
      shutdown: CancellationToken::new(),
    }
  }

  pub fn with_queues<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let transport = Self::new();
    for name in names {
      transport.create_queue(name);
    }
    transport
  }

  pub fn with_dedupe_capacity(mut self, capacity: usize) -> Self {
    self.dedupe_capacity = capacity.max(1);
    self
  }

  /// Creating an existing queue is a no-op.
  pub fn create_queue(&self, name: impl Into<String>) {
    self
      .queues
      .lock()
      .entry(name.into())
      .or_insert_with(|| Arc::new(Queue::new()));
  }

  pub fn has_queue(&self, name: &str) -> bool {
    self.queues.lock().contains_key(name)
  }

  /// Places a message directly on `queue`, as if another endpoint had sent it.
  pub fn enqueue(&self, queue: &str, message: IncomingMessage) -> Result<(), TransportError> {
    self.queue(queue)?.push(message)
  }

  /// Stops every pending and future `receive` call.
  pub fn close(&self) {
    self.shutdown.cancel();
  }

  pub fn sent(&self) -> Vec<TransportOperation> {
    self.journal.lock().sent.clone()
  }

  pub fn sent_to(&self, destination: &str) -> Vec<OutgoingMessage> {
    self
      .journal
      .lock()
      .sent
      .iter()
      .filter(|op| op.destination == destination)
      .map(|op| op.message.clone())
      .collect()
  }

  pub fn deferred(&self) -> Vec<(TransportOperation, Duration)> {
    self.journal.lock().deferred.clone()
  }

  /// Message ids of every acknowledged delivery, in acknowledgement order.
  pub fn acknowledged(&self) -> Vec<String> {
    self.journal.lock().acknowledged.clone()
  }

  pub fn released(&self) -> Vec<String> {
    self.journal.lock().released.clone()
  }

  pub fn in_flight_count(&self) -> usize {
    self.in_flight.lock().len()
  }

  fn queue(&self, name: &str) -> Result<Arc<Queue>, TransportError> {
    self
      .queues
      .lock()
      .get(name)
      .cloned()
      .ok_or_else(|| TransportError::QueueNotFound { queue: name.to_string() })
  }
}

#[async_trait]
impl Transport for InMemoryTransport {
  async fn receive(&self, queue: &str) -> Result<Option<ReceivedMessage>, TransportError> {
    let source = self.queue(queue)?;
    let mut receiver = tokio::select! {
      _ = self.shutdown.cancelled() => return Ok(None),
      guard = source.receiver.lock() => guard,
    };

    let message = tokio::select! {
      _ = self.shutdown.cancelled() => return Ok(None),
      next = receiver.recv() => next,
    };
    drop(receiver);

    let Some(message) = message else {
      return Ok(None);
    };

    let transaction = TransportTransaction::new(uuid::Uuid::new_v4().to_string());
    self
      .in_flight
      .lock()
      .insert(transaction.clone(), (queue.to_string(), message.clone()));
    event!(Level::TRACE, queue, message_id = %message.message_id, "Delivered message.");
    Ok(Some(ReceivedMessage { message, transaction }))
  }

  async fn send(&self, operation: &TransportOperation) -> Result<(), TransportError> {
    let destination = self.queue(&operation.destination)?;
    {
      let mut journal = self.journal.lock();
      let key = (operation.destination.clone(), operation.operation_id().to_string());
      if !journal.delivered.record(key, self.dedupe_capacity) {
        event!(
          Level::DEBUG,
          destination = %operation.destination,
          operation_id = operation.operation_id(),
          "Duplicate transport operation ignored."
        );
        return Ok(());
      }
      journal.sent.push(operation.clone());
    }
    destination.push(operation.message.clone().into())
  }

  async fn defer(&self, operation: &TransportOperation, delay: Duration) -> Result<(), TransportError> {
    let destination = self.queue(&operation.destination)?;
    self.journal.lock().deferred.push((operation.clone(), delay));

    let message: IncomingMessage = operation.message.clone().into();
    let shutdown = self.shutdown.clone();
    let span = tracing::debug_span!("deferred_delivery", destination = %operation.destination);
    tokio::spawn(
      async move {
        tokio::select! {
          _ = shutdown.cancelled() => {
            event!(Level::DEBUG, "Transport closed before deferred delivery.");
          }
          _ = tokio::time::sleep(delay) => {
            if let Err(error) = destination.push(message) {
              event!(Level::ERROR, %error, "Deferred delivery failed.");
            }
          }
        }
      }
      .instrument(span),
    );
    Ok(())
  }

  async fn acknowledge(&self, transaction: &TransportTransaction) -> Result<(), TransportError> {
    let (_, message) = self
      .in_flight
      .lock()
      .remove(transaction)
      .ok_or_else(|| anyhow!("unknown receipt '{}'", transaction.receipt()))?;
    self.journal.lock().acknowledged.push(message.message_id);
    Ok(())
  }

  async fn release(&self, transaction: &TransportTransaction) -> Result<(), TransportError> {
    let (queue, message) = self
      .in_flight
      .lock()
      .remove(transaction)
      .ok_or_else(|| anyhow!("unknown receipt '{}'", transaction.receipt()))?;
    self.journal.lock().released.push(message.message_id.clone());
    self.queue(&queue)?.push(message)
  }
}
