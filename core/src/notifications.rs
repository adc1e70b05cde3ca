// portage/src/notifications.rs

//! In-process notifications about what the endpoint does with messages.
//! Subscribers run synchronously on the worker that raised the event and
//! should return quickly.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorNotification {
  ImmediateRetry {
    message_id: String,
    attempt: u32,
    error: String,
  },
  DelayedRetry {
    message_id: String,
    attempt: u32,
    delay: Duration,
    error: String,
  },
  MovedToErrorQueue {
    message_id: String,
    error_queue: String,
    error: String,
  },
  Discarded {
    message_id: String,
    reason: String,
  },
}

impl ErrorNotification {
  pub fn message_id(&self) -> &str {
    match self {
      ErrorNotification::ImmediateRetry { message_id, .. }
      | ErrorNotification::DelayedRetry { message_id, .. }
      | ErrorNotification::MovedToErrorQueue { message_id, .. }
      | ErrorNotification::Discarded { message_id, .. } => message_id,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivePipelineCompleted {
  pub message_id: String,
  pub started_at: DateTime<Utc>,
  pub completed_at: DateTime<Utc>,
}

/// Raised when the endpoint could not carry out its own failure handling, for
/// example because the error queue does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalError {
  pub message: String,
  pub error: String,
}

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SubscriberList<T> {
  subscribers: RwLock<Vec<Subscriber<T>>>,
}

impl<T> Default for SubscriberList<T> {
  fn default() -> Self {
    SubscriberList {
      subscribers: RwLock::new(Vec::new()),
    }
  }
}

impl<T> SubscriberList<T> {
  fn subscribe(&self, subscriber: Subscriber<T>) {
    self.subscribers.write().push(subscriber);
  }

  fn raise(&self, notification: &T) {
    // Cloned out so a subscriber may subscribe further without deadlocking.
    let subscribers: Vec<_> = self.subscribers.read().clone();
    for subscriber in subscribers {
      subscriber(notification);
    }
  }

  fn len(&self) -> usize {
    self.subscribers.read().len()
  }
}

#[derive(Default)]
pub struct Notifications {
  errors: SubscriberList<ErrorNotification>,
  receive_completed: SubscriberList<ReceivePipelineCompleted>,
  critical: SubscriberList<CriticalError>,
}

impl Notifications {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_error<F>(&self, f: F)
  where
    F: Fn(&ErrorNotification) + Send + Sync + 'static,
  {
    self.errors.subscribe(Arc::new(f));
  }

  pub fn on_receive_completed<F>(&self, f: F)
  where
    F: Fn(&ReceivePipelineCompleted) + Send + Sync + 'static,
  {
    self.receive_completed.subscribe(Arc::new(f));
  }

  pub fn on_critical_error<F>(&self, f: F)
  where
    F: Fn(&CriticalError) + Send + Sync + 'static,
  {
    self.critical.subscribe(Arc::new(f));
  }

  pub fn raise_error(&self, notification: &ErrorNotification) {
    self.errors.raise(notification);
  }

  pub fn raise_receive_completed(&self, notification: &ReceivePipelineCompleted) {
    self.receive_completed.raise(notification);
  }

  pub fn raise_critical(&self, notification: &CriticalError) {
    event!(Level::ERROR, message = %notification.message, error = %notification.error, "Critical error.");
    self.critical.raise(notification);
  }
}

impl fmt::Debug for Notifications {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Notifications")
      .field("error_subscribers", &self.errors.len())
      .field("receive_completed_subscribers", &self.receive_completed.len())
      .field("critical_subscribers", &self.critical.len())
      .finish()
  }
}
