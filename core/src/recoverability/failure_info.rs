// portage/src/recoverability/failure_info.rs
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Per message id count of processing failures in this process. Bounded: once
/// full, the entry recorded longest ago is evicted.
#[derive(Debug)]
pub struct FailureInfoStorage {
  capacity: usize,
  inner: Mutex<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
  counts: HashMap<String, u32>,
  order: VecDeque<String>,
}

impl FailureInfoStorage {
  pub const DEFAULT_CAPACITY: usize = 1_000;

  pub fn new(capacity: usize) -> Self {
    FailureInfoStorage {
      capacity: capacity.max(1),
      inner: Mutex::new(Entries::default()),
    }
  }

  /// Records one more failure and returns the new count.
  pub fn record_failure(&self, message_id: &str) -> u32 {
    let mut entries = self.inner.lock();
    if let Some(count) = entries.counts.get_mut(message_id) {
      *count += 1;
      return *count;
    }

    while entries.counts.len() >= self.capacity {
      match entries.order.pop_front() {
        Some(oldest) => {
          entries.counts.remove(&oldest);
        }
        None => break,
      }
    }
    entries.counts.insert(message_id.to_string(), 1);
    entries.order.push_back(message_id.to_string());
    1
  }

  pub fn failures(&self, message_id: &str) -> u32 {
    self.inner.lock().counts.get(message_id).copied().unwrap_or(0)
  }

  pub fn clear(&self, message_id: &str) {
    let mut entries = self.inner.lock();
    if entries.counts.remove(message_id).is_some() {
      entries.order.retain(|id| id != message_id);
    }
  }

  pub fn len(&self) -> usize {
    self.inner.lock().counts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for FailureInfoStorage {
  fn default() -> Self {
    Self::new(Self::DEFAULT_CAPACITY)
  }
}
