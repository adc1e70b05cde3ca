// portage/src/core/context_data.rs
use crate::core::context::BehaviorContext;
use crate::core::context_bag::{ContextBag, ContextKey};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Shared, interior-mutable handle on a stage context. Every step in one
/// invocation sees the same underlying value; cloning clones the handle.
///
/// IMPORTANT: Lock guards obtained from this struct are blocking and MUST NOT
/// be held across `.await` suspension points.
#[derive(Debug)]
pub struct ContextData<T: Send + Sync + 'static>(Arc<RwLock<T>>);

impl<T: Send + Sync + 'static> ContextData<T> {
  pub fn new(data: T) -> Self {
    ContextData(Arc::new(RwLock::new(data)))
  }

  pub fn read(&self) -> RwLockReadGuard<'_, T> {
    self.0.read()
  }

  pub fn write(&self) -> RwLockWriteGuard<'_, T> {
    self.0.write()
  }

  /// Runs `f` under a read lock and returns its result; the guard never
  /// escapes, so this is safe to call from async code.
  pub fn inspect<R>(&self, f: impl FnOnce(&T) -> R) -> R {
    f(&self.0.read())
  }

  pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
    f(&mut self.0.write())
  }
}

/// Bag access for any stage context, so a step can be written once and
/// registered on several stages.
impl<T: BehaviorContext> ContextData<T> {
  pub fn extension<V: Clone + Send + Sync + 'static>(&self, key: ContextKey<V>) -> Option<V> {
    self.inspect(|c| c.extensions().get(key))
  }

  pub fn set_extension<V: Send + Sync + 'static>(&self, key: ContextKey<V>, value: V) {
    self.update(|c| c.extensions_mut().set(key, value));
  }

  pub fn remove_extension<V: Send + Sync + 'static>(&self, key: ContextKey<V>) -> bool {
    self.update(|c| c.extensions_mut().remove(key))
  }

  /// A bag for the next stage down: reads through to this one's.
  pub fn child_extensions(&self) -> ContextBag {
    self.inspect(|c| c.extensions().child())
  }
}

impl<T: Send + Sync + 'static> Clone for ContextData<T> {
  fn clone(&self) -> Self {
    ContextData(Arc::clone(&self.0))
  }
}

impl<T: Send + Sync + 'static + Default> Default for ContextData<T> {
  fn default() -> Self {
    Self::new(Default::default())
  }
}
