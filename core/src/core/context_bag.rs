// portage/src/core/context_bag.rs

//! A typed, per-invocation key/value store with read-through parent chaining.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A key whose value type is fixed at compile time. Two keys with the same
/// name address the same slot, so names must be unique per value type.
pub struct ContextKey<T> {
  name: &'static str,
  _value: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
  pub const fn new(name: &'static str) -> Self {
    ContextKey {
      name,
      _value: PhantomData,
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }
}

impl<T> Clone for ContextKey<T> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<T> Copy for ContextKey<T> {}

impl<T> fmt::Debug for ContextKey<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ContextKey<{}>({})", std::any::type_name::<T>(), self.name)
  }
}

type Entries = HashMap<&'static str, Arc<dyn Any + Send + Sync>>;

/// Values are stored behind `Arc`, so `get` hands out cheap clones. The local
/// map is copy-on-write: [`ContextBag::child`] shares it with the child, and a
/// later write to the parent copies it first, so the child's snapshot never
/// observes that write.
#[derive(Clone, Default)]
pub struct ContextBag {
  entries: Arc<Entries>,
  parent: Option<Arc<ContextBag>>,
}

impl ContextBag {
  pub fn new() -> Self {
    Self::default()
  }

  /// A new bag that reads through to a frozen view of `self`. Nothing is
  /// copied: the child holds the same maps as `self`. Writes to the child stay
  /// in the child.
  pub fn child(&self) -> ContextBag {
    ContextBag {
      entries: Arc::default(),
      parent: Some(Arc::new(self.clone())),
    }
  }

  pub fn set<T: Send + Sync + 'static>(&mut self, key: ContextKey<T>, value: T) {
    Arc::make_mut(&mut self.entries).insert(key.name, Arc::new(value));
  }

  /// Looks the key up locally, then in each ancestor. A value stored under the
  /// key's name with a different type counts as absent.
  pub fn get<T: Clone + Send + Sync + 'static>(&self, key: ContextKey<T>) -> Option<T> {
    match self.entries.get(key.name) {
      Some(value) => value.downcast_ref::<T>().cloned(),
      None => self.parent.as_ref().and_then(|parent| parent.get(key)),
    }
  }

  pub fn contains<T: Send + Sync + 'static>(&self, key: ContextKey<T>) -> bool {
    match self.entries.get(key.name) {
      Some(value) => value.is::<T>(),
      None => self.parent.as_ref().is_some_and(|parent| parent.contains(key)),
    }
  }

  /// Removes a local entry. Ancestors are never touched, so a value inherited
  /// from a parent stays visible.
  pub fn remove<T: Send + Sync + 'static>(&mut self, key: ContextKey<T>) -> bool {
    if !self.entries.contains_key(key.name) {
      return false;
    }
    Arc::make_mut(&mut self.entries).remove(key.name).is_some()
  }

  pub fn has_parent(&self) -> bool {
    self.parent.is_some()
  }
}

impl fmt::Debug for ContextBag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut keys: Vec<_> = self.entries.keys().collect();
    keys.sort();
    f.debug_struct("ContextBag")
      .field("keys", &keys)
      .field("parent", &self.parent)
      .finish()
  }
}
