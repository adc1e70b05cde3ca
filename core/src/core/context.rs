// portage/src/core/context.rs

//! Stage-context plumbing shared by the step registry and the pipeline engine.

use crate::core::context_bag::ContextBag;
use crate::core::context_data::ContextData;
use crate::error::{PortageError, PortageResult};
use std::any::{Any, TypeId};
use std::fmt;

/// A stage context: the value one pipeline stage operates on. Every stage
/// carries the invocation's [`ContextBag`].
pub trait BehaviorContext: Send + Sync + 'static {
  fn extensions(&self) -> &ContextBag;
  fn extensions_mut(&mut self) -> &mut ContextBag;
}

/// Identity of a stage-context type, used to check that steps chain.
#[derive(Clone, Copy)]
pub struct ContextType {
  id: TypeId,
  name: &'static str,
}

impl ContextType {
  pub fn of<T: 'static>() -> Self {
    ContextType {
      id: TypeId::of::<T>(),
      name: std::any::type_name::<T>(),
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }
}

impl PartialEq for ContextType {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}

impl Eq for ContextType {}

impl fmt::Debug for ContextType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name)
  }
}

/// A `ContextData<T>` with `T` erased, as it travels between steps.
pub(crate) type ErasedContext = Box<dyn Any + Send>;

pub(crate) fn downcast_context<T: Send + Sync + 'static>(
  ctx: ErasedContext,
  step_name: &str,
) -> PortageResult<ContextData<T>> {
  ctx
    .downcast::<ContextData<T>>()
    .map(|boxed| *boxed)
    .map_err(|_| PortageError::TypeMismatch {
      step_name: step_name.to_string(),
      expected_type: format!("ContextData<{}>", std::any::type_name::<T>()),
    })
}
