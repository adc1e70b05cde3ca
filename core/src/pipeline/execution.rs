// portage/src/pipeline/execution.rs

//! The onion executor: `Pipeline::execute` and the `Next` continuation each
//! step receives.

use crate::core::context::ErasedContext;
use crate::core::context_data::ContextData;
use crate::core::step::{AnyStep, StepFuture};
use crate::error::PortageResult;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// Position in a built chain. Invoking it runs the step at `index`, handing
/// that step a continuation positioned at `index + 1`.
#[derive(Clone)]
pub(crate) struct ErasedNext {
  chain: Arc<[Arc<dyn AnyStep>]>,
  index: usize,
}

impl ErasedNext {
  pub(crate) fn invoke(self, ctx: ErasedContext) -> StepFuture<'static> {
    match self.chain.get(self.index).cloned() {
      // Past the last step: the stage is complete.
      None => Box::pin(async { Ok(()) }),
      Some(step) => {
        let next = ErasedNext {
          chain: Arc::clone(&self.chain),
          index: self.index + 1,
        };
        Box::pin(async move { step.invoke_erased(ctx, next).await })
      }
    }
  }
}

/// The remainder of the chain after the current step. Calling [`Next::run`]
/// proceeds; dropping it without calling short-circuits everything after.
pub struct Next<T: Send + Sync + 'static> {
  inner: ErasedNext,
  _ctx: PhantomData<fn(T)>,
}

impl<T: Send + Sync + 'static> Next<T> {
  pub(crate) fn new(inner: ErasedNext) -> Self {
    Next {
      inner,
      _ctx: PhantomData,
    }
  }

  /// Runs the rest of the chain. May be called more than once; each call
  /// re-runs every downstream step.
  pub async fn run(&self, ctx: ContextData<T>) -> PortageResult<()> {
    self.inner.clone().invoke(Box::new(ctx)).await
  }
}

impl<T: Send + Sync + 'static> Clone for Next<T> {
  fn clone(&self) -> Self {
    Next::new(self.inner.clone())
  }
}

impl<T: Send + Sync + 'static> fmt::Debug for Next<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Next")
      .field("index", &self.inner.index)
      .field("chain_len", &self.inner.chain.len())
      .finish()
  }
}

/// A resolved, immutable chain of steps rooted at context type `T`. Built once
/// by [`StepRegistry::build`](super::StepRegistry::build) and shared by every
/// invocation.
pub struct Pipeline<T: Send + Sync + 'static> {
  chain: Arc<[Arc<dyn AnyStep>]>,
  names: Arc<[String]>,
  _ctx: PhantomData<fn(T)>,
}

impl<T: Send + Sync + 'static> Pipeline<T> {
  pub(crate) fn from_steps(steps: Vec<(String, Arc<dyn AnyStep>)>) -> Self {
    let (names, chain): (Vec<_>, Vec<_>) = steps.into_iter().unzip();
    Pipeline {
      chain: chain.into(),
      names: names.into(),
      _ctx: PhantomData,
    }
  }

  /// Step names in execution order.
  pub fn step_names(&self) -> &[String] {
    &self.names
  }

  pub fn len(&self) -> usize {
    self.chain.len()
  }

  pub fn is_empty(&self) -> bool {
    self.chain.is_empty()
  }

  /// Runs the chain against `ctx`. The first fault aborts the remaining steps
  /// and is returned annotated with the step that raised it; nothing is retried.
  #[instrument(
    name = "Pipeline::execute",
    skip_all,
    fields(context_type = %std::any::type_name::<T>(), num_steps = self.chain.len()),
    err(Display)
  )]
  pub async fn execute(&self, ctx: ContextData<T>) -> PortageResult<()> {
    event!(Level::DEBUG, "Pipeline execution starting.");
    let start = ErasedNext {
      chain: Arc::clone(&self.chain),
      index: 0,
    };
    start.invoke(Box::new(ctx)).await?;
    event!(Level::DEBUG, "Pipeline execution completed successfully.");
    Ok(())
  }
}

impl<T: Send + Sync + 'static> Clone for Pipeline<T> {
  fn clone(&self) -> Self {
    Pipeline {
      chain: Arc::clone(&self.chain),
      names: Arc::clone(&self.names),
      _ctx: PhantomData,
    }
  }
}

impl<T: Send + Sync + 'static> fmt::Debug for Pipeline<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pipeline")
      .field("context_type", &std::any::type_name::<T>())
      .field("steps", &self.names)
      .finish()
  }
}
