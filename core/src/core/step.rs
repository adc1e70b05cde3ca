// portage/src/core/step.rs

//! Pipeline steps: the `Behavior` and `StageConnector` capability traits, the
//! type-erased form the engine runs, and the `RegisterStep` registration record.

use super::context::{downcast_context, ContextType, ErasedContext};
use super::ContextData;
use crate::error::PortageResult;
use crate::pipeline::execution::{ErasedNext, Next};
use crate::pipeline::hooks::{FnBehavior, FnConnector};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{event, Level};

/// A step that operates within one stage. It may act before and after calling
/// `next`, or return without calling it to short-circuit the rest of the chain.
#[async_trait]
pub trait Behavior<T: Send + Sync + 'static>: Send + Sync + 'static {
  async fn invoke(&self, ctx: ContextData<T>, next: Next<T>) -> PortageResult<()>;
}

/// A step that ends stage `TIn` and starts stage `TOut` by building the next
/// stage context and handing it to `stage`.
#[async_trait]
pub trait StageConnector<TIn, TOut>: Send + Sync + 'static
where
  TIn: Send + Sync + 'static,
  TOut: Send + Sync + 'static,
{
  async fn invoke(&self, ctx: ContextData<TIn>, stage: Next<TOut>) -> PortageResult<()>;
}

pub(crate) type StepFuture<'a> = Pin<Box<dyn Future<Output = PortageResult<()>> + Send + 'a>>;

pub(crate) trait AnyStep: Send + Sync + 'static {
  fn invoke_erased(&self, ctx: ErasedContext, next: ErasedNext) -> StepFuture<'_>;
}

struct BehaviorAdapter<T, B> {
  name: String,
  behavior: B,
  _ctx: PhantomData<fn(T)>,
}

impl<T, B> AnyStep for BehaviorAdapter<T, B>
where
  T: Send + Sync + 'static,
  B: Behavior<T>,
{
  fn invoke_erased(&self, ctx: ErasedContext, next: ErasedNext) -> StepFuture<'_> {
    Box::pin(async move {
      let ctx = downcast_context::<T>(ctx, &self.name)?;
      event!(Level::TRACE, step_name = %self.name, "Invoking step.");
      self
        .behavior
        .invoke(ctx, Next::new(next))
        .await
        .map_err(|err| err.in_step(&self.name))
    })
  }
}

struct ConnectorAdapter<TIn, TOut, C> {
  name: String,
  connector: C,
  _ctx: PhantomData<fn(TIn) -> TOut>,
}

impl<TIn, TOut, C> AnyStep for ConnectorAdapter<TIn, TOut, C>
where
  TIn: Send + Sync + 'static,
  TOut: Send + Sync + 'static,
  C: StageConnector<TIn, TOut>,
{
  fn invoke_erased(&self, ctx: ErasedContext, next: ErasedNext) -> StepFuture<'_> {
    Box::pin(async move {
      let ctx = downcast_context::<TIn>(ctx, &self.name)?;
      event!(Level::TRACE, step_name = %self.name, "Invoking stage connector.");
      self
        .connector
        .invoke(ctx, Next::new(next))
        .await
        .map_err(|err| err.in_step(&self.name))
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dependency {
  pub(crate) step_name: String,
  pub(crate) required: bool,
}

/// A named step plus its placement constraints. Immutable once handed to a
/// [`StepRegistry`](crate::pipeline::StepRegistry).
#[derive(Clone)]
pub struct RegisterStep {
  pub(crate) name: String,
  pub(crate) description: String,
  pub(crate) input: ContextType,
  pub(crate) output: ContextType,
  pub(crate) step: Arc<dyn AnyStep>,
  pub(crate) befores: Vec<Dependency>,
  pub(crate) afters: Vec<Dependency>,
}

impl RegisterStep {
  pub fn behavior<T, B>(name: impl Into<String>, behavior: B) -> Self
  where
    T: Send + Sync + 'static,
    B: Behavior<T>,
  {
    let name = name.into();
    let step = BehaviorAdapter {
      name: name.clone(),
      behavior,
      _ctx: PhantomData,
    };
    Self::erased(name, ContextType::of::<T>(), ContextType::of::<T>(), Arc::new(step))
  }

  pub fn connector<TIn, TOut, C>(name: impl Into<String>, connector: C) -> Self
  where
    TIn: Send + Sync + 'static,
    TOut: Send + Sync + 'static,
    C: StageConnector<TIn, TOut>,
  {
    let name = name.into();
    let step = ConnectorAdapter {
      name: name.clone(),
      connector,
      _ctx: PhantomData,
    };
    Self::erased(name, ContextType::of::<TIn>(), ContextType::of::<TOut>(), Arc::new(step))
  }

  /// Registers an async closure as a behavior.
  ///
  /// ```ignore
  /// RegisterStep::from_fn("audit", |ctx: ContextData<InvokeHandlerContext>, next| async move {
  ///   next.run(ctx).await
  /// });
  /// ```
  pub fn from_fn<T, F, Fut>(name: impl Into<String>, f: F) -> Self
  where
    T: Send + Sync + 'static,
    F: Fn(ContextData<T>, Next<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PortageResult<()>> + Send + 'static,
  {
    Self::behavior(name, FnBehavior::new(f))
  }

  pub fn connector_fn<TIn, TOut, F, Fut>(name: impl Into<String>, f: F) -> Self
  where
    TIn: Send + Sync + 'static,
    TOut: Send + Sync + 'static,
    F: Fn(ContextData<TIn>, Next<TOut>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PortageResult<()>> + Send + 'static,
  {
    Self::connector(name, FnConnector::new(f))
  }

  fn erased(name: String, input: ContextType, output: ContextType, step: Arc<dyn AnyStep>) -> Self {
    RegisterStep {
      name,
      description: String::new(),
      input,
      output,
      step,
      befores: Vec::new(),
      afters: Vec::new(),
    }
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  /// This step runs before `step_name`; building fails if it is not registered.
  pub fn insert_before(mut self, step_name: impl Into<String>) -> Self {
    self.befores.push(Dependency {
      step_name: step_name.into(),
      required: true,
    });
    self
  }

  pub fn insert_before_if_exists(mut self, step_name: impl Into<String>) -> Self {
    self.befores.push(Dependency {
      step_name: step_name.into(),
      required: false,
    });
    self
  }

  /// This step runs after `step_name`; building fails if it is not registered.
  pub fn insert_after(mut self, step_name: impl Into<String>) -> Self {
    self.afters.push(Dependency {
      step_name: step_name.into(),
      required: true,
    });
    self
  }

  pub fn insert_after_if_exists(mut self, step_name: impl Into<String>) -> Self {
    self.afters.push(Dependency {
      step_name: step_name.into(),
      required: false,
    });
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn input(&self) -> ContextType {
    self.input
  }

  pub fn output(&self) -> ContextType {
    self.output
  }

  /// Connectors move the invocation from one stage to the next.
  pub fn is_connector(&self) -> bool {
    self.input != self.output
  }
}

impl fmt::Debug for RegisterStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RegisterStep")
      .field("name", &self.name)
      .field("input", &self.input)
      .field("output", &self.output)
      .field("befores", &self.befores)
      .field("afters", &self.afters)
      .finish()
  }
}
