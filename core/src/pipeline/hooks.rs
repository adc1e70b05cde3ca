// portage/src/pipeline/hooks.rs

//! Closure adapters so simple steps can be registered without a named type.

use crate::core::context_data::ContextData;
use crate::core::step::{Behavior, StageConnector};
use crate::error::PortageResult;
use crate::pipeline::execution::Next;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

pub struct FnBehavior<T, F> {
  f: F,
  _ctx: PhantomData<fn(T)>,
}

impl<T, F> FnBehavior<T, F> {
  pub fn new(f: F) -> Self {
    FnBehavior { f, _ctx: PhantomData }
  }
}

#[async_trait]
impl<T, F, Fut> Behavior<T> for FnBehavior<T, F>
where
  T: Send + Sync + 'static,
  F: Fn(ContextData<T>, Next<T>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = PortageResult<()>> + Send + 'static,
{
  async fn invoke(&self, ctx: ContextData<T>, next: Next<T>) -> PortageResult<()> {
    (self.f)(ctx, next).await
  }
}

pub struct FnConnector<TIn, TOut, F> {
  f: F,
  _ctx: PhantomData<fn(TIn) -> TOut>,
}

impl<TIn, TOut, F> FnConnector<TIn, TOut, F> {
  pub fn new(f: F) -> Self {
    FnConnector { f, _ctx: PhantomData }
  }
}

#[async_trait]
impl<TIn, TOut, F, Fut> StageConnector<TIn, TOut> for FnConnector<TIn, TOut, F>
where
  TIn: Send + Sync + 'static,
  TOut: Send + Sync + 'static,
  F: Fn(ContextData<TIn>, Next<TOut>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = PortageResult<()>> + Send + 'static,
{
  async fn invoke(&self, ctx: ContextData<TIn>, stage: Next<TOut>) -> PortageResult<()> {
    (self.f)(ctx, stage).await
  }
}
