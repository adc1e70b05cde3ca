// tests/common/mod.rs
#![allow(dead_code)] // Allow unused code in this common test module

use parking_lot::Mutex;
use portage::headers;
use portage::{
  ContextData, EndpointSettings, ErrorNotification, InMemoryTransport, IncomingMessage, Next, Notifications,
  PortageError, ReceivedMessage, RegisterStep, Transport,
};
use std::collections::BTreeMap;
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration;

// --- Common Context Structs ---
#[derive(Clone, Debug, Default)]
pub struct TestContext {
  pub counter: i32,
  pub steps_executed: Vec<String>,
}

/// Second stage for connector tests.
#[derive(Clone, Debug, Default)]
pub struct NextStageContext {
  pub steps_executed: Vec<String>,
  pub carried: i32,
}

// --- Common Error Type for Tests ---
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TestError {
  #[error("Test handler failed: {0}")]
  Handler(String),

  #[error("Payment declined: {0}")]
  PaymentDeclined(String),
}

// --- Common Step Creators ---

/// Records `name` on the way in and `name:after` on the way out.
pub fn recording_step(name: &'static str) -> RegisterStep {
  RegisterStep::from_fn(name, move |ctx: ContextData<TestContext>, next: Next<TestContext>| async move {
    {
      let mut guard = ctx.write();
      guard.counter += 1;
      guard.steps_executed.push(name.to_string());
    }
    next.run(ctx.clone()).await?;
    ctx.write().steps_executed.push(format!("{name}:after"));
    Ok::<_, PortageError>(())
  })
}

/// Records `name` and never calls the continuation.
pub fn short_circuit_step(name: &'static str) -> RegisterStep {
  RegisterStep::from_fn(name, move |ctx: ContextData<TestContext>, _next: Next<TestContext>| async move {
    ctx.write().steps_executed.push(name.to_string());
    Ok::<_, PortageError>(())
  })
}

pub fn failing_step(name: &'static str, error_message: &'static str) -> RegisterStep {
  RegisterStep::from_fn(name, move |ctx: ContextData<TestContext>, _next: Next<TestContext>| async move {
    ctx.write().steps_executed.push(name.to_string());
    tracing::warn!(target: "test_steps", step = name, "failing with: '{}'", error_message);
    Err::<(), _>(PortageError::from(anyhow::Error::new(TestError::Handler(error_message.to_string()))))
  })
}

// --- Messages ---

pub fn test_message(message_id: &str, message_type: &str, body: &str) -> IncomingMessage {
  let mut headers = BTreeMap::new();
  headers.insert(headers::ENCLOSED_MESSAGE_TYPES.to_string(), message_type.to_string());
  headers.insert(headers::REPLY_TO_ADDRESS.to_string(), "sender".to_string());
  IncomingMessage::new(message_id, headers, body.as_bytes().to_vec())
}

pub fn test_settings(endpoint_name: &str) -> EndpointSettings {
  EndpointSettings {
    concurrency: 1,
    immediate_retries: 5,
    delayed_retries: 2,
    delayed_retry_increment: Duration::from_secs(1),
    shutdown_grace: Duration::from_secs(5),
    ..EndpointSettings::new(endpoint_name)
  }
}

pub async fn receive_next(transport: &InMemoryTransport, queue: &str) -> ReceivedMessage {
  tokio::time::timeout(Duration::from_secs(30), transport.receive(queue))
    .await
    .expect("timed out waiting for a message")
    .expect("receive failed")
    .expect("transport closed")
}

/// Captures every error notification raised by the endpoint.
pub fn capture_error_notifications(notifications: &Notifications) -> Arc<Mutex<Vec<ErrorNotification>>> {
  let captured = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&captured);
  notifications.on_error(move |notification| sink.lock().push(notification.clone()));
  captured
}

// --- Helper for Tracing Setup (call once per test run if needed) ---
use once_cell::sync::Lazy;
static TRACING_INIT: Lazy<()> = Lazy::new(|| {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
    )
    .with_test_writer() // Important for tests to capture output
    .try_init()
    .ok(); // Allow multiple initializations in tests (ok if fails)
});

pub fn setup_tracing() {
  Lazy::force(&TRACING_INIT);
}

// --- Atomic counters for checking execution counts ---
pub static HANDLER_EXEC_COUNTER: Lazy<Arc<AtomicUsize>> = Lazy::new(|| Arc::new(AtomicUsize::new(0)));
pub static SIDE_EFFECT_COUNTER: Lazy<Arc<AtomicUsize>> = Lazy::new(|| Arc::new(AtomicUsize::new(0)));

pub fn reset_counters() {
  HANDLER_EXEC_COUNTER.store(0, Ordering::SeqCst);
  SIDE_EFFECT_COUNTER.store(0, Ordering::SeqCst);
}
