// tests/recoverability_tests.rs

mod common;

use common::*;
use portage::headers;
use portage::recoverability::{DelayedConfig, FailedConfig, ImmediateConfig};
use portage::{
  Endpoint, EndpointConfiguration, ErrorContext, ErrorNotification, HandlerContext, InMemoryTransport, LinearBackoff,
  LogicalMessage, PortageError, ProcessOutcome, RecoverabilityAction, RecoverabilityConfig, RecoverabilityPolicy,
  ScheduledBackoff, TransportTransaction, UnrecoverableFailure,
};
use serial_test::serial;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(immediate: u32, delayed: u32, increment_secs: u64) -> RecoverabilityConfig {
  RecoverabilityConfig {
    immediate: ImmediateConfig { max_retries: immediate },
    delayed: DelayedConfig {
      max_retries: delayed,
      backoff: Arc::new(LinearBackoff::new(Duration::from_secs(increment_secs)).unwrap()),
    },
    failed: FailedConfig {
      error_queue: "error".to_string(),
      unrecoverable: Vec::new(),
    },
  }
}

fn handler_failure() -> PortageError {
  PortageError::from(anyhow::Error::new(TestError::Handler("boom".to_string()))).in_step("invoke_handler")
}

fn error_context(error: PortageError, failures: u32, delayed: u32) -> ErrorContext {
  ErrorContext {
    error,
    message: test_message("m-1", "PlaceOrder", "{}"),
    transport_transaction: TransportTransaction::new("receipt-1"),
    immediate_processing_failures: failures,
    delayed_deliveries_performed: delayed,
    receive_address: "orders".to_string(),
  }
}

#[test]
#[serial]
fn test_immediate_tier_then_delayed_tier_then_error_queue() {
  setup_tracing();
  let policy = RecoverabilityPolicy::new(config(2, 2, 1));

  let actions: Vec<_> = [(1, 0), (2, 0), (3, 0), (4, 1), (5, 2)]
    .into_iter()
    .map(|(failures, delayed)| policy.classify(&error_context(handler_failure(), failures, delayed)))
    .collect();

  assert_eq!(actions[0], RecoverabilityAction::ImmediateRetry);
  assert_eq!(actions[1], RecoverabilityAction::ImmediateRetry);
  assert_eq!(
    actions[2],
    RecoverabilityAction::DelayedRetry {
      delay: Duration::from_secs(1),
      destination: "orders".to_string()
    }
  );
  assert_eq!(
    actions[3],
    RecoverabilityAction::DelayedRetry {
      delay: Duration::from_secs(2),
      destination: "orders".to_string()
    }
  );
  assert!(matches!(&actions[4], RecoverabilityAction::MoveToError { error_queue, .. } if error_queue == "error"));
}

#[test]
#[serial]
fn test_classification_is_deterministic() {
  setup_tracing();
  let policy = RecoverabilityPolicy::new(config(3, 2, 5));
  for failures in 1..8 {
    for delayed in 0..4 {
      let first = policy.classify(&error_context(handler_failure(), failures, delayed));
      let second = policy.classify(&error_context(handler_failure(), failures, delayed));
      assert_eq!(first, second, "failures={failures} delayed={delayed}");
    }
  }
}

#[test]
#[serial]
fn test_zero_retries_go_straight_to_error_queue() {
  setup_tracing();
  let policy = RecoverabilityPolicy::new(config(0, 0, 1));
  let action = policy.classify(&error_context(handler_failure(), 1, 0));
  assert_eq!(action.name(), "MoveToError");
}

#[test]
#[serial]
fn test_deserialization_failure_is_never_retried() {
  setup_tracing();
  let policy = RecoverabilityPolicy::new(config(5, 3, 1));
  let error = PortageError::MessageDeserialization {
    message_id: "m-1".to_string(),
    reason: "missing type header".to_string(),
  }
  .in_step("deserialize");

  match policy.classify(&error_context(error, 1, 0)) {
    RecoverabilityAction::MoveToError { headers: added, .. } => {
      assert_eq!(added.get(headers::EXCEPTION_TYPE).map(String::as_str), Some("MessageDeserialization"));
      assert_eq!(added.get(headers::EXCEPTION_STEP).map(String::as_str), Some("deserialize"));
      assert_eq!(added.get(headers::FAILED_QUEUE).map(String::as_str), Some("orders"));
    }
    other => panic!("Expected MoveToError, got {other:?}"),
  }
}

#[test]
#[serial]
fn test_routing_and_configuration_failures_skip_retries() {
  setup_tracing();
  let policy = RecoverabilityPolicy::new(config(5, 3, 1));

  let unroutable = PortageError::UnroutableMessage {
    message_type: "Unmapped".to_string(),
    reason: "no route configured".to_string(),
  }
  .in_step("routing");
  match policy.classify(&error_context(unroutable, 1, 0)) {
    RecoverabilityAction::MoveToError { headers: added, .. } => {
      assert_eq!(added.get(headers::EXCEPTION_TYPE).map(String::as_str), Some("UnroutableMessage"));
      assert!(added
        .get(headers::EXCEPTION_MESSAGE)
        .is_some_and(|text| text.contains("Unmapped")));
    }
    other => panic!("Expected MoveToError, got {other:?}"),
  }

  let misconfigured = PortageError::configuration("receive queue missing");
  assert_eq!(policy.classify(&error_context(misconfigured, 1, 0)).name(), "MoveToError");

  // A missing destination queue may still be created, so it is retried.
  let missing_queue = PortageError::QueueNotFound {
    queue: "billing".to_string(),
    message_type: "BillOrder".to_string(),
  };
  assert_eq!(policy.classify(&error_context(missing_queue, 1, 0)), RecoverabilityAction::ImmediateRetry);
}

#[test]
#[serial]
fn test_malformed_retry_count_counts_as_exhausted() {
  setup_tracing();
  let mut message_headers = headers::Headers::new();
  assert_eq!(headers::delayed_retries(&message_headers), 0);
  message_headers.insert(headers::DELAYED_RETRIES.to_string(), " 2 ".to_string());
  assert_eq!(headers::delayed_retries(&message_headers), 2);
  message_headers.insert(headers::DELAYED_RETRIES.to_string(), "two".to_string());
  assert_eq!(headers::delayed_retries(&message_headers), u32::MAX);

  let policy = RecoverabilityPolicy::new(config(0, 3, 1));
  let action = policy.classify(&error_context(handler_failure(), 1, headers::delayed_retries(&message_headers)));
  assert_eq!(action.name(), "MoveToError");
}

#[test]
#[serial]
fn test_configured_unrecoverable_failure_skips_retries() {
  setup_tracing();
  let mut cfg = config(5, 3, 1);
  cfg.failed.unrecoverable.push(UnrecoverableFailure::of_type::<TestError>());
  let policy = RecoverabilityPolicy::new(cfg);

  let action = policy.classify(&error_context(handler_failure(), 1, 0));
  assert_eq!(action.name(), "MoveToError");

  // Other failures still take the normal route.
  let other = PortageError::from(anyhow::anyhow!("database timeout")).in_step("invoke_handler");
  assert_eq!(policy.classify(&error_context(other, 1, 0)), RecoverabilityAction::ImmediateRetry);
}

#[test]
#[serial]
fn test_custom_policy_can_discard_and_fall_back() {
  setup_tracing();
  let policy = RecoverabilityPolicy::new(config(1, 1, 1)).with_custom(Arc::new(|cfg: &RecoverabilityConfig, ctx: &ErrorContext| {
    if ctx.error.is_caused_by::<TestError>() {
      RecoverabilityAction::Discard {
        reason: "expired order".to_string(),
      }
    } else {
      RecoverabilityPolicy::default_action(cfg, ctx)
    }
  }));

  assert_eq!(
    policy.classify(&error_context(handler_failure(), 1, 0)),
    RecoverabilityAction::Discard {
      reason: "expired order".to_string()
    }
  );
  let other = PortageError::from(anyhow::anyhow!("database timeout"));
  assert_eq!(policy.classify(&error_context(other, 1, 0)), RecoverabilityAction::ImmediateRetry);
}

#[test]
#[serial]
fn test_config_rejects_non_increasing_delays() {
  setup_tracing();
  let mut cfg = config(1, 3, 1);
  cfg.delayed.backoff = Arc::new(ScheduledBackoff::new(vec![Duration::from_secs(5)]).unwrap());
  assert!(cfg.validate().unwrap_err().is_configuration());

  cfg.delayed.max_retries = 1;
  cfg.validate().unwrap();
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_endpoint_walks_every_tier_before_the_error_queue() {
  setup_tracing();
  reset_counters();
  let transport = Arc::new(InMemoryTransport::with_queues(["orders", "error"]));

  let mut settings = test_settings("orders");
  settings.immediate_retries = 2;
  settings.delayed_retries = 2;
  settings.delayed_retry_increment = Duration::from_secs(1);

  let mut config = EndpointConfiguration::new(settings);
  config
    .use_transport(transport.clone())
    .handle_fn("PlaceOrder", "always_fails", |_message: LogicalMessage, _ctx: HandlerContext| async move {
      HANDLER_EXEC_COUNTER.fetch_add(1, Ordering::SeqCst);
      Err::<(), _>(anyhow::Error::new(TestError::Handler("still broken".to_string())))
    });
  let captured = capture_error_notifications(&config.notifications());
  let endpoint = Endpoint::create(config).unwrap();

  let shutdown = CancellationToken::new();
  let runner = tokio::spawn({
    let endpoint = endpoint.clone();
    let shutdown = shutdown.clone();
    async move { endpoint.run(shutdown).await }
  });

  transport.enqueue("orders", test_message("m-42", "PlaceOrder", "{\"id\":42}")).unwrap();
  let failed = receive_next(&transport, "error").await;

  shutdown.cancel();
  runner.await.unwrap().unwrap();

  let kinds: Vec<String> = captured
    .lock()
    .iter()
    .map(|notification| match notification {
      ErrorNotification::ImmediateRetry { .. } => "IR".to_string(),
      ErrorNotification::DelayedRetry { delay, .. } => format!("DR({}s)", delay.as_secs()),
      ErrorNotification::MovedToErrorQueue { .. } => "MoveToError".to_string(),
      ErrorNotification::Discarded { .. } => "Discard".to_string(),
    })
    .collect();
  assert_eq!(kinds, vec!["IR", "IR", "DR(1s)", "DR(2s)", "MoveToError"]);
  assert!(captured.lock().iter().all(|n| n.message_id() == "m-42"));

  // The failure counter survives delayed retries, so redeliveries skip the immediate tier.
  assert_eq!(HANDLER_EXEC_COUNTER.load(Ordering::SeqCst), 5);

  let message = failed.message;
  assert_eq!(message.message_id, "m-42");
  assert_eq!(&message.body[..], b"{\"id\":42}");
  assert_eq!(message.header(headers::FAILED_QUEUE), Some("orders"));
  assert_eq!(message.header(headers::EXCEPTION_TYPE), Some("Handler"));
  assert_eq!(message.header(headers::EXCEPTION_STEP), Some("invoke_handler"));
  assert_eq!(message.header(headers::DELAYED_RETRIES), Some("2"));
  assert!(message
    .header(headers::EXCEPTION_MESSAGE)
    .is_some_and(|text| text.contains("still broken")));
  assert!(message.header(headers::TIME_OF_FAILURE).and_then(headers::parse_timestamp).is_some());
  assert_eq!(message.header(headers::ENCLOSED_MESSAGE_TYPES), Some("PlaceOrder"));
}

#[tokio::test]
#[serial]
async fn test_success_after_immediate_retries_completes() {
  setup_tracing();
  reset_counters();
  let transport = Arc::new(InMemoryTransport::with_queues(["orders", "error"]));

  let mut config = EndpointConfiguration::new(test_settings("orders"));
  config
    .use_transport(transport.clone())
    .handle_fn("PlaceOrder", "flaky", |_message: LogicalMessage, _ctx: HandlerContext| async move {
      let attempt = HANDLER_EXEC_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
      if attempt <= 3 {
        return Err(anyhow::Error::new(TestError::Handler(format!("attempt {attempt}"))));
      }
      Ok(())
    });
  let captured = capture_error_notifications(&config.notifications());
  let endpoint = Endpoint::create(config).unwrap();

  transport.enqueue("orders", test_message("m-7", "PlaceOrder", "{}")).unwrap();
  let received = receive_next(&transport, "orders").await;
  let outcome = endpoint.process(received, "orders").await.unwrap();

  assert_eq!(outcome, ProcessOutcome::Completed);
  assert_eq!(HANDLER_EXEC_COUNTER.load(Ordering::SeqCst), 4);
  assert_eq!(captured.lock().len(), 3);
  assert_eq!(transport.acknowledged(), vec!["m-7".to_string()]);
  assert!(transport.sent_to("error").is_empty());
}

#[tokio::test]
#[serial]
async fn test_missing_error_queue_is_a_critical_error() {
  setup_tracing();
  let transport = Arc::new(InMemoryTransport::with_queues(["orders"]));

  let mut settings = test_settings("orders");
  settings.immediate_retries = 0;
  settings.delayed_retries = 0;
  let mut config = EndpointConfiguration::new(settings);
  config.use_transport(transport.clone());
  let critical = Arc::new(parking_lot::Mutex::new(Vec::new()));
  {
    let sink = Arc::clone(&critical);
    config
      .notifications()
      .on_critical_error(move |notification| sink.lock().push(notification.message.clone()));
  }
  let endpoint = Endpoint::create(config).unwrap();

  // No handler for the type, so the first attempt fails and goes to "error".
  transport.enqueue("orders", test_message("m-9", "Unknown", "{}")).unwrap();
  let received = receive_next(&transport, "orders").await;
  let err = endpoint.process(received, "orders").await.unwrap_err();

  assert!(matches!(err, PortageError::QueueNotFound { ref queue, .. } if queue == "error"));
  assert_eq!(critical.lock().len(), 1);
  assert_eq!(transport.released(), vec!["m-9".to_string()]);
}

#[tokio::test]
#[serial]
async fn test_unroutable_send_in_handler_goes_straight_to_error_queue() {
  setup_tracing();
  reset_counters();
  let transport = Arc::new(InMemoryTransport::with_queues(["orders", "error"]));

  let mut settings = test_settings("orders");
  settings.immediate_retries = 3;
  let mut config = EndpointConfiguration::new(settings);
  config
    .use_transport(transport.clone())
    .handle_fn("PlaceOrder", "sends_unmapped", |_message: LogicalMessage, ctx: HandlerContext| async move {
      HANDLER_EXEC_COUNTER.fetch_add(1, Ordering::SeqCst);
      ctx
        .send(portage::OutgoingLogicalMessage::new("Unmapped", "{}"), portage::SendOptions::new())
        .await?;
      Ok::<_, anyhow::Error>(())
    });
  let captured = capture_error_notifications(&config.notifications());
  let endpoint = Endpoint::create(config).unwrap();

  transport.enqueue("orders", test_message("m-1", "PlaceOrder", "{}")).unwrap();
  let received = receive_next(&transport, "orders").await;
  let outcome = endpoint.process(received, "orders").await.unwrap();

  assert!(matches!(outcome, ProcessOutcome::Handled(RecoverabilityAction::MoveToError { .. })));
  assert_eq!(HANDLER_EXEC_COUNTER.load(Ordering::SeqCst), 1);
  assert_eq!(captured.lock().len(), 1);
  let failed = transport.sent_to("error");
  assert_eq!(failed.len(), 1);
  assert_eq!(
    failed[0].headers.get(headers::EXCEPTION_TYPE).map(String::as_str),
    Some("UnroutableMessage")
  );
}

#[tokio::test]
#[serial]
async fn test_corrupted_retry_header_does_not_restart_delayed_tier() {
  setup_tracing();
  let transport = Arc::new(InMemoryTransport::with_queues(["orders", "error"]));

  let mut settings = test_settings("orders");
  settings.immediate_retries = 0;
  settings.delayed_retries = 2;
  let mut config = EndpointConfiguration::new(settings);
  config
    .use_transport(transport.clone())
    .handle_fn("PlaceOrder", "always_fails", |_message: LogicalMessage, _ctx: HandlerContext| async move {
      Err::<(), _>(anyhow::Error::new(TestError::Handler("broken".to_string())))
    });
  let endpoint = Endpoint::create(config).unwrap();

  let mut message = test_message("m-1", "PlaceOrder", "{}");
  message
    .headers
    .insert(headers::DELAYED_RETRIES.to_string(), "garbled".to_string());
  transport.enqueue("orders", message).unwrap();
  let received = receive_next(&transport, "orders").await;
  endpoint.process(received, "orders").await.unwrap();

  assert!(transport.deferred().is_empty());
  assert_eq!(transport.sent_to("error").len(), 1);
}

#[tokio::test]
#[serial]
async fn test_message_failing_twice_reaches_the_error_queue_twice() {
  setup_tracing();
  let transport = Arc::new(InMemoryTransport::with_queues(["orders", "error"]));

  let mut settings = test_settings("orders");
  settings.immediate_retries = 0;
  settings.delayed_retries = 0;
  let mut config = EndpointConfiguration::new(settings);
  config
    .use_transport(transport.clone())
    .handle_fn("PlaceOrder", "always_fails", |_message: LogicalMessage, _ctx: HandlerContext| async move {
      Err::<(), _>(anyhow::Error::new(TestError::Handler("broken".to_string())))
    });
  let endpoint = Endpoint::create(config).unwrap();

  // The same message id fails again, e.g. after being retried from the error queue.
  for _ in 0..2 {
    transport.enqueue("orders", test_message("m-1", "PlaceOrder", "{}")).unwrap();
    let received = receive_next(&transport, "orders").await;
    endpoint.process(received, "orders").await.unwrap();
  }

  assert_eq!(transport.acknowledged(), vec!["m-1".to_string(), "m-1".to_string()]);
  let failed = transport.sent_to("error");
  assert_eq!(failed.len(), 2);
  assert!(failed.iter().all(|message| message.message_id == "m-1"));
  let operations: Vec<_> = transport.sent().into_iter().map(|op| op.operation_id).collect();
  assert_ne!(operations[0], operations[1]);
}
