// tests/outbox_tests.rs

mod common;

use chrono::Utc;
use common::*;
use portage::headers::Headers;
use portage::{
  enlisted, enlisted_write, Endpoint, EndpointConfiguration, HandlerContext, InMemoryOutboxStorage, InMemoryTransport,
  LogicalMessage, OutboxMessage, OutboxStorage, OutgoingLogicalMessage, OutgoingMessage, PortageError, ProcessOutcome,
  SendOptions, TransportOperation,
};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn operation(message_id: &str, destination: &str) -> TransportOperation {
  TransportOperation::with_id(
    format!("{message_id}@{destination}"),
    OutgoingMessage::new(message_id, Headers::new(), "payload"),
    destination,
  )
}

async fn commit_record(storage: &InMemoryOutboxStorage, message_id: &str, operations: Vec<TransportOperation>) {
  let transaction = storage.begin_transaction().await.unwrap();
  storage
    .store(OutboxMessage::new(message_id, operations), transaction.as_ref())
    .await
    .unwrap();
  transaction.commit().await.unwrap();
}

fn outbox_endpoint(
  transport: &Arc<InMemoryTransport>,
  storage: &Arc<InMemoryOutboxStorage>,
  configure: impl FnOnce(&mut EndpointConfiguration),
) -> Endpoint {
  let mut config = EndpointConfiguration::new(test_settings("orders"));
  config.use_transport(transport.clone()).enable_outbox(storage.clone());
  config.routing().route_to_endpoint("BillOrder", "billing");
  configure(&mut config);
  Endpoint::create(config).unwrap()
}

#[tokio::test]
#[serial]
async fn test_committed_record_is_readable() {
  setup_tracing();
  let storage = InMemoryOutboxStorage::new();
  commit_record(&storage, "m-1", vec![operation("out-1", "billing")]).await;

  let record = storage.get("m-1").await.unwrap().unwrap();
  assert_eq!(record.message_id, "m-1");
  assert!(!record.dispatched);
  assert_eq!(record.transport_operations, vec![operation("out-1", "billing")]);
  assert!(record.dispatched_at.is_none());
}

#[tokio::test]
#[serial]
async fn test_uncommitted_record_is_invisible() {
  setup_tracing();
  let storage = InMemoryOutboxStorage::new();
  {
    let transaction = storage.begin_transaction().await.unwrap();
    storage
      .store(OutboxMessage::new("m-1", vec![operation("out-1", "billing")]), transaction.as_ref())
      .await
      .unwrap();
    assert!(storage.get("m-1").await.unwrap().is_none());
  }
  assert!(storage.get("m-1").await.unwrap().is_none());
  assert!(storage.is_empty());
}

#[tokio::test]
#[serial]
async fn test_second_record_for_same_id_is_rejected() {
  setup_tracing();
  let storage = InMemoryOutboxStorage::new();

  let first = storage.begin_transaction().await.unwrap();
  let second = storage.begin_transaction().await.unwrap();
  storage
    .store(OutboxMessage::new("m-1", vec![operation("first", "billing")]), first.as_ref())
    .await
    .unwrap();
  storage
    .store(OutboxMessage::new("m-1", vec![operation("second", "billing")]), second.as_ref())
    .await
    .unwrap();

  first.commit().await.unwrap();
  let err = second.commit().await.unwrap_err();
  assert!(err.is_outbox_contention());

  // The winner's record is untouched.
  let record = storage.get("m-1").await.unwrap().unwrap();
  assert_eq!(record.transport_operations, vec![operation("first", "billing")]);

  // Storing after the winner committed fails straight away.
  let third = storage.begin_transaction().await.unwrap();
  let err = storage
    .store(OutboxMessage::new("m-1", Vec::new()), third.as_ref())
    .await
    .unwrap_err();
  assert!(matches!(err, PortageError::DuplicateOutboxRecord { ref message_id } if message_id == "m-1"));
}

#[tokio::test]
#[serial]
async fn test_completed_transaction_rejects_further_use() {
  setup_tracing();
  let storage = InMemoryOutboxStorage::new();
  let transaction = storage.begin_transaction().await.unwrap();
  transaction.commit().await.unwrap();
  assert!(transaction.is_completed());

  assert!(matches!(transaction.commit().await, Err(PortageError::TransactionCompleted)));
  assert!(matches!(
    transaction.enlist(enlisted_write(|| {})),
    Err(PortageError::TransactionCompleted)
  ));
}

#[tokio::test]
#[serial]
async fn test_enlisted_actions_run_only_on_commit() {
  setup_tracing();
  reset_counters();
  let storage = InMemoryOutboxStorage::new();

  let rolled_back = storage.begin_transaction().await.unwrap();
  rolled_back
    .enlist(enlisted_write(|| {
      SIDE_EFFECT_COUNTER.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap();
  drop(rolled_back);
  assert_eq!(SIDE_EFFECT_COUNTER.load(Ordering::SeqCst), 0);

  let committed = storage.begin_transaction().await.unwrap();
  committed
    .enlist(enlisted_write(|| {
      SIDE_EFFECT_COUNTER.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap();
  committed.commit().await.unwrap();
  assert_eq!(SIDE_EFFECT_COUNTER.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn test_failing_enlisted_action_keeps_the_record_out() {
  setup_tracing();
  reset_counters();
  let storage = InMemoryOutboxStorage::new();
  let transaction = storage.begin_transaction().await.unwrap();
  storage
    .store(OutboxMessage::new("m-1", Vec::new()), transaction.as_ref())
    .await
    .unwrap();
  // The first change would succeed on its own; the second is rejected.
  transaction
    .enlist(enlisted_write(|| {
      SIDE_EFFECT_COUNTER.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap();
  transaction
    .enlist(enlisted(
      || Err::<(), _>(anyhow::anyhow!("constraint violated")),
      || {
        SIDE_EFFECT_COUNTER.fetch_add(100, Ordering::SeqCst);
      },
    ))
    .unwrap();

  let err = transaction.commit().await.unwrap_err();
  assert!(matches!(err, PortageError::Storage { .. }));
  assert!(storage.get("m-1").await.unwrap().is_none());
  assert_eq!(SIDE_EFFECT_COUNTER.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[serial]
async fn test_enlisted_changes_apply_in_order_after_every_check_passes() {
  setup_tracing();
  let storage = InMemoryOutboxStorage::new();
  let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let transaction = storage.begin_transaction().await.unwrap();
  storage
    .store(OutboxMessage::new("m-1", Vec::new()), transaction.as_ref())
    .await
    .unwrap();
  for name in ["first", "second"] {
    let (check_log, apply_log) = (Arc::clone(&log), Arc::clone(&log));
    transaction
      .enlist(enlisted(
        move || {
          check_log.lock().push(format!("check {name}"));
          Ok::<_, anyhow::Error>(())
        },
        move || apply_log.lock().push(format!("apply {name}")),
      ))
      .unwrap();
  }

  transaction.commit().await.unwrap();
  assert_eq!(*log.lock(), vec!["check first", "check second", "apply first", "apply second"]);
}

#[tokio::test]
#[serial]
async fn test_enlisted_change_may_read_the_same_storage() {
  setup_tracing();
  let storage = InMemoryOutboxStorage::new();
  let seen = Arc::new(AtomicUsize::new(usize::MAX));
  let transaction = storage.begin_transaction().await.unwrap();
  storage
    .store(OutboxMessage::new("m-1", Vec::new()), transaction.as_ref())
    .await
    .unwrap();
  {
    let (during_check, during_apply) = (storage.clone(), storage.clone());
    let seen = Arc::clone(&seen);
    transaction
      .enlist(enlisted(
        move || {
          // The record is not visible yet while checks run.
          anyhow::ensure!(during_check.is_empty(), "record visible before commit");
          Ok(())
        },
        move || seen.store(during_apply.len(), Ordering::SeqCst),
      ))
      .unwrap();
  }

  tokio::time::timeout(std::time::Duration::from_secs(5), transaction.commit())
    .await
    .expect("commit must not block on its own storage")
    .unwrap();
  assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn test_losing_commit_applies_no_changes() {
  setup_tracing();
  reset_counters();
  let storage = InMemoryOutboxStorage::new();
  let first = storage.begin_transaction().await.unwrap();
  let second = storage.begin_transaction().await.unwrap();
  for transaction in [&first, &second] {
    storage
      .store(OutboxMessage::new("m-1", Vec::new()), transaction.as_ref())
      .await
      .unwrap();
    transaction
      .enlist(enlisted_write(|| {
        SIDE_EFFECT_COUNTER.fetch_add(1, Ordering::SeqCst);
      }))
      .unwrap();
  }

  first.commit().await.unwrap();
  let err = second.commit().await.unwrap_err();
  assert!(err.is_outbox_contention());
  assert_eq!(SIDE_EFFECT_COUNTER.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn test_dispatched_record_drops_operations_and_stays_dispatched() {
  setup_tracing();
  let storage = InMemoryOutboxStorage::new();
  commit_record(&storage, "m-1", vec![operation("out-1", "billing")]).await;

  storage.set_as_dispatched("m-1").await.unwrap();
  let record = storage.get("m-1").await.unwrap().unwrap();
  assert!(record.dispatched);
  assert!(record.transport_operations.is_empty());
  let dispatched_at = record.dispatched_at.unwrap();

  // A second call changes nothing.
  storage.set_as_dispatched("m-1").await.unwrap();
  assert_eq!(storage.get("m-1").await.unwrap().unwrap().dispatched_at, Some(dispatched_at));

  // Unknown ids are ignored.
  storage.set_as_dispatched("nope").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_cleanup_removes_only_old_dispatched_records() {
  setup_tracing();
  let storage = InMemoryOutboxStorage::new();
  commit_record(&storage, "dispatched", Vec::new()).await;
  commit_record(&storage, "pending", vec![operation("out-1", "billing")]).await;
  storage.set_as_dispatched("dispatched").await.unwrap();

  let removed = storage
    .remove_dispatched_older_than(Utc::now() - chrono::Duration::hours(1))
    .await
    .unwrap();
  assert_eq!(removed, 0);

  let removed = storage
    .remove_dispatched_older_than(Utc::now() + chrono::Duration::seconds(1))
    .await
    .unwrap();
  assert_eq!(removed, 1);
  assert!(storage.get("dispatched").await.unwrap().is_none());
  assert!(storage.get("pending").await.unwrap().is_some());
}

#[tokio::test]
#[serial]
async fn test_redelivered_message_does_not_run_the_handler_again() {
  setup_tracing();
  reset_counters();
  let transport = Arc::new(InMemoryTransport::with_queues(["orders", "billing", "error"]));
  let storage = Arc::new(InMemoryOutboxStorage::new());
  let endpoint = outbox_endpoint(&transport, &storage, |config| {
    config.handle_fn("PlaceOrder", "bill", |message: LogicalMessage, ctx: HandlerContext| async move {
      HANDLER_EXEC_COUNTER.fetch_add(1, Ordering::SeqCst);
      let transaction = ctx
        .storage_transaction()
        .ok_or_else(|| anyhow::anyhow!("outbox transaction missing"))?;
      transaction.enlist(enlisted_write(|| {
        SIDE_EFFECT_COUNTER.fetch_add(1, Ordering::SeqCst);
      }))?;
      ctx
        .send(OutgoingLogicalMessage::new("BillOrder", message.body), SendOptions::new())
        .await?;
      Ok::<_, anyhow::Error>(())
    });
  });

  for _ in 0..2 {
    transport.enqueue("orders", test_message("m-1", "PlaceOrder", "{\"order\":1}")).unwrap();
    let received = receive_next(&transport, "orders").await;
    assert_eq!(endpoint.process(received, "orders").await.unwrap(), ProcessOutcome::Completed);
  }

  assert_eq!(HANDLER_EXEC_COUNTER.load(Ordering::SeqCst), 1);
  assert_eq!(SIDE_EFFECT_COUNTER.load(Ordering::SeqCst), 1);
  assert_eq!(transport.sent_to("billing").len(), 1);

  let record = storage.get("m-1").await.unwrap().unwrap();
  assert!(record.dispatched);
  assert!(record.transport_operations.is_empty());
  assert_eq!(storage.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_stored_but_undispatched_operations_are_replayed() {
  setup_tracing();
  reset_counters();
  let transport = Arc::new(InMemoryTransport::with_queues(["orders", "billing", "error"]));
  let storage = Arc::new(InMemoryOutboxStorage::new());
  // A previous delivery committed but crashed before dispatching.
  commit_record(&storage, "m-1", vec![operation("out-1", "billing")]).await;

  let endpoint = outbox_endpoint(&transport, &storage, |config| {
    config.handle_fn("PlaceOrder", "bill", |_message: LogicalMessage, _ctx: HandlerContext| async move {
      HANDLER_EXEC_COUNTER.fetch_add(1, Ordering::SeqCst);
      Ok::<_, anyhow::Error>(())
    });
  });

  transport.enqueue("orders", test_message("m-1", "PlaceOrder", "{}")).unwrap();
  let received = receive_next(&transport, "orders").await;
  endpoint.process(received, "orders").await.unwrap();

  assert_eq!(HANDLER_EXEC_COUNTER.load(Ordering::SeqCst), 0);
  let sent = transport.sent_to("billing");
  assert_eq!(sent.len(), 1);
  assert_eq!(sent[0].message_id, "out-1");
  assert!(storage.get("m-1").await.unwrap().unwrap().dispatched);
}

#[tokio::test]
#[serial]
async fn test_failed_handler_leaves_no_record_and_sends_nothing() {
  setup_tracing();
  let transport = Arc::new(InMemoryTransport::with_queues(["orders", "billing", "error"]));
  let storage = Arc::new(InMemoryOutboxStorage::new());
  let endpoint = outbox_endpoint(&transport, &storage, |config| {
    config.settings_mut().immediate_retries = 0;
    config.settings_mut().delayed_retries = 0;
    config.handle_fn("PlaceOrder", "bill", |message: LogicalMessage, ctx: HandlerContext| async move {
      ctx
        .send(OutgoingLogicalMessage::new("BillOrder", message.body), SendOptions::new())
        .await?;
      Err::<(), _>(anyhow::anyhow!("card declined"))
    });
  });

  transport.enqueue("orders", test_message("m-1", "PlaceOrder", "{}")).unwrap();
  let received = receive_next(&transport, "orders").await;
  let outcome = endpoint.process(received, "orders").await.unwrap();

  assert!(matches!(outcome, ProcessOutcome::Handled(ref action) if action.name() == "MoveToError"));
  assert!(storage.get("m-1").await.unwrap().is_none());
  assert!(transport.sent_to("billing").is_empty());
  assert_eq!(transport.sent_to("error").len(), 1);
}

#[tokio::test]
#[serial]
async fn test_losing_a_commit_race_releases_the_message() {
  setup_tracing();
  let transport = Arc::new(InMemoryTransport::with_queues(["orders", "billing", "error"]));
  let storage = Arc::new(InMemoryOutboxStorage::new());
  let competitor = Arc::clone(&storage);
  let captured_storage = Arc::clone(&storage);

  let endpoint = outbox_endpoint(&transport, &storage, move |config| {
    config.handle_fn("PlaceOrder", "bill", move |message: LogicalMessage, ctx: HandlerContext| {
      let competitor = Arc::clone(&competitor);
      async move {
        ctx
          .send(OutgoingLogicalMessage::new("BillOrder", message.body), SendOptions::new())
          .await?;
        // Another worker finishes the same message first.
        let other = competitor.begin_transaction().await?;
        competitor
          .store(OutboxMessage::new(ctx.message_id(), Vec::new()), other.as_ref())
          .await?;
        other.commit().await?;
        Ok::<_, anyhow::Error>(())
      }
    });
  });
  let captured = capture_error_notifications(endpoint.notifications());

  transport.enqueue("orders", test_message("m-1", "PlaceOrder", "{}")).unwrap();
  let received = receive_next(&transport, "orders").await;
  let outcome = endpoint.process(received, "orders").await.unwrap();

  assert_eq!(outcome, ProcessOutcome::Released);
  assert_eq!(transport.released(), vec!["m-1".to_string()]);
  assert!(captured.lock().is_empty(), "contention must bypass recoverability");
  assert!(transport.sent_to("billing").is_empty());

  let record = captured_storage.get("m-1").await.unwrap().unwrap();
  assert!(record.transport_operations.is_empty());
}
