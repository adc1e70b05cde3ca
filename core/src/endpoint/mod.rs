// portage/src/endpoint/mod.rs

//! `Endpoint`: builds both pipelines from an [`EndpointConfiguration`] and
//! runs the receive loop with recoverability around every message.

pub mod configuration;

pub use configuration::EndpointConfiguration;

use crate::config::EndpointSettings;
use crate::core::context_bag::ContextBag;
use crate::core::context_data::ContextData;
use crate::core::step::RegisterStep;
use crate::error::{PortageError, PortageResult};
use crate::notifications::{CriticalError, Notifications, ReceivePipelineCompleted};
use crate::outbox::{OutboxBehavior, OutboxStorage, OUTBOX};
use crate::pipeline::contexts::{
  IncomingMessageInfo, IncomingPhysicalContext, OutgoingLogicalContext, INCOMING_MESSAGE, OUTGOING_PIPELINE,
};
use crate::pipeline::definition::StepRegistry;
use crate::pipeline::execution::Pipeline;
use crate::receive::steps::{
  BatchDispatchBehavior, DeserializeConnector, InvokeHandlerBehavior, LoadHandlersConnector, BATCH_DISPATCH,
  DESERIALIZE, INVOKE_HANDLER, LOAD_HANDLERS,
};
use crate::recoverability::{
  DelayedConfig, ErrorContext, ErrorHandleResult, FailedConfig, FailureInfoStorage, ImmediateConfig, LinearBackoff,
  RecoverabilityAction, RecoverabilityConfig, RecoverabilityExecutor, RecoverabilityPolicy,
};
use crate::routing::steps::{
  DispatchBehavior, PopulateHeadersBehavior, RoutingConnector, DISPATCH, POPULATE_HEADERS, ROUTING,
};
use crate::routing::{MessageDispatcher, UnicastRouter};
use crate::session::MessageSession;
use crate::transport::{IncomingMessage, ReceivedMessage, Transport, TransportError};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Instrument, Level};

/// How long a receive loop waits after a transport receive error.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
  /// The receive pipeline succeeded, possibly after immediate retries.
  Completed,
  /// Recoverability dealt with the message (delayed retry, error queue, discard).
  Handled(RecoverabilityAction),
  /// Handed back to the transport without running recoverability.
  Released,
}

struct EndpointInner {
  settings: EndpointSettings,
  transport: Arc<dyn Transport>,
  outbox: Option<Arc<dyn OutboxStorage>>,
  outbox_retention: chrono::Duration,
  receive: Pipeline<IncomingPhysicalContext>,
  outgoing: Pipeline<OutgoingLogicalContext>,
  root_bag: ContextBag,
  policy: RecoverabilityPolicy,
  executor: RecoverabilityExecutor,
  failures: FailureInfoStorage,
  notifications: Arc<Notifications>,
}

#[derive(Clone)]
pub struct Endpoint {
  inner: Arc<EndpointInner>,
}

impl Endpoint {
  /// Validates the configuration and builds both pipelines. Every
  /// configuration mistake (missing setting, unresolvable step order,
  /// mismatched step contexts) surfaces here.
  #[instrument(name = "Endpoint::create", skip_all, fields(endpoint = %config.settings.endpoint_name), err(Display))]
  pub fn create(config: EndpointConfiguration) -> PortageResult<Endpoint> {
    let EndpointConfiguration {
      settings,
      transport,
      outbox,
      deserializer,
      routing,
      handlers,
      customizations,
      backoff,
      unrecoverable,
      custom_policy,
      notifications,
    } = config;

    settings.validate()?;
    let transport =
      transport.ok_or_else(|| PortageError::configuration("no transport configured; call use_transport first"))?;

    let backoff = match backoff {
      Some(backoff) => backoff,
      None => Arc::new(LinearBackoff::new(settings.delayed_retry_increment)?),
    };
    let recoverability = RecoverabilityConfig {
      immediate: ImmediateConfig {
        max_retries: settings.immediate_retries,
      },
      delayed: DelayedConfig {
        max_retries: settings.delayed_retries,
        backoff,
      },
      failed: FailedConfig {
        error_queue: settings.error_queue.clone(),
        unrecoverable,
      },
    };
    recoverability.validate()?;
    let mut policy = RecoverabilityPolicy::new(recoverability);
    if let Some(custom) = custom_policy {
      policy = policy.with_custom(custom);
    }

    let outbox_retention = chrono::Duration::from_std(settings.outbox_retention)
      .map_err(|e| PortageError::configuration(format!("outbox retention out of range: {e}")))?;

    let dispatcher = Arc::new(MessageDispatcher::new(Arc::clone(&transport)));
    let router = Arc::new(UnicastRouter::new(
      routing,
      settings.local_address(),
      settings.instance_address(),
    ));

    let mut outgoing_steps = StepRegistry::new();
    outgoing_steps.register(
      RegisterStep::behavior::<OutgoingLogicalContext, _>(
        POPULATE_HEADERS,
        PopulateHeadersBehavior::new(settings.endpoint_name.clone(), Arc::clone(&router)),
      )
      .with_description("Stamps the standard outgoing headers"),
    )?;
    outgoing_steps.register(
      RegisterStep::connector::<OutgoingLogicalContext, _, _>(ROUTING, RoutingConnector::new(Arc::clone(&router)))
        .with_description("Resolves destinations for the outgoing message"),
    )?;
    outgoing_steps.register(
      RegisterStep::behavior::<crate::pipeline::RoutingContext, _>(DISPATCH, DispatchBehavior::new(Arc::clone(&dispatcher)))
        .with_description("Hands transport operations to the pending batch or the transport"),
    )?;

    let mut receive_steps = StepRegistry::new();
    match &outbox {
      Some(storage) => receive_steps.register(
        RegisterStep::behavior::<IncomingPhysicalContext, _>(
          OUTBOX,
          OutboxBehavior::new(Arc::clone(storage), Arc::clone(&dispatcher)),
        )
        .with_description("Deduplicates by message id and stores outgoing operations"),
      )?,
      None => receive_steps.register(
        RegisterStep::behavior::<IncomingPhysicalContext, _>(
          BATCH_DISPATCH,
          BatchDispatchBehavior::new(Arc::clone(&dispatcher)),
        )
        .with_description("Dispatches outgoing operations after the handlers succeed"),
      )?,
    }
    receive_steps.register(
      RegisterStep::connector::<IncomingPhysicalContext, _, _>(DESERIALIZE, DeserializeConnector::new(deserializer))
        .with_description("Turns the transport message into a logical message"),
    )?;
    receive_steps.register(
      RegisterStep::connector::<crate::pipeline::IncomingLogicalContext, _, _>(
        LOAD_HANDLERS,
        LoadHandlersConnector::new(Arc::new(handlers)),
      )
      .with_description("Runs the handler stage once per registered handler"),
    )?;
    receive_steps.register(
      RegisterStep::behavior::<crate::pipeline::InvokeHandlerContext, _>(INVOKE_HANDLER, InvokeHandlerBehavior)
        .with_description("Invokes the user handler"),
    )?;

    configuration::apply_customizations(customizations, &mut receive_steps, &mut outgoing_steps)?;

    let outgoing = outgoing_steps.build::<OutgoingLogicalContext>()?;
    let receive = receive_steps.build::<IncomingPhysicalContext>()?;

    let mut root_bag = ContextBag::new();
    root_bag.set(OUTGOING_PIPELINE, outgoing.clone());

    let executor = RecoverabilityExecutor::new(Arc::clone(&transport), dispatcher, Arc::clone(&notifications));

    event!(
      Level::INFO,
      receive_steps = ?receive.step_names(),
      outgoing_steps = ?outgoing.step_names(),
      outbox = outbox.is_some(),
      "Endpoint created."
    );

    Ok(Endpoint {
      inner: Arc::new(EndpointInner {
        settings,
        transport,
        outbox,
        outbox_retention,
        receive,
        outgoing,
        root_bag,
        policy,
        executor,
        failures: FailureInfoStorage::default(),
        notifications,
      }),
    })
  }

  pub fn settings(&self) -> &EndpointSettings {
    &self.inner.settings
  }

  pub fn receive_pipeline(&self) -> &Pipeline<IncomingPhysicalContext> {
    &self.inner.receive
  }

  pub fn outgoing_pipeline(&self) -> &Pipeline<OutgoingLogicalContext> {
    &self.inner.outgoing
  }

  pub fn policy(&self) -> &RecoverabilityPolicy {
    &self.inner.policy
  }

  pub fn notifications(&self) -> &Arc<Notifications> {
    &self.inner.notifications
  }

  /// Queues this endpoint receives from: the shared endpoint queue, plus the
  /// instance queue when an instance discriminator is configured.
  pub fn receive_addresses(&self) -> Vec<String> {
    let settings = &self.inner.settings;
    let mut addresses = vec![settings.local_address().to_string()];
    addresses.extend(settings.instance_address());
    addresses
  }

  /// A session for sending from outside a handler. Its messages go to the
  /// transport immediately.
  pub fn session(&self) -> MessageSession {
    MessageSession::new(self.inner.outgoing.clone(), self.inner.root_bag.child())
  }

  /// Processes one delivery to completion: runs the receive pipeline,
  /// retrying immediately as the policy allows, and acknowledges or releases
  /// the message at the end.
  #[instrument(
    name = "Endpoint::process",
    skip_all,
    fields(message_id = %received.message.message_id, queue = %receive_address)
  )]
  pub async fn process(&self, received: ReceivedMessage, receive_address: &str) -> PortageResult<ProcessOutcome> {
    let inner = &self.inner;
    let ReceivedMessage { message, transaction } = received;

    loop {
      let started_at = Utc::now();
      let error = match self.invoke_receive_pipeline(&message, receive_address).await {
        Ok(()) => {
          inner.failures.clear(&message.message_id);
          inner.transport.acknowledge(&transaction).await?;
          inner.notifications.raise_receive_completed(&ReceivePipelineCompleted {
            message_id: message.message_id.clone(),
            started_at,
            completed_at: Utc::now(),
          });
          event!(Level::DEBUG, "Message processed.");
          return Ok(ProcessOutcome::Completed);
        }
        Err(error) => error,
      };

      if error.is_outbox_contention() {
        event!(Level::WARN, %error, "Message is being handled by another delivery; releasing it.");
        inner.transport.release(&transaction).await?;
        return Ok(ProcessOutcome::Released);
      }

      let error_context = ErrorContext {
        immediate_processing_failures: inner.failures.record_failure(&message.message_id),
        delayed_deliveries_performed: message.delayed_retries(),
        error,
        message: message.clone(),
        transport_transaction: transaction.clone(),
        receive_address: receive_address.to_string(),
      };
      let action = inner.policy.classify(&error_context);

      match inner.executor.execute(&error_context, &action).await {
        Ok(ErrorHandleResult::RetryRequired) => continue,
        Ok(ErrorHandleResult::Handled) => {
          // The counter survives a delayed retry so the next delivery of the
          // same message does not restart the immediate tier.
          if !matches!(action, RecoverabilityAction::DelayedRetry { .. }) {
            inner.failures.clear(&message.message_id);
          }
          inner.transport.acknowledge(&transaction).await?;
          return Ok(ProcessOutcome::Handled(action));
        }
        Err(recoverability_error) => {
          inner.notifications.raise_critical(&CriticalError {
            message: format!(
              "Failed to execute recoverability action {} for message '{}'",
              action.name(),
              message.message_id
            ),
            error: recoverability_error.to_string(),
          });
          inner.transport.release(&transaction).await?;
          return Err(recoverability_error);
        }
      }
    }
  }

  async fn invoke_receive_pipeline(&self, message: &IncomingMessage, receive_address: &str) -> PortageResult<()> {
    let mut bag = self.inner.root_bag.child();
    bag.set(INCOMING_MESSAGE, IncomingMessageInfo::from_message(message));
    let ctx = IncomingPhysicalContext {
      message: message.clone(),
      receive_address: receive_address.to_string(),
      bag,
    };
    self.inner.receive.execute(ContextData::new(ctx)).await
  }

  /// Removes dispatched outbox records older than the configured retention.
  pub async fn cleanup_outbox(&self) -> PortageResult<usize> {
    let Some(storage) = &self.inner.outbox else {
      return Ok(0);
    };
    let cutoff = Utc::now() - self.inner.outbox_retention;
    let removed = storage.remove_dispatched_older_than(cutoff).await?;
    if removed > 0 {
      event!(Level::DEBUG, removed, "Removed dispatched outbox records.");
    }
    Ok(removed)
  }

  /// Runs every receive loop (and outbox cleanup, if enabled) until `shutdown`
  /// is cancelled or the transport closes. At most `concurrency` messages are
  /// in flight across all receive queues; when the pool is full, receiving
  /// waits.
  pub async fn run(&self, shutdown: CancellationToken) -> PortageResult<()> {
    let settings = &self.inner.settings;
    let stop = shutdown.child_token();
    let permits = Arc::new(Semaphore::new(settings.concurrency));
    let mut loops: JoinSet<PortageResult<()>> = JoinSet::new();

    event!(
      Level::INFO,
      endpoint = %settings.endpoint_name,
      concurrency = settings.concurrency,
      queues = ?self.receive_addresses(),
      "Endpoint starting."
    );

    for address in self.receive_addresses() {
      let span = tracing::info_span!("receive_loop", queue = %address);
      loops.spawn(
        self
          .clone()
          .receive_loop(address, Arc::clone(&permits), stop.clone())
          .instrument(span),
      );
    }
    if self.inner.outbox.is_some() {
      loops.spawn(self.clone().outbox_cleanup_loop(stop.clone()));
    }

    let mut first_error = None;
    while let Some(joined) = loops.join_next().await {
      let result = joined.map_err(|e| PortageError::Internal(format!("endpoint task failed: {e}")))?;
      if let Err(err) = result {
        event!(Level::ERROR, error = %err, "Endpoint task failed; stopping.");
        stop.cancel();
        first_error.get_or_insert(err);
      }
    }

    event!(Level::INFO, endpoint = %settings.endpoint_name, "Endpoint stopped.");
    first_error.map_or(Ok(()), Err)
  }

  async fn receive_loop(self, address: String, permits: Arc<Semaphore>, stop: CancellationToken) -> PortageResult<()> {
    let mut workers = JoinSet::new();

    loop {
      let permit = tokio::select! {
        _ = stop.cancelled() => break,
        permit = Arc::clone(&permits).acquire_owned() => {
          permit.map_err(|_| PortageError::Internal("worker pool closed".to_string()))?
        }
      };

      let received = tokio::select! {
        _ = stop.cancelled() => break,
        received = self.inner.transport.receive(&address) => received,
      };

      let received = match received {
        Ok(Some(received)) => received,
        Ok(None) => {
          event!(Level::INFO, "Transport closed; receive loop ending.");
          break;
        }
        Err(TransportError::QueueNotFound { queue }) => {
          return Err(PortageError::configuration(format!(
            "receive queue '{queue}' does not exist"
          )));
        }
        Err(err) => {
          event!(Level::WARN, error = %err, "Receive failed; backing off.");
          drop(permit);
          tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => continue,
          }
        }
      };

      let endpoint = self.clone();
      let queue = address.clone();
      workers.spawn(
        async move {
          let _permit = permit;
          if let Err(err) = endpoint.process(received, &queue).await {
            event!(Level::ERROR, error = %err, "Message processing failed.");
          }
        }
        .in_current_span(),
      );

      while let Some(finished) = workers.try_join_next() {
        if let Err(join_error) = finished {
          event!(Level::ERROR, error = %join_error, "Worker task panicked.");
        }
      }
    }

    let in_flight = workers.len();
    if in_flight > 0 {
      event!(Level::INFO, in_flight, "Waiting for in-flight messages.");
      let drained = tokio::time::timeout(self.inner.settings.shutdown_grace, async {
        while workers.join_next().await.is_some() {}
      })
      .await;
      if drained.is_err() {
        event!(Level::WARN, remaining = workers.len(), "Shutdown grace period elapsed; abandoning in-flight messages.");
        workers.abort_all();
        while workers.join_next().await.is_some() {}
      }
    }
    Ok(())
  }

  async fn outbox_cleanup_loop(self, stop: CancellationToken) -> PortageResult<()> {
    let mut ticker = tokio::time::interval(self.inner.settings.outbox_cleanup_interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = stop.cancelled() => break,
        _ = ticker.tick() => {
          if let Err(err) = self.cleanup_outbox().await {
            event!(Level::WARN, error = %err, "Outbox cleanup failed.");
          }
        }
      }
    }
    Ok(())
  }
}

impl fmt::Debug for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Endpoint")
      .field("settings", &self.inner.settings)
      .field("receive", &self.inner.receive)
      .field("outgoing", &self.inner.outgoing)
      .field("policy", &self.inner.policy)
      .finish()
  }
}
