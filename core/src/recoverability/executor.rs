// portage/src/recoverability/executor.rs
use super::{ErrorContext, ErrorHandleResult, RecoverabilityAction};
use crate::error::{PortageError, PortageResult};
use crate::headers;
use crate::notifications::{ErrorNotification, Notifications};
use crate::routing::MessageDispatcher;
use crate::transport::{OutgoingMessage, Transport, TransportOperation};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, instrument, Level};

/// Carries out a classified action against the transport and raises the
/// matching error notification.
pub struct RecoverabilityExecutor {
  transport: Arc<dyn Transport>,
  dispatcher: Arc<MessageDispatcher>,
  notifications: Arc<Notifications>,
}

impl RecoverabilityExecutor {
  pub fn new(transport: Arc<dyn Transport>, dispatcher: Arc<MessageDispatcher>, notifications: Arc<Notifications>) -> Self {
    RecoverabilityExecutor {
      transport,
      dispatcher,
      notifications,
    }
  }

  #[instrument(
    name = "RecoverabilityExecutor::execute",
    skip_all,
    fields(message_id = %ctx.message.message_id, action = action.name()),
    err(Display)
  )]
  pub async fn execute(&self, ctx: &ErrorContext, action: &RecoverabilityAction) -> PortageResult<ErrorHandleResult> {
    let message_id = ctx.message.message_id.clone();
    match action {
      RecoverabilityAction::ImmediateRetry => {
        event!(
          Level::WARN,
          attempt = ctx.immediate_processing_failures,
          error = %ctx.error,
          "Immediate retry scheduled."
        );
        self.notifications.raise_error(&ErrorNotification::ImmediateRetry {
          message_id,
          attempt: ctx.immediate_processing_failures,
          error: ctx.error.to_string(),
        });
        Ok(ErrorHandleResult::RetryRequired)
      }
      RecoverabilityAction::DelayedRetry { delay, destination } => {
        self.defer(ctx, *delay, destination).await?;
        let attempt = ctx.delayed_deliveries_performed.saturating_add(1);
        event!(Level::WARN, attempt, ?delay, error = %ctx.error, "Delayed retry scheduled.");
        self.notifications.raise_error(&ErrorNotification::DelayedRetry {
          message_id,
          attempt,
          delay: *delay,
          error: ctx.error.to_string(),
        });
        Ok(ErrorHandleResult::Handled)
      }
      RecoverabilityAction::MoveToError { error_queue, headers: added } => {
        let mut outgoing_headers = ctx.message.headers.clone();
        outgoing_headers.extend(added.iter().map(|(k, v)| (k.clone(), v.clone())));
        outgoing_headers.insert(headers::TIME_OF_FAILURE.to_string(), headers::format_timestamp(Utc::now()));

        // The body goes out exactly as it arrived.
        let operation = TransportOperation::new(
          OutgoingMessage::new(message_id.clone(), outgoing_headers, ctx.message.body.clone()),
          error_queue.clone(),
        );
        self.dispatcher.dispatch(std::slice::from_ref(&operation)).await?;

        event!(Level::ERROR, %error_queue, error = %ctx.error, "Moved message to the error queue.");
        self.notifications.raise_error(&ErrorNotification::MovedToErrorQueue {
          message_id,
          error_queue: error_queue.clone(),
          error: ctx.error.to_string(),
        });
        Ok(ErrorHandleResult::Handled)
      }
      RecoverabilityAction::Discard { reason } => {
        event!(Level::INFO, %reason, "Discarding message.");
        self.notifications.raise_error(&ErrorNotification::Discarded {
          message_id,
          reason: reason.clone(),
        });
        Ok(ErrorHandleResult::Handled)
      }
    }
  }

  async fn defer(&self, ctx: &ErrorContext, delay: Duration, destination: &str) -> PortageResult<()> {
    let mut retry_headers = ctx.message.headers.clone();
    retry_headers.insert(
      headers::DELAYED_RETRIES.to_string(),
      ctx.delayed_deliveries_performed.saturating_add(1).to_string(),
    );
    retry_headers.insert(
      headers::DELAYED_RETRIES_TIMESTAMP.to_string(),
      headers::format_timestamp(Utc::now()),
    );

    let operation = TransportOperation::new(
      OutgoingMessage::new(ctx.message.message_id.clone(), retry_headers, ctx.message.body.clone()),
      destination,
    );
    self
      .transport
      .defer(&operation, delay)
      .await
      .map_err(|source| PortageError::Transport { source })
  }
}
