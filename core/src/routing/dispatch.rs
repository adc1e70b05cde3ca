// portage/src/routing/dispatch.rs
use crate::error::{PortageError, PortageResult};
use crate::transport::{Transport, TransportError, TransportOperation};
use std::fmt;
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// Hands transport operations to the transport, one at a time, in order.
#[derive(Clone)]
pub struct MessageDispatcher {
  transport: Arc<dyn Transport>,
}

impl MessageDispatcher {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    MessageDispatcher { transport }
  }

  #[instrument(name = "MessageDispatcher::dispatch", skip_all, fields(count = operations.len()), err(Display))]
  pub async fn dispatch(&self, operations: &[TransportOperation]) -> PortageResult<()> {
    for operation in operations {
      event!(
        Level::TRACE,
        destination = %operation.destination,
        operation_id = operation.operation_id(),
        "Sending transport operation."
      );
      self.transport.send(operation).await.map_err(|err| describe(err, operation))?;
    }
    Ok(())
  }
}

// A missing queue almost always means a routing mistake; name the message type.
fn describe(err: TransportError, operation: &TransportOperation) -> PortageError {
  match err {
    TransportError::QueueNotFound { queue } => PortageError::QueueNotFound {
      queue,
      message_type: operation.message.message_type().unwrap_or("unknown").to_string(),
    },
    other => PortageError::Transport { source: other },
  }
}

impl fmt::Debug for MessageDispatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MessageDispatcher").finish_non_exhaustive()
  }
}
