// portage/examples/recoverability.rs

use portage::{
  Endpoint, EndpointConfiguration, EndpointSettings, ErrorNotification, HandlerContext, InMemoryTransport,
  IncomingMessage, LogicalMessage, PortageError, ScheduledBackoff, Transport,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), PortageError> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

  info!("--- Recoverability Example ---");

  let transport = Arc::new(InMemoryTransport::with_queues(["payments", "error"]));
  let attempts = Arc::new(AtomicUsize::new(0));

  let mut settings = EndpointSettings::new("payments");
  settings.immediate_retries = 2;
  settings.delayed_retries = 2;

  let mut config = EndpointConfiguration::new(settings);
  {
    let attempts = Arc::clone(&attempts);
    config
      .use_transport(transport.clone())
      .delayed_retry_backoff(Arc::new(ScheduledBackoff::new(vec![
        Duration::from_millis(50),
        Duration::from_millis(100),
      ])?))
      .handle_fn("ChargeCard", "charge", move |_message: LogicalMessage, _ctx: HandlerContext| {
        let attempts = Arc::clone(&attempts);
        async move {
          let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
          anyhow::bail!("payment gateway unavailable (attempt {attempt})")
        }
      });
  }
  config.notifications().on_error(|notification| match notification {
    ErrorNotification::MovedToErrorQueue { .. } => warn!(message_id = notification.message_id(), "Moved to error queue."),
    other => info!(message_id = other.message_id(), ?other, "Retrying."),
  });
  let endpoint = Endpoint::create(config)?;

  let mut headers = BTreeMap::new();
  headers.insert(portage::headers::ENCLOSED_MESSAGE_TYPES.to_string(), "ChargeCard".to_string());
  transport
    .enqueue("payments", IncomingMessage::new("charge-1", headers, "{}"))?;

  // Drive deliveries by hand until the message lands in the error queue.
  while transport.sent_to("error").is_empty() {
    let Some(received) = transport.receive("payments").await? else {
      break;
    };
    let outcome = endpoint.process(received, "payments").await?;
    info!(?outcome, "Delivery finished.");
  }

  info!(attempts = attempts.load(Ordering::SeqCst), "Handler gave up.");
  Ok(())
}
