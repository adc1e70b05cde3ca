// portage/examples/basic_endpoint.rs

use portage::{
  Endpoint, EndpointConfiguration, EndpointSettings, HandlerContext, InMemoryOutboxStorage, InMemoryTransport,
  IncomingMessage, LogicalMessage, OutgoingLogicalMessage, PortageError, SendOptions,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), PortageError> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

  info!("--- Basic Endpoint Example ---");

  let transport = Arc::new(InMemoryTransport::with_queues(["orders", "billing", "error"]));

  let mut config = EndpointConfiguration::new(EndpointSettings::new("orders"));
  config
    .use_transport(transport.clone())
    .enable_outbox(Arc::new(InMemoryOutboxStorage::new()))
    .handle_fn("PlaceOrder", "place_order", |message: LogicalMessage, ctx: HandlerContext| async move {
      info!(message_id = ctx.message_id(), body = ?message.body_str(), "Placing order.");
      ctx
        .send(OutgoingLogicalMessage::new("BillOrder", message.body), SendOptions::new())
        .await?;
      Ok::<_, anyhow::Error>(())
    });
  config.routing().route_to_endpoint("BillOrder", "billing");

  let endpoint = Endpoint::create(config)?;
  info!(steps = ?endpoint.receive_pipeline().step_names(), "Receive pipeline.");

  let shutdown = CancellationToken::new();
  let runner = tokio::spawn({
    let endpoint = endpoint.clone();
    let shutdown = shutdown.clone();
    async move { endpoint.run(shutdown).await }
  });

  let mut headers = BTreeMap::new();
  headers.insert(portage::headers::ENCLOSED_MESSAGE_TYPES.to_string(), "PlaceOrder".to_string());
  transport
    .enqueue("orders", IncomingMessage::new("order-1", headers.clone(), "{\"order\":1}"))?;
  // A redelivery of the same message replays the stored outbox instead of
  // running the handler again.
  transport
    .enqueue("orders", IncomingMessage::new("order-1", headers, "{\"order\":1}"))?;

  tokio::time::sleep(Duration::from_millis(200)).await;
  shutdown.cancel();
  runner
    .await
    .map_err(|e| PortageError::Internal(format!("endpoint task failed: {e}")))??;

  info!(billing_messages = transport.sent_to("billing").len(), "Done.");
  Ok(())
}
