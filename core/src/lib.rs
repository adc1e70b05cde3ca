// src/lib.rs

//! Portage: a reliable message-processing runtime.
//!
//! A message received from a transport runs through an onion pipeline of
//! named, independently-authored steps. Failures go to a recoverability policy
//! that retries immediately, retries after a growing delay, and finally moves
//! the message to an error queue with diagnostic headers. With the outbox
//! enabled, the messages a handler sends are stored atomically with its state
//! changes under the incoming message id, so a redelivered message replays
//! those messages instead of running the handler again.
//!
//! Typical setup:
//!
//! ```ignore
//! let transport = Arc::new(InMemoryTransport::with_queues(["orders", "billing", "error"]));
//! let mut config = EndpointConfiguration::new(EndpointSettings::new("orders"));
//! config
//!   .use_transport(transport.clone())
//!   .enable_outbox(Arc::new(InMemoryOutboxStorage::new()))
//!   .handle_fn("PlaceOrder", "place_order", |message, ctx| async move {
//!     ctx.send(OutgoingLogicalMessage::new("BillOrder", message.body), SendOptions::new()).await?;
//!     Ok(())
//!   });
//! config.routing().route_to_endpoint("BillOrder", "billing");
//!
//! let endpoint = Endpoint::create(config)?;
//! endpoint.run(CancellationToken::new()).await?;
//! ```

pub mod config;
pub mod core;
pub mod endpoint;
pub mod error;
pub mod headers;
pub mod notifications;
pub mod outbox;
pub mod pipeline;
pub mod receive;
pub mod recoverability;
pub mod registry;
pub mod routing;
pub mod session;
pub mod transport;

// --- Re-exports for the Public API ---

pub use crate::config::EndpointSettings;
pub use crate::core::{Behavior, BehaviorContext, ContextBag, ContextData, ContextKey, ContextType, RegisterStep, StageConnector};
pub use crate::endpoint::{Endpoint, EndpointConfiguration, ProcessOutcome};
pub use crate::error::{PortageError, PortageResult};
pub use crate::notifications::{CriticalError, ErrorNotification, Notifications, ReceivePipelineCompleted};
pub use crate::outbox::{
  enlisted, enlisted_write, EnlistedAction, InMemoryOutboxStorage, OutboxMessage, OutboxRecord, OutboxStorage,
  OutboxTransaction, OUTBOX_TRANSACTION,
};
pub use crate::pipeline::{
  IncomingLogicalContext, IncomingPhysicalContext, InvokeHandlerContext, Next, OutgoingLogicalContext, Pipeline,
  RoutingContext, StepRegistry,
};
pub use crate::receive::{handler_fn, EnclosedTypeDeserializer, HandlerContext, LogicalMessage, MessageDeserializer, MessageHandler};
pub use crate::recoverability::{
  BackoffPolicy, ErrorContext, ErrorHandleResult, ExponentialBackoff, LinearBackoff, RecoverabilityAction,
  RecoverabilityConfig, RecoverabilityPolicy, ScheduledBackoff, UnrecoverableFailure,
};
pub use crate::registry::HandlerRegistry;
pub use crate::routing::RoutingTable;
pub use crate::session::{MessageSession, OutgoingLogicalMessage, SendOptions};
pub use crate::transport::{
  InMemoryTransport, IncomingMessage, OutgoingMessage, ReceivedMessage, Transport, TransportError, TransportOperation,
  TransportTransaction,
};
