pub mod contexts;
pub mod definition;
pub mod execution;
pub mod hooks;

pub use contexts::{
  IncomingLogicalContext, IncomingMessageInfo, IncomingPhysicalContext, InvokeHandlerContext, OutgoingLogicalContext,
  PendingOperations, RoutingContext,
};
pub use definition::StepRegistry;
pub use execution::{Next, Pipeline};
pub use hooks::{FnBehavior, FnConnector};
