pub mod context;
pub mod context_bag;
pub mod context_data;
pub mod step;

pub use context::{BehaviorContext, ContextType};
pub use context_bag::{ContextBag, ContextKey};
pub use context_data::ContextData;
pub use step::{Behavior, RegisterStep, StageConnector};
