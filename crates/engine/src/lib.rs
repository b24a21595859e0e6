pub mod executor;
pub mod state_machine;
pub mod store;
pub mod types;

pub use executor::{CartridgeExecutor, ReplyOutcome, TickOutcome};
pub use store::InstanceStore;
pub use types::{
    AttemptResult, CartridgeDefinition, CartridgeInstance, InstanceStatus, MessageTemplate,
    SendAttempt, Stage,
};
