pub mod commands;
pub mod driver;

pub use commands::{spawn_command_loop, CommandAck, CommandHandle, OperatorCommand};
pub use driver::{JobOutcome, LoopDriver};
