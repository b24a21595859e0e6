pub mod pool;

pub use pool::{IdentityHealth, IdentityPool, RotationStrategy, SendingIdentity};
