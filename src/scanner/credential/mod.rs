pub mod limiter;
pub mod pool;

pub use pool::{CredentialPool, CredentialStateView};
