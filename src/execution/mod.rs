//! Execution layer - Outbound command path

pub mod backoff;
pub mod dispatcher;
pub mod rate_limit;

pub use backoff::BackoffPolicy;
pub use dispatcher::{CommandDispatcher, DispatcherStats};
pub use rate_limit::RequestLimiter;
