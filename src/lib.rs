//! Aleph Ledger - Core Library
//! Crash-recoverable trading engine core: authoritative account state,
//! feed reconciliation, pre-trade risk and idempotent order lifecycle.

// Public modules
pub mod core;
pub mod engine;
pub mod exchanges;
pub mod execution;
pub mod feeds;
pub mod logging;
pub mod storage;
pub mod strategies;

// Re-exports
pub use crate::core::{Config, Error, Result};
pub use engine::{Engine, EngineHandle};
