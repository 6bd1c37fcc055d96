//! Exchange implementations - Transports the engine can run against

pub mod paper;

pub use paper::{BALANCES_STREAM, ORDERS_STREAM, PaperConfig, PaperExchange};
