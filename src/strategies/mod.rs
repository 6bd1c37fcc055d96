//! Trading strategies - Decision functions over account state

pub mod target;
pub mod traits;

pub use target::TargetPositionStrategy;
pub use traits::{Strategy, StrategyRunner};
