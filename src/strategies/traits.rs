//! Strategy traits and runner

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::OrderIntent;
use crate::engine::order::{OrderLifecycleManager, SubmitReceipt};
use crate::engine::state::AccountState;

/// Decision function over a consistent account snapshot.
///
/// Output is a proposal only; every intent still goes through the risk gate.
/// Implementations should derive idempotency keys deterministically from the
/// state they saw so a repeated decision does not double-trade.
pub trait Strategy: Send + Sync {
    /// Strategy name
    fn name(&self) -> &str;

    fn decide(&self, state: &AccountState) -> Vec<OrderIntent>;
}

/// Strategy runner - invokes strategies whenever the account state moved
pub struct StrategyRunner {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyRunner {
    pub fn new() -> Self {
        Self { strategies: vec![] }
    }

    pub fn add_strategy(&mut self, strategy: impl Strategy + 'static) {
        self.strategies.push(Box::new(strategy));
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Collect intents from every strategy
    pub fn decide(&self, state: &AccountState) -> Vec<OrderIntent> {
        self.strategies
            .iter()
            .flat_map(|strategy| {
                let intents = strategy.decide(state);
                if !intents.is_empty() {
                    debug!("{} proposed {} intents at v{}", strategy.name(), intents.len(), state.version);
                }
                intents
            })
            .collect()
    }

    /// Decide and submit once. Returns the receipts.
    pub async fn step(&self, manager: &OrderLifecycleManager) -> Vec<SubmitReceipt> {
        let state = manager.reader().snapshot();
        if state.is_halted() {
            return vec![];
        }
        let mut receipts = Vec::new();
        for intent in self.decide(&state) {
            match manager.submit(intent).await {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => warn!("Submit failed: {}", e),
            }
        }
        receipts
    }

    /// Run on a fixed schedule, skipping ticks where the state did not change
    pub async fn run(self, manager: Arc<OrderLifecycleManager>, interval: Duration) {
        info!("Strategy runner started with {} strategies", self.strategies.len());
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_version = None;
        loop {
            tick.tick().await;
            let version = manager.reader().version();
            if last_version == Some(version) {
                continue;
            }
            last_version = Some(version);
            self.step(&manager).await;
        }
    }
}

impl Default for StrategyRunner {
    fn default() -> Self {
        Self::new()
    }
}
