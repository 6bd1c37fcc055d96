#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aleph_ledger::core::config::Config;
use aleph_ledger::core::{ClientOrderId, Order, OrderStatus, Symbol};
use aleph_ledger::engine::{AccountState, Engine, EngineHandle};
use aleph_ledger::exchanges::{PaperConfig, PaperExchange};
use aleph_ledger::storage::CheckpointStore;
use aleph_ledger::strategies::StrategyRunner;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast timings so timeouts fire within a test
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.reconciliation.gap_timeout_ms = 100;
    config.reconciliation.gap_check_interval_ms = 10;
    config.reconciliation.max_resync_attempts = 3;
    config.reconciliation.resync_backoff_ms = 10;
    config.reconciliation.fetch_timeout_ms = 1_000;
    config.reconciliation.checkpoint_interval_ms = 0;
    config.dispatcher.requests_per_second = 1_000;
    config.dispatcher.burst = 100;
    config.dispatcher.request_timeout_ms = 1_000;
    config.dispatcher.max_attempts = 5;
    config.dispatcher.backoff_base_ms = 1;
    config.dispatcher.backoff_max_ms = 5;
    config.dispatcher.jitter = 0.0;
    config.orders.ack_timeout_ms = 200;
    config.orders.sweep_interval_ms = 20;
    config
}

/// 10000 USDT, BTCUSDT at 100, fills only on request
pub fn paper_config() -> PaperConfig {
    PaperConfig {
        quote_asset: "USDT".into(),
        balances: HashMap::from([("USDT".to_string(), dec!(10000))]),
        reference_prices: HashMap::from([(Symbol::new("BTCUSDT"), dec!(100))]),
        auto_fill: false,
        replay: false,
    }
}

pub fn paper() -> Arc<PaperExchange> {
    Arc::new(PaperExchange::new(paper_config()))
}

pub async fn start(
    config: &Config,
    paper: &Arc<PaperExchange>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
) -> EngineHandle {
    let engine = Engine::start(config, paper.clone(), checkpoints, StrategyRunner::new())
        .await
        .expect("engine start");
    engine
        .wait_until(WAIT, |s| s.last_resync.is_some() || s.version > 0)
        .await
        .expect("engine ready");
    engine
}

pub async fn wait_for_order<F>(engine: &EngineHandle, id: &str, ready: F) -> Order
where
    F: Fn(&Order) -> bool,
{
    let key = ClientOrderId::from(id);
    let state = engine
        .wait_until(WAIT, |s| s.order(&key).is_some_and(&ready))
        .await
        .unwrap_or_else(|_| panic!("order {} never reached the expected state: {:?}", id, engine.reader().order(&key)));
    state.order(&key).cloned().expect("order present")
}

pub fn status_is(status: OrderStatus) -> impl Fn(&Order) -> bool {
    move |o| o.status == status
}

pub fn quote_balance(state: &AccountState) -> (Decimal, Decimal) {
    state
        .balance("USDT")
        .map(|b| (b.free, b.locked))
        .unwrap_or_default()
}

/// Balances and positions agree with the exchange's own book
pub fn assert_matches_exchange(state: &AccountState, paper: &PaperExchange) {
    let snapshot = paper.snapshot();
    for balance in &snapshot.balances {
        assert_eq!(state.balance(&balance.asset), Some(balance), "balance {}", balance.asset);
    }
    for position in &snapshot.positions {
        let local = state.position(&position.symbol).expect("position present");
        assert_eq!(local.quantity, position.quantity);
        assert_eq!(local.average_entry_price, position.average_entry_price);
        assert_eq!(local.realized_pnl, position.realized_pnl);
    }
    for order in &snapshot.orders {
        let local = state.order(&order.client_id).expect("order present");
        assert_eq!(local.status, order.status, "status of {}", order.client_id);
        assert_eq!(local.filled_quantity, order.filled_quantity);
    }
}
