use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use aleph_ledger::core::config::RunMode;
use aleph_ledger::core::{Config, Symbol, Transport};
use aleph_ledger::engine::Engine;
use aleph_ledger::exchanges::{PaperConfig, PaperExchange};
use aleph_ledger::storage::{CheckpointStore, FileCheckpointStore};
use aleph_ledger::strategies::{StrategyRunner, TargetPositionStrategy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // 1. Configuration
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ALEPH_CONFIG").ok())
        .unwrap_or_else(|| "config.toml".to_string());
    let config = if PathBuf::from(&path).exists() {
        Config::load(&path).with_context(|| format!("loading {}", path))?
    } else {
        Config::default()
    };

    // 2. Logging
    let _log_guard = aleph_ledger::logging::init(&config.app)?;
    tracing::info!("Aleph Ledger starting ({:?} mode, config {})", config.app.mode, path);

    // 3. Transport
    let transport: Arc<dyn Transport> = match config.app.mode {
        RunMode::Paper => Arc::new(PaperExchange::new(PaperConfig::from(&config.exchange))),
        RunMode::Live => {
            bail!("live mode needs an exchange transport; this binary only ships the paper exchange")
        }
    };

    // 4. Checkpoints
    let checkpoints: Option<Arc<dyn CheckpointStore>> = match &config.app.data_dir {
        Some(dir) => Some(Arc::new(FileCheckpointStore::open(dir.join("state"))?)),
        None => {
            tracing::warn!("No data_dir configured, state will not survive a restart");
            None
        }
    };

    // 5. Strategies
    let mut strategies = StrategyRunner::new();
    if !config.strategy.targets.is_empty() {
        let prices: HashMap<Symbol, _> = config
            .exchange
            .reference_prices
            .iter()
            .map(|(symbol, price)| (Symbol::new(symbol.as_str()), *price))
            .collect();
        strategies.add_strategy(TargetPositionStrategy::new(config.strategy.targets.clone(), prices));
    }

    let engine = Engine::start(&config, transport, checkpoints, strategies).await?;

    // 6. Report until interrupted
    let mut report = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let state = engine.reader().snapshot();
                tracing::info!(
                    "v{} | {} open orders | {} positions | halted: {}",
                    state.version,
                    state.open_orders().count(),
                    state.positions.values().filter(|p| !p.is_flat()).count(),
                    state.halted.as_ref().map(|h| h.reason.as_str()).unwrap_or("no"),
                );
                for balance in state.balances.values() {
                    tracing::info!("  {} free {} locked {}", balance.asset, balance.free, balance.locked);
                }
                for position in state.positions.values().filter(|p| !p.is_flat()) {
                    tracing::info!(
                        "  {} {} @ {} (realized {})",
                        position.symbol,
                        position.quantity,
                        position.average_entry_price,
                        position.realized_pnl
                    );
                }
            }
        }
    }

    tracing::info!("Shutting down...");
    engine.shutdown().await;
    Ok(())
}
