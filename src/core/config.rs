//! Configuration - Type-safe, validated config
//!
//! Loads from `config.toml`. Every section has defaults so a partial file is
//! enough; credentials are never read from here.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{Error, Result, Symbol};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub exchange: ExchangeConfig,
    pub risk: RiskLimits,
    pub reconciliation: ReconcileConfig,
    pub dispatcher: DispatcherConfig,
    pub orders: LifecycleConfig,
    pub strategy: StrategyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Run mode: paper or live
    pub mode: RunMode,

    /// Log level used when RUST_LOG is unset
    pub log_level: String,

    /// Checkpoints and log files live here
    pub data_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Paper,
            log_level: "info".to_string(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Paper,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Exchange ID (binance)
    pub id: String,

    /// Use testnet
    pub testnet: bool,

    /// Symbols to monitor
    pub symbols: Vec<String>,

    /// Quote asset used for notional valuation
    pub quote_asset: String,

    /// Paper mode: starting balances per asset
    pub paper_balances: HashMap<String, Decimal>,

    /// Paper mode: fill price for market orders per symbol
    pub reference_prices: HashMap<String, Decimal>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            id: "binance".to_string(),
            testnet: true,
            symbols: ["BTCUSDT", "ETHUSDT", "BNBUSDT", "ADAUSDT", "XRPUSDT", "SOLUSDT", "DOTUSDT", "LINKUSDT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            quote_asset: "USDT".to_string(),
            paper_balances: HashMap::from([("USDT".to_string(), Decimal::from(10_000))]),
            reference_prices: HashMap::new(),
        }
    }
}

/// Risk limits - read-only to the risk gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Max absolute net position per symbol (units)
    pub max_position: Decimal,

    /// Per-symbol overrides of `max_position`
    pub symbol_max_position: HashMap<Symbol, Decimal>,

    /// Ceiling on aggregate notional exposure across symbols (quote asset)
    pub max_notional_exposure: Decimal,

    /// Max order submissions per window, whole account
    pub max_orders_per_window: usize,

    /// Max order submissions per window, one symbol
    pub max_symbol_orders_per_window: usize,

    /// Rolling window length
    pub rate_window_ms: u64,

    /// Count outstanding open-order quantity towards the position limit
    pub count_open_orders: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position: Decimal::from(10),
            symbol_max_position: HashMap::new(),
            max_notional_exposure: Decimal::from(100_000),
            max_orders_per_window: 10,
            max_symbol_orders_per_window: 5,
            rate_window_ms: 1_000,
            count_open_orders: false,
        }
    }
}

impl RiskLimits {
    pub fn position_limit(&self, symbol: &Symbol) -> Decimal {
        self.symbol_max_position
            .get(symbol)
            .copied()
            .unwrap_or(self.max_position)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}

/// Reconciliation loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// How long a gap may stay open before forcing a resync
    pub gap_timeout_ms: u64,

    /// How often gapped streams are inspected
    pub gap_check_interval_ms: u64,

    /// Resync attempts before halting trading
    pub max_resync_attempts: u32,

    /// Delay between resync attempts
    pub resync_backoff_ms: u64,

    /// Timeout on the snapshot fetch
    pub fetch_timeout_ms: u64,

    /// Periodic checkpoint interval (0 disables)
    pub checkpoint_interval_ms: u64,

    /// Recent events kept for reporting
    pub recent_event_capacity: usize,

    /// Inbox capacity of the single writer
    pub inbox_capacity: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            gap_timeout_ms: 2_000,
            gap_check_interval_ms: 100,
            max_resync_attempts: 5,
            resync_backoff_ms: 5_000,
            fetch_timeout_ms: 30_000,
            checkpoint_interval_ms: 30_000,
            recent_event_capacity: 256,
            inbox_capacity: 4_096,
        }
    }
}

impl ReconcileConfig {
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    pub fn gap_check_interval(&self) -> Duration {
        Duration::from_millis(self.gap_check_interval_ms.max(1))
    }

    pub fn resync_backoff(&self) -> Duration {
        Duration::from_millis(self.resync_backoff_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_ms > 0).then(|| Duration::from_millis(self.checkpoint_interval_ms))
    }
}

/// Command dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Sustained command rate (Binance: 1200 req/min)
    pub requests_per_second: u32,

    /// Token bucket depth
    pub burst: u32,

    /// Timeout waiting for one transport response
    pub request_timeout_ms: u64,

    /// Attempts per command, first send included
    pub max_attempts: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,

    /// Fraction of each delay randomised (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 20,
            burst: 10,
            request_timeout_ms: 30_000,
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl DispatcherConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Order lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Re-send a submitted order with the same key after this long without an ack
    pub ack_timeout_ms: u64,

    /// Re-sends before escalating to a resync
    pub max_resends: u32,

    /// Non-terminal orders older than this are expired (0 disables)
    pub max_lifetime_ms: u64,

    /// Sweep cadence for ack timeouts and expiry
    pub sweep_interval_ms: u64,

    /// Capacity of the pending queue
    pub queue_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            max_resends: 3,
            max_lifetime_ms: 24 * 60 * 60 * 1_000,
            sweep_interval_ms: 500,
            queue_capacity: 1_024,
        }
    }
}

impl LifecycleConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        (self.max_lifetime_ms > 0).then(|| Duration::from_millis(self.max_lifetime_ms))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// How often the decision function is consulted
    pub decision_interval_ms: u64,

    /// Target-position strategy: desired net position per symbol
    pub targets: HashMap<Symbol, Decimal>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            decision_interval_ms: 1_000,
            targets: HashMap::new(),
        }
    }
}

impl StrategyConfig {
    pub fn decision_interval(&self) -> Duration {
        Duration::from_millis(self.decision_interval_ms.max(1))
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.requests_per_second == 0 || self.dispatcher.burst == 0 {
            return Err(Error::Config("dispatcher rate and burst must be positive".into()));
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(Error::Config("dispatcher.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.dispatcher.jitter) {
            return Err(Error::Config("dispatcher.jitter must be within 0.0..=1.0".into()));
        }
        if self.risk.max_position < Decimal::ZERO || self.risk.max_notional_exposure < Decimal::ZERO {
            return Err(Error::Config("risk limits must be non-negative".into()));
        }
        Ok(())
    }
}
