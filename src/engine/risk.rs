//! Risk Gate - Hard limits checked before any order leaves the process.
//!
//! The gate is a pure function of the current state snapshot, the intent and
//! recent submission history. It never mutates state and never blocks.

use chrono::Duration as ChronoDuration;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

use crate::core::config::RiskLimits;
use crate::core::{OrderIntent, Symbol, Timestamp};
use crate::engine::state::AccountState;

/// Why an intent was refused
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("position {current} + order {delta} exceeds limit {limit}")]
    PositionLimit {
        current: Decimal,
        delta: Decimal,
        limit: Decimal,
    },

    #[error("projected notional {projected} exceeds limit {limit}")]
    NotionalLimit { projected: Decimal, limit: Decimal },

    #[error("no price available to value order on {0}")]
    MissingPrice(Symbol),

    #[error("{scope} submission rate {count} per {window:?} reached")]
    RateLimit {
        scope: String,
        count: usize,
        window: Duration,
    },

    #[error("trading halted: {0}")]
    TradingHalted(String),

    #[error("non-positive quantity {0}")]
    InvalidQuantity(Decimal),
}

/// Gate verdict
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Permit,
    Reject(RejectReason),
}

impl RiskDecision {
    pub fn is_permit(&self) -> bool {
        matches!(self, RiskDecision::Permit)
    }
}

/// Sliding record of recent submissions, oldest first
#[derive(Debug, Default, Clone)]
pub struct SubmissionWindow {
    entries: VecDeque<(Symbol, Timestamp)>,
}

impl SubmissionWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, symbol: Symbol, at: Timestamp) {
        self.entries.push_back((symbol, at));
    }

    /// Drop entries older than `window` relative to `now`
    pub fn prune(&mut self, window: Duration, now: Timestamp) {
        let cutoff = now - to_chrono(window);
        while self.entries.front().is_some_and(|(_, at)| *at <= cutoff) {
            self.entries.pop_front();
        }
    }

    /// Submissions inside the window, optionally for one symbol only
    pub fn count(&self, symbol: Option<&Symbol>, window: Duration, now: Timestamp) -> usize {
        let cutoff = now - to_chrono(window);
        self.entries
            .iter()
            .filter(|(s, at)| *at > cutoff && symbol.is_none_or(|wanted| s == wanted))
            .count()
    }
}

fn to_chrono(window: Duration) -> ChronoDuration {
    ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX)
}

/// Pre-trade risk gate
#[derive(Debug, Clone)]
pub struct RiskGate {
    limits: RiskLimits,
}

impl RiskGate {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Check an intent against position, notional and rate limits, in that order.
    /// The first failing check is the reported reason.
    pub fn check(
        &self,
        state: &AccountState,
        intent: &OrderIntent,
        window: &SubmissionWindow,
        now: Timestamp,
    ) -> RiskDecision {
        match self.evaluate(state, intent, window, now) {
            Ok(()) => RiskDecision::Permit,
            Err(reason) => RiskDecision::Reject(reason),
        }
    }

    fn evaluate(
        &self,
        state: &AccountState,
        intent: &OrderIntent,
        window: &SubmissionWindow,
        now: Timestamp,
    ) -> Result<(), RejectReason> {
        if let Some(halt) = &state.halted {
            return Err(RejectReason::TradingHalted(halt.reason.clone()));
        }
        if intent.quantity <= Decimal::ZERO {
            return Err(RejectReason::InvalidQuantity(intent.quantity));
        }

        // 1. Position limit
        let mut current = state.net_position(&intent.symbol);
        if self.limits.count_open_orders {
            current += state.open_order_exposure(&intent.symbol);
        }
        let delta = intent.signed_quantity();
        let limit = self.limits.position_limit(&intent.symbol);
        if (current + delta).abs() > limit {
            return Err(RejectReason::PositionLimit {
                current,
                delta,
                limit,
            });
        }

        // 2. Notional exposure
        let price = intent
            .valuation_price()
            .ok_or_else(|| RejectReason::MissingPrice(intent.symbol.clone()))?;
        let others: Decimal = state
            .positions
            .values()
            .filter(|p| p.symbol != intent.symbol)
            .map(|p| p.notional())
            .sum();
        let projected = others + (state.net_position(&intent.symbol) + delta).abs() * price;
        if projected > self.limits.max_notional_exposure {
            return Err(RejectReason::NotionalLimit {
                projected,
                limit: self.limits.max_notional_exposure,
            });
        }

        // 3. Submission rate, account-wide then per symbol
        let period = self.limits.rate_window();
        let account = window.count(None, period, now);
        if account >= self.limits.max_orders_per_window {
            return Err(RejectReason::RateLimit {
                scope: "account".into(),
                count: account,
                window: period,
            });
        }
        let symbol = window.count(Some(&intent.symbol), period, now);
        if symbol >= self.limits.max_symbol_orders_per_window {
            return Err(RejectReason::RateLimit {
                scope: intent.symbol.to_string(),
                count: symbol,
                window: period,
            });
        }

        Ok(())
    }
}
