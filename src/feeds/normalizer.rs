//! Event Normalizer - Raw user-data messages to canonical events
//!
//! Wire format is the Binance user-data stream wrapped in a sequenced
//! envelope: `{"seq": 12, "E": 1700000000000, "data": {"e": "executionReport", ...}}`.
//! Malformed messages are dropped and counted, never fatal.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::core::{ClientOrderId, OrderType, RawMessage, Side, Symbol};
use crate::feeds::events::{EventKind, FillDetails, NormalizedEvent, OrderDetails};

#[derive(Debug, Deserialize)]
struct Envelope {
    seq: u64,
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
    data: WireEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum WireEvent {
    #[serde(rename = "executionReport")]
    ExecutionReport(ExecutionReport),
    #[serde(rename = "balanceUpdate")]
    BalanceUpdate(BalanceUpdate),
    #[serde(rename = "connectionLost")]
    ConnectionLost {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "connectionRestored")]
    ConnectionRestored,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ExecutionReport {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    client_id: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "p", default)]
    price: Option<Decimal>,
    #[serde(rename = "x")]
    execution_type: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "i", default)]
    order_id: Option<u64>,
    #[serde(rename = "l", default)]
    last_quantity: Decimal,
    #[serde(rename = "L", default)]
    last_price: Decimal,
    #[serde(rename = "z", default)]
    cumulative_quantity: Decimal,
    #[serde(rename = "n", default)]
    commission: Option<Decimal>,
    #[serde(rename = "N", default)]
    commission_asset: Option<String>,
    #[serde(rename = "r", default)]
    reject_reason: Option<String>,
    #[serde(rename = "t", default)]
    trade_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BalanceUpdate {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "d")]
    delta: Decimal,
    #[serde(rename = "l", default)]
    locked_delta: Option<Decimal>,
}

/// Counters for everything the normalizer saw
#[derive(Debug, Default)]
pub struct NormalizerStats {
    received: AtomicU64,
    normalized: AtomicU64,
    malformed: AtomicU64,
    ignored: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizerCounts {
    pub received: u64,
    pub normalized: u64,
    pub malformed: u64,
    pub ignored: u64,
}

enum Outcome {
    Event(NormalizedEvent),
    Ignored(&'static str),
}

/// Stateless apart from its counters; shared by all stream workers
#[derive(Debug, Default)]
pub struct EventNormalizer {
    stats: NormalizerStats,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert one raw message. `None` means dropped (malformed or irrelevant).
    pub fn normalize(&self, raw: &RawMessage) -> Option<NormalizedEvent> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        match self.parse(raw) {
            Ok(Outcome::Event(event)) => {
                self.stats.normalized.fetch_add(1, Ordering::Relaxed);
                Some(event)
            }
            Ok(Outcome::Ignored(what)) => {
                self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                debug!("Ignoring {} on stream {}", what, raw.stream);
                None
            }
            Err(reason) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed message on {}: {}", raw.stream, reason);
                None
            }
        }
    }

    pub fn counts(&self) -> NormalizerCounts {
        NormalizerCounts {
            received: self.stats.received.load(Ordering::Relaxed),
            normalized: self.stats.normalized.load(Ordering::Relaxed),
            malformed: self.stats.malformed.load(Ordering::Relaxed),
            ignored: self.stats.ignored.load(Ordering::Relaxed),
        }
    }

    fn parse(&self, raw: &RawMessage) -> Result<Outcome, String> {
        let envelope: Envelope =
            serde_json::from_str(&raw.payload).map_err(|e| format!("bad envelope: {}", e))?;

        let kind = match envelope.data {
            WireEvent::ExecutionReport(report) => match execution_kind(report)? {
                Some(kind) => kind,
                None => return Ok(Outcome::Ignored("execution report")),
            },
            WireEvent::BalanceUpdate(update) => EventKind::BalanceChanged {
                asset: update.asset.to_uppercase(),
                free_delta: update.delta,
                locked_delta: update.locked_delta.unwrap_or(Decimal::ZERO),
            },
            WireEvent::ConnectionLost { reason } => EventKind::ConnectionLost { reason },
            WireEvent::ConnectionRestored => EventKind::ConnectionRestored,
            WireEvent::Other => return Ok(Outcome::Ignored("unhandled event type")),
        };

        Ok(Outcome::Event(NormalizedEvent {
            stream: raw.stream.clone(),
            sequence: envelope.seq,
            received_at: Utc::now(),
            exchange_time: envelope.event_time.and_then(DateTime::from_timestamp_millis),
            kind,
        }))
    }
}

fn execution_kind(report: ExecutionReport) -> Result<Option<EventKind>, String> {
    let side = Side::from_wire(&report.side).ok_or_else(|| format!("unknown side {}", report.side))?;
    let order_type = OrderType::from_wire(&report.order_type)
        .ok_or_else(|| format!("unknown order type {}", report.order_type))?;
    if report.client_id.is_empty() {
        return Err("missing client order id".into());
    }
    if report.quantity <= Decimal::ZERO {
        return Err(format!("non-positive quantity {}", report.quantity));
    }

    let order = OrderDetails {
        client_id: ClientOrderId::from(report.client_id),
        exchange_id: report.order_id.map(|id| id.to_string()),
        symbol: Symbol::new(report.symbol),
        side,
        order_type,
        quantity: report.quantity,
        price: report.price.filter(|p| !p.is_zero()),
    };

    let kind = match report.execution_type.as_str() {
        "NEW" => EventKind::OrderAcknowledged { order },
        "TRADE" => {
            if report.last_quantity <= Decimal::ZERO || report.cumulative_quantity <= Decimal::ZERO {
                return Err("trade without fill quantity".into());
            }
            let fill = FillDetails {
                last_quantity: report.last_quantity,
                last_price: report.last_price,
                cumulative_quantity: report.cumulative_quantity,
                commission: report.commission.unwrap_or(Decimal::ZERO),
                commission_asset: report.commission_asset,
                trade_id: report.trade_id.filter(|t| *t >= 0),
            };
            match report.status.as_str() {
                "PARTIALLY_FILLED" => EventKind::OrderPartiallyFilled { order, fill },
                "FILLED" => EventKind::OrderFilled { order, fill },
                other => return Err(format!("trade with status {}", other)),
            }
        }
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => EventKind::OrderCanceled { order },
        "REJECTED" => EventKind::OrderRejected {
            order,
            reason: report
                .reject_reason
                .filter(|r| r != "NONE")
                .unwrap_or_else(|| "rejected by exchange".to_string()),
        },
        _ => return Ok(None),
    };
    Ok(Some(kind))
}
