//! Canonical feed events
//!
//! Everything downstream of the normalizer matches on this closed set.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::{ClientOrderId, OrderType, Side, StreamId, Symbol, Timestamp};

/// Normalized event with its stream position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub stream: StreamId,
    pub sequence: u64,
    pub received_at: Timestamp,
    pub exchange_time: Option<Timestamp>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    OrderAcknowledged {
        order: OrderDetails,
    },
    OrderPartiallyFilled {
        order: OrderDetails,
        fill: FillDetails,
    },
    OrderFilled {
        order: OrderDetails,
        fill: FillDetails,
    },
    OrderCanceled {
        order: OrderDetails,
    },
    OrderRejected {
        order: OrderDetails,
        reason: String,
    },
    BalanceChanged {
        asset: String,
        free_delta: Decimal,
        locked_delta: Decimal,
    },
    ConnectionLost {
        reason: Option<String>,
    },
    ConnectionRestored,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::OrderAcknowledged { .. } => "order_acknowledged",
            EventKind::OrderPartiallyFilled { .. } => "order_partially_filled",
            EventKind::OrderFilled { .. } => "order_filled",
            EventKind::OrderCanceled { .. } => "order_canceled",
            EventKind::OrderRejected { .. } => "order_rejected",
            EventKind::BalanceChanged { .. } => "balance_changed",
            EventKind::ConnectionLost { .. } => "connection_lost",
            EventKind::ConnectionRestored => "connection_restored",
        }
    }

    /// Connectivity events are handled out of band, not through the cursor
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            EventKind::ConnectionLost { .. } | EventKind::ConnectionRestored
        )
    }

    pub fn order(&self) -> Option<&OrderDetails> {
        match self {
            EventKind::OrderAcknowledged { order }
            | EventKind::OrderPartiallyFilled { order, .. }
            | EventKind::OrderFilled { order, .. }
            | EventKind::OrderCanceled { order }
            | EventKind::OrderRejected { order, .. } => Some(order),
            _ => None,
        }
    }
}

/// Order attributes echoed by every execution report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub client_id: ClientOrderId,
    pub exchange_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillDetails {
    pub last_quantity: Decimal,
    pub last_price: Decimal,
    /// Exchange-reported cumulative filled quantity after this fill
    pub cumulative_quantity: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
    pub trade_id: Option<i64>,
}
