//! Core traits - Transport abstraction consumed by the engine
//!
//! The raw exchange client lives outside this crate. It only has to speak
//! request/response for commands and expose one raw event stream per feed.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{
    Balance, ClientOrderId, Error, Order, OrderType, Position, Result, Side, StreamId, Symbol,
    Timestamp,
};

/// Exchange transport.
///
/// Delivery on the event streams is at-least-once and may be reordered or
/// duplicated; the engine never assumes otherwise.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Exchange name (e.g., "binance", "paper")
    fn name(&self) -> &str;

    /// Request/response path for submits, cancels and snapshot fetches
    async fn send_command(&self, command: Command) -> Result<CommandResponse>;

    /// Event streams this transport publishes
    fn streams(&self) -> Vec<StreamId>;

    /// Subscribe to one event stream
    fn events(&self, stream: &StreamId) -> Result<flume::Receiver<RawMessage>>;

    /// Whether the exchange can replay a stream from a known cursor
    fn supports_replay(&self) -> bool {
        false
    }

    /// Ask the exchange to re-deliver everything after `after` on `stream`
    async fn request_replay(&self, stream: &StreamId, after: u64) -> Result<()> {
        let _ = after;
        Err(Error::InvalidState(format!(
            "{} cannot replay stream {}",
            self.name(),
            stream
        )))
    }
}

/// Raw message as received from the wire
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub stream: StreamId,
    pub payload: String,
}

impl RawMessage {
    pub fn new(stream: impl Into<StreamId>, payload: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            payload: payload.into(),
        }
    }
}

/// Outgoing command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Submit(SubmitOrder),
    Cancel(CancelOrder),
    FetchSnapshot,
}

impl Command {
    /// Order the command belongs to, if any
    pub fn client_id(&self) -> Option<&ClientOrderId> {
        match self {
            Command::Submit(s) => Some(&s.client_id),
            Command::Cancel(c) => Some(&c.client_id),
            Command::FetchSnapshot => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Command::Submit(_) => "submit",
            Command::Cancel(_) => "cancel",
            Command::FetchSnapshot => "fetch_snapshot",
        }
    }
}

/// New-order request; `client_id` is sent as the exchange's client order id
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOrder {
    pub client_id: ClientOrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

impl From<&Order> for SubmitOrder {
    fn from(order: &Order) -> Self {
        Self {
            client_id: order.client_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price,
        }
    }
}

/// Cancel request
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOrder {
    pub client_id: ClientOrderId,
    pub exchange_id: Option<String>,
    pub symbol: Symbol,
}

/// Response from the exchange
#[derive(Debug, Clone)]
pub enum CommandResponse {
    /// Order accepted. `duplicate` is set when the exchange already knew the key.
    Accepted {
        client_id: ClientOrderId,
        exchange_id: String,
        duplicate: bool,
    },
    Canceled {
        client_id: ClientOrderId,
    },
    Snapshot(ExchangeSnapshot),
}

/// Authoritative account state fetched during resync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    pub balances: Vec<Balance>,
    /// Orders the exchange knows about (open and recently closed)
    pub orders: Vec<Order>,
    pub positions: Vec<Position>,
    /// Last sequence number included in this snapshot, per stream
    pub cursors: BTreeMap<StreamId, u64>,
    pub taken_at: Option<Timestamp>,
}
