//! Core types - Strong typing for safety

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock timestamp
pub type Timestamp = DateTime<Utc>;

/// Tradeable symbol (e.g., "BTCUSDT")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol::new(s)
    }
}

/// Identifier of one exchange event stream (e.g. "orders", "balances")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        StreamId::new(s)
    }
}

/// Client-assigned idempotency key.
///
/// Generated once per logical trading intent and carried unchanged on every
/// retry, so the exchange and the lifecycle manager can recognise re-sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Fresh random key
    pub fn generate() -> Self {
        Self(format!("alx-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientOrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Parse exchange wire notation ("BUY" / "SELL")
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

impl OrderType {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" | "LIMIT_MAKER" => Some(OrderType::Limit),
            "STOP_LOSS" | "STOP_LOSS_LIMIT" => Some(OrderType::StopLoss),
            "TAKE_PROFIT" | "TAKE_PROFIT_LIMIT" => Some(OrderType::TakeProfit),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::StopLoss => write!(f, "STOP_LOSS"),
            OrderType::TakeProfit => write!(f, "TAKE_PROFIT"),
        }
    }
}

/// Order status.
///
/// ```text
/// Pending -> Submitted -> Acknowledged -> PartiallyFilled -> Filled
///                 \              \               \-> Canceled
///                  \-> Rejected   \-> Canceled
/// any non-terminal -> Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Resting at (or on its way to) the exchange
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Submitted => 1,
            OrderStatus::Acknowledged => 2,
            OrderStatus::PartiallyFilled => 3,
            _ => 4,
        }
    }

    /// Monotonic transition check. Re-entering `PartiallyFilled` is allowed
    /// (one transition per fill); every other self-transition is a no-op.
    ///
    /// Exchange evidence may skip steps: a fill or cancel for an order not yet
    /// acknowledged implies the acknowledgment.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            OrderStatus::Pending => false,
            OrderStatus::Submitted => *self == OrderStatus::Pending,
            OrderStatus::Acknowledged => self.rank() <= 1,
            OrderStatus::PartiallyFilled => true,
            OrderStatus::Filled => true,
            OrderStatus::Canceled => true,
            OrderStatus::Rejected => self.rank() <= 1,
            OrderStatus::Expired => true,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Acknowledged => "ACKNOWLEDGED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// A strategy's proposal to trade. Untrusted until the risk gate permits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_id: ClientOrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Limit price
    pub price: Option<Decimal>,
    /// Price used for notional checks when the order has no limit price
    pub reference_price: Option<Decimal>,
}

impl OrderIntent {
    pub fn market(symbol: impl Into<Symbol>, side: Side, quantity: Decimal) -> Self {
        Self {
            client_id: ClientOrderId::generate(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            reference_price: None,
        }
    }

    pub fn limit(symbol: impl Into<Symbol>, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            client_id: ClientOrderId::generate(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            reference_price: None,
        }
    }

    /// Replace the generated key, e.g. with one derived deterministically by a strategy
    pub fn with_client_id(mut self, client_id: impl Into<ClientOrderId>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_reference_price(mut self, price: Decimal) -> Self {
        self.reference_price = Some(price);
        self
    }

    /// Best available price for notional valuation
    pub fn valuation_price(&self) -> Option<Decimal> {
        self.price.or(self.reference_price)
    }

    /// Quantity with the side's sign applied
    pub fn signed_quantity(&self) -> Decimal {
        self.quantity * self.side.sign()
    }
}

/// Order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_id: ClientOrderId,
    pub exchange_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub reject_reason: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Order {
    /// Local record for an intent that has not been sent yet
    pub fn pending(intent: &OrderIntent, now: Timestamp) -> Self {
        Self {
            client_id: intent.client_id.clone(),
            exchange_id: None,
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.order_type,
            quantity: intent.quantity,
            price: intent.price,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            status: OrderStatus::Pending,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    /// Fold a fill into filled quantity and the quantity-weighted average price.
    /// Returns the quantity actually applied (capped at what remains).
    pub fn record_fill(&mut self, quantity: Decimal, price: Decimal) -> Decimal {
        let applied = quantity.min(self.remaining());
        if applied <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let previous_notional = self.average_fill_price.unwrap_or(Decimal::ZERO) * self.filled_quantity;
        self.filled_quantity += applied;
        self.average_fill_price = Some((previous_notional + applied * price) / self.filled_quantity);
        applied
    }
}

/// Net position in one symbol, derived from fills only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    /// Signed: positive long, negative short
    pub quantity: Decimal,
    pub average_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub updated_at: Timestamp,
}

impl Position {
    pub fn flat(symbol: Symbol, now: Timestamp) -> Self {
        Self {
            symbol,
            quantity: Decimal::ZERO,
            average_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            updated_at: now,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Absolute value at entry price
    pub fn notional(&self) -> Decimal {
        self.quantity.abs() * self.average_entry_price
    }

    /// Apply one fill. Adding to the position re-weights the entry price,
    /// reducing it realizes PnL, flipping it restarts at the fill price.
    pub fn apply_fill(&mut self, side: Side, quantity: Decimal, price: Decimal, at: Timestamp) {
        if quantity <= Decimal::ZERO {
            return;
        }
        let signed = quantity * side.sign();
        let current = self.quantity;

        if current.is_zero() || current.is_sign_positive() == signed.is_sign_positive() {
            let held = current.abs();
            self.average_entry_price =
                (held * self.average_entry_price + quantity * price) / (held + quantity);
            self.quantity = current + signed;
        } else {
            let closing = quantity.min(current.abs());
            let direction = if current.is_sign_positive() {
                Decimal::ONE
            } else {
                Decimal::NEGATIVE_ONE
            };
            self.realized_pnl += closing * (price - self.average_entry_price) * direction;
            self.quantity = current + signed;
            if self.quantity.is_zero() {
                self.average_entry_price = Decimal::ZERO;
            } else if self.quantity.is_sign_positive() != current.is_sign_positive() {
                self.average_entry_price = price;
            }
        }
        self.updated_at = at;
    }
}

/// Account balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn new(asset: impl Into<String>, free: Decimal, locked: Decimal) -> Self {
        Self {
            asset: asset.into(),
            free,
            locked,
        }
    }

    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}
