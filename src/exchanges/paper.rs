//! Paper exchange - In-memory venue speaking the Binance user-data format
//!
//! Keeps its own book of balances, orders and positions, publishes sequenced
//! execution reports on an "orders" stream and balance deltas on a "balances"
//! stream, and answers snapshot requests from the same book, so local state can
//! be checked against it. Faults (command errors, dropped or duplicated
//! deliveries, disconnects) can be injected for testing.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info};

use crate::core::config::ExchangeConfig;
use crate::core::{
    Balance, CancelOrder, ClientOrderId, Command, CommandResponse, Error, ExchangeSnapshot, Order,
    OrderStatus, OrderType, Position, RawMessage, Result, Side, StreamId, SubmitOrder, Symbol,
    Transport,
};

pub const ORDERS_STREAM: &str = "orders";
pub const BALANCES_STREAM: &str = "balances";

/// Messages kept per stream for replay
pub const HISTORY_CAPACITY: usize = 10_000;

/// Paper exchange settings
#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub quote_asset: String,
    pub balances: HashMap<String, Decimal>,
    /// Fill price for market orders
    pub reference_prices: HashMap<Symbol, Decimal>,
    /// Fill limit orders at their limit price as soon as they are accepted
    pub auto_fill: bool,
    pub replay: bool,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self::from(&ExchangeConfig::default())
    }
}

impl From<&ExchangeConfig> for PaperConfig {
    fn from(config: &ExchangeConfig) -> Self {
        Self {
            quote_asset: config.quote_asset.to_uppercase(),
            balances: config
                .paper_balances
                .iter()
                .map(|(asset, amount)| (asset.to_uppercase(), *amount))
                .collect(),
            reference_prices: config
                .reference_prices
                .iter()
                .map(|(symbol, price)| (Symbol::new(symbol.as_str()), *price))
                .collect(),
            auto_fill: true,
            replay: false,
        }
    }
}

struct Stream {
    sequence: u64,
    tx: flume::Sender<RawMessage>,
    rx: flume::Receiver<RawMessage>,
    history: VecDeque<(u64, String)>,
    drop_next: u32,
}

impl Stream {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            sequence: 0,
            tx,
            rx,
            history: VecDeque::new(),
            drop_next: 0,
        }
    }
}

#[derive(Default)]
struct Faults {
    command_errors: VecDeque<Error>,
    failing_snapshots: u32,
    duplicate_delivery: bool,
    latency: Option<Duration>,
}

struct Book {
    balances: BTreeMap<String, Balance>,
    orders: HashMap<ClientOrderId, Order>,
    /// Price each buy reserved quote balance at
    reserved_at: HashMap<ClientOrderId, Decimal>,
    positions: BTreeMap<Symbol, Position>,
    streams: BTreeMap<StreamId, Stream>,
    next_order_id: u64,
    next_trade_id: i64,
    connected: bool,
    accepted: u64,
}

/// In-memory exchange implementing `Transport`
pub struct PaperExchange {
    config: PaperConfig,
    book: Mutex<Book>,
    faults: Mutex<Faults>,
    reference_prices: Mutex<HashMap<Symbol, Decimal>>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        let balances = config
            .balances
            .iter()
            .map(|(asset, free)| (asset.clone(), Balance::new(asset.clone(), *free, Decimal::ZERO)))
            .collect();
        let streams = [ORDERS_STREAM, BALANCES_STREAM]
            .into_iter()
            .map(|s| (StreamId::new(s), Stream::new()))
            .collect();
        Self {
            reference_prices: Mutex::new(config.reference_prices.clone()),
            book: Mutex::new(Book {
                balances,
                orders: HashMap::new(),
                reserved_at: HashMap::new(),
                positions: BTreeMap::new(),
                streams,
                next_order_id: 1,
                next_trade_id: 1,
                connected: true,
                accepted: 0,
            }),
            faults: Mutex::new(Faults::default()),
            config,
        }
    }

    pub fn with_replay(mut self, replay: bool) -> Self {
        self.config.replay = replay;
        self
    }

    pub fn with_auto_fill(mut self, auto_fill: bool) -> Self {
        self.config.auto_fill = auto_fill;
        self
    }

    pub fn set_reference_price(&self, symbol: impl Into<Symbol>, price: Decimal) {
        self.reference_prices.lock().insert(symbol.into(), price);
    }

    /// Fail the next submit/cancel commands with these errors, in order
    pub fn push_command_errors(&self, errors: impl IntoIterator<Item = Error>) {
        self.faults.lock().command_errors.extend(errors);
    }

    /// Fail the next `n` snapshot requests
    pub fn fail_snapshots(&self, n: u32) {
        self.faults.lock().failing_snapshots = n;
    }

    /// Sequence but do not deliver the next `n` messages on `stream`
    pub fn drop_next(&self, stream: &str, n: u32) {
        if let Some(s) = self.book.lock().streams.get_mut(&StreamId::new(stream)) {
            s.drop_next = n;
        }
    }

    /// Deliver every message twice
    pub fn set_duplicate_delivery(&self, on: bool) {
        self.faults.lock().duplicate_delivery = on;
    }

    /// Delay every command response
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    /// Drop the user-data connection. Commands fail until `reconnect`.
    pub fn disconnect(&self, reason: &str) {
        let mut book = self.book.lock();
        book.connected = false;
        let data = json!({"e": "connectionLost", "reason": reason});
        Self::emit_out_of_band(&mut book, &data);
        info!("Paper exchange disconnected: {}", reason);
    }

    pub fn reconnect(&self) {
        let mut book = self.book.lock();
        book.connected = true;
        Self::emit_out_of_band(&mut book, &json!({"e": "connectionRestored"}));
        info!("Paper exchange reconnected");
    }

    /// Push an arbitrary payload onto a stream, bypassing sequencing
    pub fn inject_raw(&self, stream: &str, payload: &str) {
        let book = self.book.lock();
        if let Some(s) = book.streams.get(&StreamId::new(stream)) {
            let _ = s.tx.send(RawMessage::new(stream, payload));
        }
    }

    /// Orders accepted (duplicates excluded)
    pub fn accepted_orders(&self) -> u64 {
        self.book.lock().accepted
    }

    pub fn order(&self, client_id: &ClientOrderId) -> Option<Order> {
        self.book.lock().orders.get(client_id).cloned()
    }

    /// The exchange's own view, as a resync would see it
    pub fn snapshot(&self) -> ExchangeSnapshot {
        let book = self.book.lock();
        ExchangeSnapshot {
            balances: book.balances.values().cloned().collect(),
            orders: book.orders.values().cloned().collect(),
            positions: book.positions.values().cloned().collect(),
            cursors: book
                .streams
                .iter()
                .map(|(id, s)| (id.clone(), s.sequence))
                .collect(),
            taken_at: Some(Utc::now()),
        }
    }

    /// Fill part or all of a resting order
    pub fn fill(&self, client_id: &ClientOrderId, quantity: Decimal, price: Decimal) -> Result<()> {
        let duplicate = self.faults.lock().duplicate_delivery;
        let mut book = self.book.lock();
        self.fill_locked(&mut book, client_id, quantity, price, duplicate)
    }

    fn submit(&self, request: SubmitOrder) -> Result<CommandResponse> {
        let duplicate_delivery = self.faults.lock().duplicate_delivery;
        let mut book = self.book.lock();

        if let Some(existing) = book.orders.get(&request.client_id) {
            debug!("Paper exchange saw {} again", request.client_id);
            return Ok(CommandResponse::Accepted {
                client_id: request.client_id,
                exchange_id: existing.exchange_id.clone().unwrap_or_default(),
                duplicate: true,
            });
        }
        if request.quantity <= Decimal::ZERO {
            return Err(Error::InvalidOrderParameters(format!(
                "quantity {} must be positive",
                request.quantity
            )));
        }
        let price = match request.order_type {
            OrderType::Market => self
                .reference_prices
                .lock()
                .get(&request.symbol)
                .copied()
                .ok_or_else(|| {
                    Error::InvalidOrderParameters(format!("no market price for {}", request.symbol))
                })?,
            _ => request
                .price
                .filter(|p| *p > Decimal::ZERO)
                .ok_or_else(|| Error::InvalidOrderParameters("limit order needs a price".into()))?,
        };

        let cost = request.quantity * price;
        if request.side == Side::Buy {
            let free = book
                .balances
                .get(&self.config.quote_asset)
                .map(|b| b.free)
                .unwrap_or(Decimal::ZERO);
            if free < cost {
                return Err(Error::InsufficientBalance(format!(
                    "{} free {} < required {}",
                    self.config.quote_asset, free, cost
                )));
            }
        }

        let exchange_id = book.next_order_id.to_string();
        book.next_order_id += 1;
        book.accepted += 1;
        let now = Utc::now();
        let order = Order {
            client_id: request.client_id.clone(),
            exchange_id: Some(exchange_id.clone()),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            status: OrderStatus::Acknowledged,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        };
        let report = execution_report(&order, "NEW", Decimal::ZERO, Decimal::ZERO, None);
        book.orders.insert(order.client_id.clone(), order);
        Self::emit(&mut book, ORDERS_STREAM, report, duplicate_delivery);

        if request.side == Side::Buy {
            book.reserved_at.insert(request.client_id.clone(), price);
            self.adjust_balance(&mut book, -cost, cost, duplicate_delivery);
        }

        if request.order_type == OrderType::Market || self.config.auto_fill {
            self.fill_locked(&mut book, &request.client_id, request.quantity, price, duplicate_delivery)?;
        }

        Ok(CommandResponse::Accepted {
            client_id: request.client_id,
            exchange_id,
            duplicate: false,
        })
    }

    fn cancel(&self, request: CancelOrder) -> Result<CommandResponse> {
        let duplicate_delivery = self.faults.lock().duplicate_delivery;
        let mut book = self.book.lock();
        let order = match book.orders.get_mut(&request.client_id) {
            Some(order) if !order.status.is_terminal() => order,
            _ => return Err(Error::OrderNotFound(request.client_id.to_string())),
        };
        order.status = OrderStatus::Canceled;
        order.updated_at = Utc::now();
        let remaining = order.remaining();
        let side = order.side;
        let report = execution_report(order, "CANCELED", Decimal::ZERO, Decimal::ZERO, None);
        Self::emit(&mut book, ORDERS_STREAM, report, duplicate_delivery);

        if side == Side::Buy {
            if let Some(reserved) = book.reserved_at.remove(&request.client_id) {
                let release = remaining * reserved;
                self.adjust_balance(&mut book, release, -release, duplicate_delivery);
            }
        }
        Ok(CommandResponse::Canceled {
            client_id: request.client_id,
        })
    }

    fn fill_locked(
        &self,
        book: &mut Book,
        client_id: &ClientOrderId,
        quantity: Decimal,
        price: Decimal,
        duplicate_delivery: bool,
    ) -> Result<()> {
        let trade_id = book.next_trade_id;
        let order = book
            .orders
            .get_mut(client_id)
            .filter(|o| !o.status.is_terminal())
            .ok_or_else(|| Error::OrderNotFound(client_id.to_string()))?;
        let applied = order.record_fill(quantity, price);
        if applied <= Decimal::ZERO {
            return Err(Error::InvalidOrderParameters(format!("nothing left to fill on {}", client_id)));
        }
        let now = Utc::now();
        order.status = if order.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        order.updated_at = now;
        let (symbol, side, done) = (order.symbol.clone(), order.side, order.status == OrderStatus::Filled);
        let report = execution_report(order, "TRADE", applied, price, Some(trade_id));
        book.next_trade_id += 1;
        Self::emit(book, ORDERS_STREAM, report, duplicate_delivery);

        book.positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::flat(symbol, now))
            .apply_fill(side, applied, price, now);

        let spent = applied * price;
        match side {
            Side::Buy => {
                let reserved = book.reserved_at.get(client_id).copied().unwrap_or(price);
                if done {
                    book.reserved_at.remove(client_id);
                }
                let unlocked = applied * reserved;
                self.adjust_balance(book, unlocked - spent, -unlocked, duplicate_delivery);
            }
            Side::Sell => self.adjust_balance(book, spent, Decimal::ZERO, duplicate_delivery),
        }
        Ok(())
    }

    fn adjust_balance(&self, book: &mut Book, free: Decimal, locked: Decimal, duplicate_delivery: bool) {
        let asset = self.config.quote_asset.clone();
        let balance = book
            .balances
            .entry(asset.clone())
            .or_insert_with(|| Balance::new(asset.clone(), Decimal::ZERO, Decimal::ZERO));
        balance.free += free;
        balance.locked += locked;
        let data = json!({
            "e": "balanceUpdate",
            "a": asset,
            "d": free.to_string(),
            "l": locked.to_string(),
        });
        Self::emit(book, BALANCES_STREAM, data, duplicate_delivery);
    }

    fn emit(book: &mut Book, stream: &str, data: Value, duplicate: bool) {
        let Some(s) = book.streams.get_mut(&StreamId::new(stream)) else {
            return;
        };
        s.sequence += 1;
        let payload = json!({
            "seq": s.sequence,
            "E": Utc::now().timestamp_millis(),
            "data": data,
        })
        .to_string();
        s.history.push_back((s.sequence, payload.clone()));
        while s.history.len() > HISTORY_CAPACITY {
            s.history.pop_front();
        }
        if s.drop_next > 0 {
            s.drop_next -= 1;
            debug!("Paper exchange dropping {} #{}", stream, s.sequence);
            return;
        }
        let _ = s.tx.send(RawMessage::new(stream, payload.clone()));
        if duplicate {
            let _ = s.tx.send(RawMessage::new(stream, payload));
        }
    }

    /// Connectivity notices carry sequence 0 and are not replayed
    fn emit_out_of_band(book: &mut Book, data: &Value) {
        for (id, s) in &book.streams {
            let payload = json!({"seq": 0, "data": data}).to_string();
            let _ = s.tx.send(RawMessage::new(id.clone(), payload));
        }
    }
}

fn execution_report(
    order: &Order,
    execution: &str,
    last_quantity: Decimal,
    last_price: Decimal,
    trade_id: Option<i64>,
) -> Value {
    let status = match order.status {
        OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
        OrderStatus::Filled => "FILLED",
        OrderStatus::Canceled => "CANCELED",
        OrderStatus::Rejected => "REJECTED",
        OrderStatus::Expired => "EXPIRED",
        _ => "NEW",
    };
    json!({
        "e": "executionReport",
        "s": order.symbol.as_str(),
        "c": order.client_id.as_str(),
        "S": order.side.to_string(),
        "o": order.order_type.to_string(),
        "q": order.quantity.to_string(),
        "p": order.price.unwrap_or(Decimal::ZERO).to_string(),
        "x": execution,
        "X": status,
        "i": order.exchange_id.as_deref().and_then(|id| id.parse::<u64>().ok()),
        "l": last_quantity.to_string(),
        "L": last_price.to_string(),
        "z": order.filled_quantity.to_string(),
        "n": "0",
        "t": trade_id.unwrap_or(-1),
    })
}

#[async_trait]
impl Transport for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn send_command(&self, command: Command) -> Result<CommandResponse> {
        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.book.lock().connected {
            return Err(Error::TransientNetwork("paper exchange disconnected".into()));
        }

        match command {
            Command::FetchSnapshot => {
                {
                    let mut faults = self.faults.lock();
                    if faults.failing_snapshots > 0 {
                        faults.failing_snapshots -= 1;
                        return Err(Error::TransientNetwork("snapshot unavailable".into()));
                    }
                }
                Ok(CommandResponse::Snapshot(self.snapshot()))
            }
            command => {
                let injected = self.faults.lock().command_errors.pop_front();
                if let Some(err) = injected {
                    debug!("Paper exchange failing {} with {}", command.label(), err);
                    return Err(err);
                }
                match command {
                    Command::Submit(request) => self.submit(request),
                    Command::Cancel(request) => self.cancel(request),
                    Command::FetchSnapshot => Ok(CommandResponse::Snapshot(self.snapshot())),
                }
            }
        }
    }

    fn streams(&self) -> Vec<StreamId> {
        self.book.lock().streams.keys().cloned().collect()
    }

    fn events(&self, stream: &StreamId) -> Result<flume::Receiver<RawMessage>> {
        self.book
            .lock()
            .streams
            .get(stream)
            .map(|s| s.rx.clone())
            .ok_or_else(|| Error::InvalidState(format!("unknown stream {}", stream)))
    }

    fn supports_replay(&self) -> bool {
        self.config.replay
    }

    async fn request_replay(&self, stream: &StreamId, after: u64) -> Result<()> {
        if !self.config.replay {
            return Err(Error::InvalidState("paper exchange replay disabled".into()));
        }
        let book = self.book.lock();
        let s = book
            .streams
            .get(stream)
            .ok_or_else(|| Error::InvalidState(format!("unknown stream {}", stream)))?;
        if let Some((oldest, _)) = s.history.front() {
            if after + 1 < *oldest {
                return Err(Error::InvalidState(format!(
                    "{} history starts at {}, cannot replay after {}",
                    stream, oldest, after
                )));
            }
        }
        let mut replayed = 0;
        for (_, payload) in s.history.iter().filter(|(seq, _)| *seq > after) {
            let _ = s.tx.send(RawMessage::new(stream.clone(), payload.clone()));
            replayed += 1;
        }
        debug!("Replayed {} messages on {} after {}", replayed, stream, after);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{EventKind, EventNormalizer};
    use rust_decimal_macros::dec;

    fn exchange() -> PaperExchange {
        let mut config = PaperConfig::default();
        config.balances = HashMap::from([("USDT".to_string(), dec!(1000))]);
        PaperExchange::new(config).with_auto_fill(false)
    }

    fn submit(id: &str, qty: Decimal, price: Decimal) -> Command {
        Command::Submit(SubmitOrder {
            client_id: id.into(),
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: qty,
            price: Some(price),
        })
    }

    #[tokio::test]
    async fn duplicate_key_is_deduplicated() {
        let paper = exchange();
        let first = paper.send_command(submit("k", dec!(1), dec!(100))).await.unwrap();
        let second = paper.send_command(submit("k", dec!(1), dec!(100))).await.unwrap();
        assert!(matches!(first, CommandResponse::Accepted { duplicate: false, .. }));
        assert!(matches!(second, CommandResponse::Accepted { duplicate: true, .. }));
        assert_eq!(paper.accepted_orders(), 1);
        assert_eq!(paper.snapshot().balances[0].locked, dec!(100));
    }

    #[tokio::test]
    async fn insufficient_balance_is_permanent() {
        let paper = exchange();
        let err = paper.send_command(submit("big", dec!(20), dec!(100))).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn reports_normalize_in_sequence() {
        let paper = exchange();
        let rx = paper.events(&StreamId::new(ORDERS_STREAM)).unwrap();
        paper.send_command(submit("k", dec!(10), dec!(100))).await.unwrap();
        paper.fill(&"k".into(), dec!(3), dec!(99)).unwrap();

        let normalizer = EventNormalizer::new();
        let ack = normalizer.normalize(&rx.try_recv().unwrap()).unwrap();
        let fill = normalizer.normalize(&rx.try_recv().unwrap()).unwrap();
        assert_eq!((ack.sequence, fill.sequence), (1, 2));
        assert!(matches!(ack.kind, EventKind::OrderAcknowledged { .. }));
        match fill.kind {
            EventKind::OrderPartiallyFilled { fill, .. } => {
                assert_eq!(fill.last_quantity, dec!(3));
                assert_eq!(fill.cumulative_quantity, dec!(3));
            }
            other => panic!("unexpected {:?}", other),
        }

        let snapshot = paper.snapshot();
        assert_eq!(snapshot.cursors[&StreamId::new(ORDERS_STREAM)], 2);
        // 1000 - 10*100 reserved, 3*100 unlocked, 3*99 spent
        let usdt = &snapshot.balances[0];
        assert_eq!(usdt.free, dec!(3));
        assert_eq!(usdt.locked, dec!(700));
    }

    #[tokio::test]
    async fn dropped_messages_can_be_replayed() {
        let paper = exchange().with_replay(true);
        let rx = paper.events(&StreamId::new(ORDERS_STREAM)).unwrap();
        paper.drop_next(ORDERS_STREAM, 1);
        paper.send_command(submit("k", dec!(1), dec!(100))).await.unwrap();
        assert!(rx.try_recv().is_err());

        paper.request_replay(&StreamId::new(ORDERS_STREAM), 0).await.unwrap();
        assert!(rx.try_recv().unwrap().payload.contains("\"seq\":1"));
    }

    #[tokio::test]
    async fn replay_history_is_bounded() {
        let paper = exchange().with_replay(true);
        let stream = StreamId::new(BALANCES_STREAM);
        let rx = paper.events(&stream).unwrap();
        {
            let mut book = paper.book.lock();
            for _ in 0..HISTORY_CAPACITY + 5 {
                PaperExchange::emit(&mut book, BALANCES_STREAM, json!({"e": "balanceUpdate"}), false);
            }
            let history = &book.streams[&stream].history;
            assert_eq!(history.len(), HISTORY_CAPACITY);
            assert_eq!(history.front().map(|(seq, _)| *seq), Some(6));
        }
        let _ = rx.drain().count();

        assert!(paper.request_replay(&stream, 0).await.is_err());
        paper.request_replay(&stream, 5).await.unwrap();
        assert_eq!(rx.len(), HISTORY_CAPACITY);
    }
}
