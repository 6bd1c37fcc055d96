//! State Store - Authoritative account view
//!
//! Balances, orders and positions are owned by one `StateStore`, driven by
//! the reconciliation task. Everyone else reads immutable snapshots through a
//! `StateReader`; a snapshot is never modified after it is published.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::{
    Balance, ClientOrderId, ExchangeSnapshot, Order, OrderStatus, Position, StreamId, Symbol,
    Timestamp,
};
use crate::feeds::{EventKind, FillDetails, NormalizedEvent, OrderDetails};

/// Why trading stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltReason {
    pub reason: String,
    pub since: Timestamp,
}

/// Point-in-time account view. Also the checkpoint payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    /// Bumped on every publish
    pub version: u64,
    pub balances: BTreeMap<String, Balance>,
    pub orders: BTreeMap<ClientOrderId, Order>,
    pub positions: BTreeMap<Symbol, Position>,
    /// Last applied sequence per stream
    pub cursors: BTreeMap<StreamId, u64>,
    pub recent_events: VecDeque<NormalizedEvent>,
    pub halted: Option<HaltReason>,
    pub connected: bool,
    pub last_resync: Option<Timestamp>,
}

impl AccountState {
    pub fn balance(&self, asset: &str) -> Option<&Balance> {
        self.balances.get(asset)
    }

    pub fn order(&self, client_id: &ClientOrderId) -> Option<&Order> {
        self.orders.get(client_id)
    }

    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| o.status.is_open())
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Signed net quantity, zero when no position exists
    pub fn net_position(&self, symbol: &Symbol) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    /// Signed quantity still to be filled on open orders for `symbol`
    pub fn open_order_exposure(&self, symbol: &Symbol) -> Decimal {
        self.open_orders()
            .filter(|o| &o.symbol == symbol)
            .map(|o| o.remaining() * o.side.sign())
            .sum()
    }

    pub fn cursor(&self, stream: &StreamId) -> u64 {
        self.cursors.get(stream).copied().unwrap_or(0)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }
}

/// Result of applying one event or mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// The input contradicts local state; a resync is required
    Divergent(String),
}

/// Mutations proposed by components other than the feed
#[derive(Debug, Clone)]
pub enum LocalMutation {
    /// Record a new order (normally `Pending`, or `Rejected` by the risk gate)
    Track(Order),
    Submitted { client_id: ClientOrderId },
    /// Same key re-sent after an ack timeout; status stays `Submitted`
    Resent { client_id: ClientOrderId },
    Acknowledged { client_id: ClientOrderId, exchange_id: String },
    Canceled { client_id: ClientOrderId },
    Rejected { client_id: ClientOrderId, reason: String },
    Expired { client_id: ClientOrderId },
    Halt { reason: String },
    Resume,
}

/// Single-writer state store
pub struct StateStore {
    state: Arc<AccountState>,
    published: Arc<RwLock<Arc<AccountState>>>,
    recent_capacity: usize,
    dirty: bool,
}

impl StateStore {
    pub fn new(recent_capacity: usize) -> Self {
        Self::restore(AccountState::default(), recent_capacity)
    }

    /// Start from a checkpointed state
    pub fn restore(state: AccountState, recent_capacity: usize) -> Self {
        let state = Arc::new(state);
        Self {
            published: Arc::new(RwLock::new(state.clone())),
            state,
            recent_capacity,
            dirty: false,
        }
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            published: self.published.clone(),
        }
    }

    /// Writer's own view, including unpublished changes
    pub fn state(&self) -> &AccountState {
        &self.state
    }

    /// Make pending changes visible to readers as a new version
    pub fn publish(&mut self) {
        if !self.dirty {
            return;
        }
        Arc::make_mut(&mut self.state).version += 1;
        *self.published.write() = self.state.clone();
        self.dirty = false;
    }

    fn write(&mut self) -> &mut AccountState {
        self.dirty = true;
        Arc::make_mut(&mut self.state)
    }

    pub fn set_cursor(&mut self, stream: &StreamId, sequence: u64) {
        self.write().cursors.insert(stream.clone(), sequence);
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.state.connected != connected {
            self.write().connected = connected;
        }
    }

    /// Apply one sequenced feed event. Cursor handling is the caller's job.
    pub fn apply_event(&mut self, event: &NormalizedEvent) -> Applied {
        let capacity = self.recent_capacity;
        let state = self.write();
        let applied = match &event.kind {
            EventKind::OrderAcknowledged { order } => acknowledge(state, order, event.received_at),
            EventKind::OrderPartiallyFilled { order, fill } => {
                fill_order(state, order, fill, false, event.received_at)
            }
            EventKind::OrderFilled { order, fill } => fill_order(state, order, fill, true, event.received_at),
            EventKind::OrderCanceled { order } => {
                close_order(state, order, OrderStatus::Canceled, None, event.received_at)
            }
            EventKind::OrderRejected { order, reason } => close_order(
                state,
                order,
                OrderStatus::Rejected,
                Some(reason.clone()),
                event.received_at,
            ),
            EventKind::BalanceChanged {
                asset,
                free_delta,
                locked_delta,
            } => change_balance(state, asset, *free_delta, *locked_delta),
            EventKind::ConnectionLost { .. } => {
                state.connected = false;
                Applied::Changed
            }
            EventKind::ConnectionRestored => {
                state.connected = true;
                Applied::Changed
            }
        };

        if capacity > 0 {
            state.recent_events.push_back(event.clone());
            while state.recent_events.len() > capacity {
                state.recent_events.pop_front();
            }
        }
        applied
    }

    /// Apply a mutation proposed by the lifecycle manager or an operator
    pub fn apply_local(&mut self, mutation: LocalMutation) -> Applied {
        let now = Utc::now();
        match mutation {
            LocalMutation::Track(order) => {
                if self.state.orders.contains_key(&order.client_id) {
                    return Applied::Unchanged;
                }
                self.write().orders.insert(order.client_id.clone(), order);
                Applied::Changed
            }
            LocalMutation::Submitted { client_id } => {
                self.transition(&client_id, OrderStatus::Submitted, None, now)
            }
            LocalMutation::Resent { client_id } => match self.state.orders.get(&client_id) {
                Some(order) if order.status == OrderStatus::Submitted => {
                    if let Some(order) = self.write().orders.get_mut(&client_id) {
                        order.updated_at = now;
                    }
                    Applied::Changed
                }
                _ => Applied::Unchanged,
            },
            LocalMutation::Acknowledged {
                client_id,
                exchange_id,
            } => {
                let Some(order) = self.state.orders.get(&client_id) else {
                    return Applied::Unchanged;
                };
                let needs_id = order.exchange_id.is_none();
                let can_ack = order.status.can_transition_to(OrderStatus::Acknowledged);
                if !needs_id && !can_ack {
                    return Applied::Unchanged;
                }
                if let Some(order) = self.write().orders.get_mut(&client_id) {
                    if needs_id {
                        order.exchange_id = Some(exchange_id);
                    }
                    if can_ack {
                        order.status = OrderStatus::Acknowledged;
                    }
                    order.updated_at = now;
                }
                Applied::Changed
            }
            LocalMutation::Canceled { client_id } => {
                self.transition(&client_id, OrderStatus::Canceled, None, now)
            }
            LocalMutation::Rejected { client_id, reason } => {
                self.transition(&client_id, OrderStatus::Rejected, Some(reason), now)
            }
            LocalMutation::Expired { client_id } => {
                self.transition(&client_id, OrderStatus::Expired, None, now)
            }
            LocalMutation::Halt { reason } => {
                if self.state.halted.is_some() {
                    return Applied::Unchanged;
                }
                self.write().halted = Some(HaltReason { reason, since: now });
                Applied::Changed
            }
            LocalMutation::Resume => {
                if self.state.halted.is_none() {
                    return Applied::Unchanged;
                }
                self.write().halted = None;
                Applied::Changed
            }
        }
    }

    fn transition(
        &mut self,
        client_id: &ClientOrderId,
        next: OrderStatus,
        reason: Option<String>,
        now: Timestamp,
    ) -> Applied {
        match self.state.orders.get(client_id) {
            Some(order) if order.status.can_transition_to(next) => {}
            Some(order) => {
                debug!("Ignoring {} -> {} for {}", order.status, next, client_id);
                return Applied::Unchanged;
            }
            None => return Applied::Unchanged,
        }
        if let Some(order) = self.write().orders.get_mut(client_id) {
            order.status = next;
            if reason.is_some() {
                order.reject_reason = reason;
            }
            order.updated_at = now;
        }
        Applied::Changed
    }

    /// Replace balances, positions and cursors with the exchange's authoritative
    /// view. Orders the exchange reports are overwritten; local orders still in
    /// flight (`Pending`/`Submitted`) are kept; acknowledged orders the exchange
    /// no longer reports are closed.
    pub fn replace(&mut self, snapshot: ExchangeSnapshot) {
        let now = snapshot.taken_at.unwrap_or_else(Utc::now);
        let state = self.write();

        state.balances = snapshot
            .balances
            .into_iter()
            .map(|b| (b.asset.clone(), b))
            .collect();
        state.positions = snapshot
            .positions
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let mut reported = std::collections::BTreeSet::new();
        for mut order in snapshot.orders {
            reported.insert(order.client_id.clone());
            if let Some(local) = state.orders.get(&order.client_id) {
                order.created_at = local.created_at;
            }
            state.orders.insert(order.client_id.clone(), order);
        }
        for order in state.orders.values_mut() {
            if reported.contains(&order.client_id) {
                continue;
            }
            if matches!(
                order.status,
                OrderStatus::Acknowledged | OrderStatus::PartiallyFilled
            ) {
                warn!(
                    "Order {} missing from exchange snapshot, closing as canceled",
                    order.client_id
                );
                order.status = OrderStatus::Canceled;
                order.reject_reason = Some("missing from exchange snapshot".to_string());
                order.updated_at = now;
            }
        }

        for (stream, sequence) in snapshot.cursors {
            state.cursors.insert(stream, sequence);
        }
        state.last_resync = Some(now);
    }
}

fn order_from_details(details: &OrderDetails, status: OrderStatus, at: Timestamp) -> Order {
    Order {
        client_id: details.client_id.clone(),
        exchange_id: details.exchange_id.clone(),
        symbol: details.symbol.clone(),
        side: details.side,
        order_type: details.order_type,
        quantity: details.quantity,
        price: details.price,
        filled_quantity: Decimal::ZERO,
        average_fill_price: None,
        status,
        reject_reason: None,
        created_at: at,
        updated_at: at,
    }
}

fn acknowledge(state: &mut AccountState, details: &OrderDetails, at: Timestamp) -> Applied {
    match state.orders.get_mut(&details.client_id) {
        Some(order) => {
            let mut changed = false;
            if order.exchange_id.is_none() && details.exchange_id.is_some() {
                order.exchange_id = details.exchange_id.clone();
                changed = true;
            }
            if order.status.can_transition_to(OrderStatus::Acknowledged) {
                order.status = OrderStatus::Acknowledged;
                changed = true;
            }
            if changed {
                order.updated_at = at;
                Applied::Changed
            } else {
                Applied::Unchanged
            }
        }
        None => {
            debug!("Tracking order {} first seen on the feed", details.client_id);
            state.orders.insert(
                details.client_id.clone(),
                order_from_details(details, OrderStatus::Acknowledged, at),
            );
            Applied::Changed
        }
    }
}

fn fill_order(
    state: &mut AccountState,
    details: &OrderDetails,
    fill: &FillDetails,
    complete: bool,
    at: Timestamp,
) -> Applied {
    let (quantity, filled) = match state.orders.get(&details.client_id) {
        Some(order) => (order.quantity, order.filled_quantity),
        None => (details.quantity, Decimal::ZERO),
    };
    if fill.cumulative_quantity > quantity {
        return Applied::Divergent(format!(
            "{} cumulative fill {} exceeds requested {}",
            details.client_id, fill.cumulative_quantity, quantity
        ));
    }
    let delta = fill.cumulative_quantity - filled;
    if delta <= Decimal::ZERO {
        return Applied::Unchanged;
    }
    let next = if fill.cumulative_quantity >= quantity {
        OrderStatus::Filled
    } else {
        OrderStatus::PartiallyFilled
    };
    if complete && next != OrderStatus::Filled {
        return Applied::Divergent(format!(
            "{} reported filled at {} of {}",
            details.client_id, fill.cumulative_quantity, quantity
        ));
    }
    if delta != fill.last_quantity {
        warn!(
            "{} fill delta {} differs from reported last quantity {}",
            details.client_id, delta, fill.last_quantity
        );
    }

    let order = state
        .orders
        .entry(details.client_id.clone())
        .or_insert_with(|| order_from_details(details, OrderStatus::Acknowledged, at));
    if order.exchange_id.is_none() {
        order.exchange_id = details.exchange_id.clone();
    }
    let applied = order.record_fill(delta, fill.last_price);
    if order.status.can_transition_to(next) {
        order.status = next;
    } else {
        warn!(
            "Fill for {} arrived in terminal state {}, exposure recorded",
            order.client_id, order.status
        );
    }
    order.updated_at = at;

    let (symbol, side) = (order.symbol.clone(), order.side);
    state
        .positions
        .entry(symbol.clone())
        .or_insert_with(|| Position::flat(symbol, at))
        .apply_fill(side, applied, fill.last_price, at);
    Applied::Changed
}

fn close_order(
    state: &mut AccountState,
    details: &OrderDetails,
    next: OrderStatus,
    reason: Option<String>,
    at: Timestamp,
) -> Applied {
    let Some(order) = state.orders.get_mut(&details.client_id) else {
        let mut order = order_from_details(details, next, at);
        order.reject_reason = reason;
        state.orders.insert(details.client_id.clone(), order);
        return Applied::Changed;
    };
    if order.status == next {
        return Applied::Unchanged;
    }
    if !order.status.can_transition_to(next) {
        if order.status.is_terminal() {
            return Applied::Unchanged;
        }
        return Applied::Divergent(format!(
            "{} cannot move from {} to {}",
            order.client_id, order.status, next
        ));
    }
    order.status = next;
    if order.exchange_id.is_none() {
        order.exchange_id = details.exchange_id.clone();
    }
    if reason.is_some() {
        order.reject_reason = reason;
    }
    order.updated_at = at;
    Applied::Changed
}

fn change_balance(state: &mut AccountState, asset: &str, free: Decimal, locked: Decimal) -> Applied {
    let (current_free, current_locked) = state
        .balances
        .get(asset)
        .map(|b| (b.free, b.locked))
        .unwrap_or_default();
    let next_free = current_free + free;
    let next_locked = current_locked + locked;
    if next_free < Decimal::ZERO || next_locked < Decimal::ZERO {
        return Applied::Divergent(format!(
            "{} balance would go negative (free {}, locked {})",
            asset, next_free, next_locked
        ));
    }
    let balance = state
        .balances
        .entry(asset.to_string())
        .or_insert_with(|| Balance::new(asset, Decimal::ZERO, Decimal::ZERO));
    balance.free = next_free;
    balance.locked = next_locked;
    Applied::Changed
}

/// Read-only query interface for strategies, the risk gate and reporting
#[derive(Clone)]
pub struct StateReader {
    published: Arc<RwLock<Arc<AccountState>>>,
}

impl StateReader {
    /// Consistent snapshot; holding it never blocks the writer
    pub fn snapshot(&self) -> Arc<AccountState> {
        self.published.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.published.read().version
    }

    pub fn balances(&self) -> Vec<Balance> {
        self.snapshot().balances.values().cloned().collect()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.snapshot().orders.values().cloned().collect()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.snapshot().open_orders().cloned().collect()
    }

    pub fn order(&self, client_id: &ClientOrderId) -> Option<Order> {
        self.snapshot().order(client_id).cloned()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.snapshot().positions.values().cloned().collect()
    }

    pub fn position(&self, symbol: &Symbol) -> Option<Position> {
        self.snapshot().position(symbol).cloned()
    }

    /// Most recent events, newest last
    pub fn recent_events(&self, limit: usize) -> Vec<NormalizedEvent> {
        let snapshot = self.snapshot();
        let skip = snapshot.recent_events.len().saturating_sub(limit);
        snapshot.recent_events.iter().skip(skip).cloned().collect()
    }

    pub fn halted(&self) -> Option<HaltReason> {
        self.snapshot().halted.clone()
    }

    pub fn cursors(&self) -> BTreeMap<StreamId, u64> {
        self.snapshot().cursors.clone()
    }
}
