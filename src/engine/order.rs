//! Order Lifecycle Manager - Intent to terminal state
//!
//! Every intent gets exactly one order record keyed by its client order id.
//! Submissions are risk-checked, recorded as `Pending`, queued and handed to
//! the dispatcher by a background worker. A periodic sweep re-sends orders
//! whose acknowledgment is overdue (same key) and expires orders that have
//! outlived `max_lifetime`.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::config::LifecycleConfig;
use crate::core::{
    CancelOrder, ClientOrderId, Command, CommandResponse, Error, Order, OrderIntent, OrderStatus,
    Result, SubmitOrder,
};
use crate::engine::reconcile::ReconcileHandle;
use crate::engine::risk::{RejectReason, RiskDecision, RiskGate, SubmissionWindow};
use crate::engine::state::{Applied, LocalMutation, StateReader};
use crate::execution::CommandDispatcher;

/// Outcome of `submit`
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitReceipt {
    /// Recorded as `Pending` and queued for dispatch
    Queued(ClientOrderId),
    /// The key is already known; nothing new was sent
    Duplicate {
        client_id: ClientOrderId,
        status: Option<OrderStatus>,
    },
    /// Refused by the risk gate, recorded as `Rejected`
    Rejected {
        client_id: ClientOrderId,
        reason: RejectReason,
    },
}

impl SubmitReceipt {
    pub fn client_id(&self) -> &ClientOrderId {
        match self {
            SubmitReceipt::Queued(id) => id,
            SubmitReceipt::Duplicate { client_id, .. } | SubmitReceipt::Rejected { client_id, .. } => client_id,
        }
    }
}

/// Outcome of `cancel`
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The order is now `Canceled`
    Canceled,
    /// Submission is in flight; a cancel is sent once it resolves
    Deferred,
    AlreadyTerminal(OrderStatus),
}

/// What one sweep started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub resent: usize,
    pub expired: usize,
    pub requeued: usize,
    pub escalated: usize,
}

/// Removes the key from the admission set however `submit` exits
struct Admission<'a> {
    set: &'a Mutex<HashSet<ClientOrderId>>,
    key: ClientOrderId,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Where an order sits between the local queue and the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Waiting for the dispatch worker
    Queued,
    /// A command is on its way to the exchange
    Inflight { cancel_requested: bool },
}

pub struct OrderLifecycleManager {
    reader: StateReader,
    reconcile: ReconcileHandle,
    dispatcher: Arc<CommandDispatcher>,
    gate: RiskGate,
    config: LifecycleConfig,
    /// Held from the risk check until the order is tracked
    window: tokio::sync::Mutex<SubmissionWindow>,
    /// Keys between dedup check and being recorded in state
    admitting: Mutex<HashSet<ClientOrderId>>,
    slots: Mutex<HashMap<ClientOrderId, Slot>>,
    queue_tx: mpsc::Sender<ClientOrderId>,
    resends: Mutex<HashMap<ClientOrderId, u32>>,
}

impl OrderLifecycleManager {
    pub fn new(
        reader: StateReader,
        reconcile: ReconcileHandle,
        dispatcher: Arc<CommandDispatcher>,
        gate: RiskGate,
        config: LifecycleConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ClientOrderId>) {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let manager = Arc::new(Self {
            reader,
            reconcile,
            dispatcher,
            gate,
            config,
            window: tokio::sync::Mutex::new(SubmissionWindow::new()),
            admitting: Mutex::new(HashSet::new()),
            slots: Mutex::new(HashMap::new()),
            queue_tx,
            resends: Mutex::new(HashMap::new()),
        });
        (manager, queue_rx)
    }

    pub fn reader(&self) -> &StateReader {
        &self.reader
    }

    pub fn order(&self, client_id: &ClientOrderId) -> Option<Order> {
        self.reader.order(client_id)
    }

    /// Risk-check an intent and queue it. Re-submitting a known key is a
    /// no-op that reports the existing order.
    pub async fn submit(&self, intent: OrderIntent) -> Result<SubmitReceipt> {
        let client_id = intent.client_id.clone();
        let _admission = {
            let mut admitting = self.admitting.lock();
            if admitting.contains(&client_id) {
                return Ok(SubmitReceipt::Duplicate {
                    client_id,
                    status: None,
                });
            }
            if let Some(existing) = self.reader.order(&client_id) {
                debug!("Duplicate submit of {} ({})", client_id, existing.status);
                return Ok(SubmitReceipt::Duplicate {
                    client_id,
                    status: Some(existing.status),
                });
            }
            admitting.insert(client_id.clone());
            Admission {
                set: &self.admitting,
                key: client_id.clone(),
            }
        };

        // the next check must see this order's exposure, so the window stays
        // locked until `Track` is published
        let mut window = self.window.lock().await;
        let now = Utc::now();
        let state = self.reader.snapshot();
        window.prune(self.gate.limits().rate_window(), now);
        let decision = self.gate.check(&state, &intent, &window, now);

        let mut order = Order::pending(&intent, now);
        if let RiskDecision::Reject(reason) = decision {
            info!("Risk gate rejected {} {} {}: {}", client_id, intent.side, intent.symbol, reason);
            order.status = OrderStatus::Rejected;
            order.reject_reason = Some(reason.to_string());
            self.reconcile.propose(LocalMutation::Track(order)).await?;
            return Ok(SubmitReceipt::Rejected { client_id, reason });
        }

        if self.reconcile.propose(LocalMutation::Track(order)).await? == Applied::Unchanged {
            // lost a race with a feed event for the same key
            return Ok(SubmitReceipt::Duplicate {
                status: self.reader.order(&client_id).map(|o| o.status),
                client_id,
            });
        }
        window.record(intent.symbol.clone(), now);
        drop(window);

        info!(
            "Queued {} {} {} {} @ {:?}",
            client_id, intent.side, intent.quantity, intent.symbol, intent.price
        );
        self.enqueue(client_id.clone()).await?;
        Ok(SubmitReceipt::Queued(client_id))
    }

    /// Queue an order for the dispatch worker. `false` if it is already queued
    /// or in flight.
    async fn enqueue(&self, client_id: ClientOrderId) -> Result<bool> {
        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&client_id) {
                return Ok(false);
            }
            slots.insert(client_id.clone(), Slot::Queued);
        }
        if self.queue_tx.send(client_id.clone()).await.is_err() {
            self.slots.lock().remove(&client_id);
            return Err(Error::InvalidState("dispatch worker stopped".into()));
        }
        Ok(true)
    }

    /// Mark an idle order as in flight. `false` if something else owns it.
    fn claim(&self, client_id: &ClientOrderId) -> bool {
        let mut slots = self.slots.lock();
        if slots.contains_key(client_id) {
            return false;
        }
        slots.insert(client_id.clone(), Slot::Inflight { cancel_requested: false });
        true
    }

    /// Drop the order's slot and send a cancel requested while it was in flight
    async fn release(&self, client_id: &ClientOrderId) {
        let slot = self.slots.lock().remove(client_id);
        if slot != Some(Slot::Inflight { cancel_requested: true }) {
            return;
        }
        let Some(order) = self.reader.order(client_id) else {
            return;
        };
        if order.status.is_terminal() {
            return;
        }
        if let Err(e) = self.cancel_live(&order).await {
            warn!("Deferred cancel of {} failed: {}", client_id, e);
        }
    }

    /// Cancel an order. Orders that never reached the dispatcher are canceled
    /// immediately; live orders are canceled through the dispatcher.
    pub async fn cancel(&self, client_id: &ClientOrderId) -> Result<CancelOutcome> {
        loop {
            let slot = {
                let mut slots = self.slots.lock();
                let slot = slots.get(client_id).copied();
                match slot {
                    Some(Slot::Queued) => {
                        slots.remove(client_id);
                    }
                    Some(Slot::Inflight { .. }) => {
                        slots.insert(client_id.clone(), Slot::Inflight { cancel_requested: true });
                        return Ok(CancelOutcome::Deferred);
                    }
                    None => {}
                }
                slot
            };
            if slot == Some(Slot::Queued) {
                self.propose(LocalMutation::Canceled {
                    client_id: client_id.clone(),
                })
                .await;
                info!("Canceled {} before submission", client_id);
                return Ok(CancelOutcome::Canceled);
            }

            let order = self
                .reader
                .order(client_id)
                .ok_or_else(|| Error::OrderNotFound(client_id.to_string()))?;
            if order.status.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal(order.status));
            }
            if order.status != OrderStatus::Pending {
                return self.cancel_live(&order).await;
            }

            // restored or still being admitted; nothing was sent yet
            let applied = self
                .reconcile
                .propose(LocalMutation::Canceled {
                    client_id: client_id.clone(),
                })
                .await?;
            if applied == Applied::Changed {
                info!("Canceled {} before submission", client_id);
                return Ok(CancelOutcome::Canceled);
            }
            // picked up for dispatch in the meantime
        }
    }

    async fn cancel_live(&self, order: &Order) -> Result<CancelOutcome> {
        let command = Command::Cancel(CancelOrder {
            client_id: order.client_id.clone(),
            exchange_id: order.exchange_id.clone(),
            symbol: order.symbol.clone(),
        });
        match self.dispatcher.dispatch(command).await {
            Ok(_) => {
                self.propose(LocalMutation::Canceled {
                    client_id: order.client_id.clone(),
                })
                .await;
                info!("Canceled {}", order.client_id);
                Ok(CancelOutcome::Canceled)
            }
            Err(Error::OrderNotFound(_)) if order.status == OrderStatus::Submitted => {
                // never reached the exchange
                self.propose(LocalMutation::Canceled {
                    client_id: order.client_id.clone(),
                })
                .await;
                Ok(CancelOutcome::Canceled)
            }
            Err(e) => {
                if let Some(current) = self.reader.order(&order.client_id) {
                    if current.status.is_terminal() {
                        return Ok(CancelOutcome::AlreadyTerminal(current.status));
                    }
                }
                if !e.is_transient() {
                    let _ = self
                        .reconcile
                        .request_resync(format!("cancel of {} failed: {}", order.client_id, e))
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Dispatch worker: one task per queued order
    pub async fn run_dispatch(self: Arc<Self>, mut queue: mpsc::Receiver<ClientOrderId>) {
        while let Some(client_id) = queue.recv().await {
            let manager = self.clone();
            tokio::spawn(async move { manager.dispatch_submit(client_id).await });
        }
        debug!("Dispatch worker stopped");
    }

    async fn dispatch_submit(&self, client_id: ClientOrderId) {
        {
            let mut slots = self.slots.lock();
            if slots.get(&client_id) != Some(&Slot::Queued) {
                // canceled or expired while queued
                return;
            }
            slots.insert(client_id.clone(), Slot::Inflight { cancel_requested: false });
        }
        let order = match self.reader.order(&client_id) {
            Some(order) if order.status == OrderStatus::Pending => order,
            _ => {
                self.release(&client_id).await;
                return;
            }
        };

        let applied = self
            .propose(LocalMutation::Submitted {
                client_id: client_id.clone(),
            })
            .await;
        if applied != Applied::Changed {
            debug!("{} closed before dispatch, not sending", client_id);
            self.release(&client_id).await;
            return;
        }
        let result = self
            .dispatcher
            .dispatch(Command::Submit(SubmitOrder::from(&order)))
            .await;
        self.finish_submit(&client_id, result).await;
    }

    async fn finish_submit(&self, client_id: &ClientOrderId, result: Result<CommandResponse>) {
        match result {
            Ok(CommandResponse::Accepted {
                exchange_id,
                duplicate,
                ..
            }) => {
                if duplicate {
                    info!("{} already known to the exchange as {}", client_id, exchange_id);
                }
                self.resends.lock().remove(client_id);
                self.propose(LocalMutation::Acknowledged {
                    client_id: client_id.clone(),
                    exchange_id,
                })
                .await;
            }
            Ok(other) => warn!("Unexpected response to submit {}: {:?}", client_id, other),
            Err(e) if e.is_transient() => {
                warn!("Submit {} unresolved ({}), waiting for ack timeout", client_id, e);
            }
            Err(e) if e.is_fatal_to_order() => {
                warn!("Submit {} rejected: {}", client_id, e);
                self.resends.lock().remove(client_id);
                self.propose(LocalMutation::Rejected {
                    client_id: client_id.clone(),
                    reason: e.to_string(),
                })
                .await;
            }
            Err(e) => {
                error!("Submit {} failed: {}", client_id, e);
                let _ = self
                    .reconcile
                    .request_resync(format!("submit of {} failed: {}", client_id, e))
                    .await;
            }
        }
        self.release(client_id).await;
    }

    /// Periodic maintenance: ack timeouts, lifetime expiry, orphaned pending orders
    pub async fn sweep(self: &Arc<Self>) -> SweepReport {
        let mut report = SweepReport::default();
        let state = self.reader.snapshot();
        if state.is_halted() {
            return report;
        }
        let now = Utc::now();
        let ack_timeout = chrono::Duration::from_std(self.config.ack_timeout()).unwrap_or(chrono::Duration::MAX);
        let lifetime = self
            .config
            .max_lifetime()
            .and_then(|l| chrono::Duration::from_std(l).ok());

        for order in state.open_orders() {
            let id = &order.client_id;
            if self.is_busy(id) {
                continue;
            }

            if lifetime.is_some_and(|l| now - order.created_at > l) {
                if self.claim(id) {
                    report.expired += 1;
                    self.expire(order.clone());
                }
                continue;
            }

            match order.status {
                OrderStatus::Pending => {
                    // e.g. restored from a checkpoint; the snapshot may predate a cancel
                    let pending = self
                        .reader
                        .order(id)
                        .is_some_and(|o| o.status == OrderStatus::Pending);
                    if pending && matches!(self.enqueue(id.clone()).await, Ok(true)) {
                        report.requeued += 1;
                    }
                }
                OrderStatus::Submitted if now - order.updated_at > ack_timeout => {
                    let attempts = {
                        let mut resends = self.resends.lock();
                        let count = resends.entry(id.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if attempts > self.config.max_resends {
                        report.escalated += 1;
                        self.resends.lock().remove(id);
                        warn!("{} still unacknowledged after {} resends", id, self.config.max_resends);
                        let _ = self
                            .reconcile
                            .request_resync(format!("{} unacknowledged", id))
                            .await;
                        continue;
                    }
                    if self.claim(id) {
                        report.resent += 1;
                        self.resend(order.clone(), attempts);
                    }
                }
                _ => {}
            }
        }
        report
    }

    /// Queued, in flight or being admitted. Lock order: slots, then admitting.
    fn is_busy(&self, client_id: &ClientOrderId) -> bool {
        let slots = self.slots.lock();
        slots.contains_key(client_id) || self.admitting.lock().contains(client_id)
    }

    /// Caller has claimed the order
    fn resend(self: &Arc<Self>, order: Order, attempt: u32) {
        let manager = self.clone();
        tokio::spawn(async move {
            let id = order.client_id.clone();
            let applied = manager
                .propose(LocalMutation::Resent { client_id: id.clone() })
                .await;
            if applied != Applied::Changed {
                // closed since the sweep's snapshot
                manager.release(&id).await;
                return;
            }
            info!("Re-sending {} (attempt {})", id, attempt);
            let result = manager
                .dispatcher
                .dispatch(Command::Submit(SubmitOrder::from(&order)))
                .await;
            manager.finish_submit(&id, result).await;
        });
    }

    /// Caller has claimed the order. The order is closed locally first so the
    /// exchange's own cancel report cannot overtake it; a failed cancel is
    /// settled by a resync.
    fn expire(self: &Arc<Self>, order: Order) {
        let id = order.client_id.clone();
        let manager = self.clone();
        tokio::spawn(async move {
            let applied = manager.propose(LocalMutation::Expired { client_id: id.clone() }).await;
            if applied == Applied::Changed {
                info!("Expired {}", id);
                manager.resends.lock().remove(&id);
                if order.status != OrderStatus::Pending {
                    let command = Command::Cancel(CancelOrder {
                        client_id: id.clone(),
                        exchange_id: order.exchange_id.clone(),
                        symbol: order.symbol.clone(),
                    });
                    match manager.dispatcher.dispatch(command).await {
                        Ok(_) => {}
                        Err(Error::OrderNotFound(_)) if order.status == OrderStatus::Submitted => {}
                        Err(e) => {
                            warn!("Expiry cancel of {} failed: {}", id, e);
                            let _ = manager
                                .reconcile
                                .request_resync(format!("expiry cancel of {} failed", id))
                                .await;
                        }
                    }
                }
            }
            manager.release(&id).await;
        });
    }

    /// Sweep every `sweep_interval` until the task is aborted
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.sweep_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let report = self.sweep().await;
            if report != SweepReport::default() {
                debug!("Sweep: {:?}", report);
            }
        }
    }

    async fn propose(&self, mutation: LocalMutation) -> Applied {
        match self.reconcile.propose(mutation).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!("State update dropped: {}", e);
                Applied::Unchanged
            }
        }
    }
}
