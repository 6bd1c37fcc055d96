//! Order lifecycle against the paper exchange

mod common;

use std::sync::Arc;
use std::time::Duration;

use aleph_ledger::core::{ClientOrderId, Error, Order, OrderIntent, OrderStatus, Side, Symbol};
use aleph_ledger::engine::{
    Bootstrap, CancelOutcome, LocalMutation, OrderLifecycleManager, ReconcileHandle, ReconciliationLoop,
    RejectReason, RiskGate, StateReader, StateStore, SubmitReceipt, SweepReport,
};
use aleph_ledger::exchanges::PaperExchange;
use aleph_ledger::execution::CommandDispatcher;
use chrono::Utc;
use common::*;
use futures::future::join_all;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn buy(id: &str, quantity: rust_decimal::Decimal, price: rust_decimal::Decimal) -> OrderIntent {
    OrderIntent::limit("BTCUSDT", Side::Buy, quantity, price).with_client_id(id)
}

#[tokio::test]
async fn partial_fills_complete_the_order() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;

    let receipt = engine.submit(buy("pf-1", dec!(10), dec!(110))).await?;
    assert_eq!(receipt, SubmitReceipt::Queued(ClientOrderId::from("pf-1")));
    wait_for_order(&engine, "pf-1", status_is(OrderStatus::Acknowledged)).await;

    let id = ClientOrderId::from("pf-1");
    paper.fill(&id, dec!(3), dec!(100))?;
    let partial = wait_for_order(&engine, "pf-1", status_is(OrderStatus::PartiallyFilled)).await;
    assert_eq!(partial.filled_quantity, dec!(3));

    paper.fill(&id, dec!(7), dec!(110))?;
    let order = wait_for_order(&engine, "pf-1", status_is(OrderStatus::Filled)).await;
    assert_eq!(order.filled_quantity, dec!(10));
    assert_eq!(order.average_fill_price, Some(dec!(107)));

    let state = engine
        .wait_until(WAIT, |s| quote_balance(s) == (dec!(8930), dec!(0)))
        .await?;
    let position = state.position(&Symbol::new("BTCUSDT")).expect("position");
    assert_eq!(position.quantity, dec!(10));
    assert_eq!(position.average_entry_price, dec!(107));
    assert_matches_exchange(&state, &paper);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_duplicate_submits_reach_the_exchange_once() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;

    let intent = buy("dup-1", dec!(1), dec!(100));
    let receipts = join_all((0..5).map(|_| engine.submit(intent.clone()))).await;
    let queued = receipts
        .iter()
        .filter(|r| matches!(r, Ok(SubmitReceipt::Queued(_))))
        .count();
    let duplicates = receipts
        .iter()
        .filter(|r| matches!(r, Ok(SubmitReceipt::Duplicate { .. })))
        .count();
    assert_eq!((queued, duplicates), (1, 4));

    wait_for_order(&engine, "dup-1", status_is(OrderStatus::Acknowledged)).await;
    let again = engine.submit(intent).await?;
    assert_eq!(
        again,
        SubmitReceipt::Duplicate {
            client_id: ClientOrderId::from("dup-1"),
            status: Some(OrderStatus::Acknowledged),
        }
    );
    assert_eq!(paper.accepted_orders(), 1);
    assert_eq!(engine.reader().orders().len(), 1);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn position_limit_rejection_is_recorded() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;

    let receipt = engine.submit(buy("big-1", dec!(12), dec!(100))).await?;
    match receipt {
        SubmitReceipt::Rejected { reason, .. } => {
            assert!(matches!(reason, RejectReason::PositionLimit { .. }))
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    let order = engine.reader().order(&ClientOrderId::from("big-1")).expect("recorded");
    assert_eq!(order.status, OrderStatus::Rejected);
    assert!(order.reject_reason.is_some());
    assert_eq!(paper.accepted_orders(), 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn permanent_exchange_error_rejects_the_order() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;

    paper.push_command_errors([Error::InsufficientBalance("USDT free 0".into())]);
    engine.submit(buy("poor-1", dec!(1), dec!(100))).await?;
    let order = wait_for_order(&engine, "poor-1", status_is(OrderStatus::Rejected)).await;
    assert!(order.reject_reason.unwrap_or_default().contains("USDT free 0"));
    assert_eq!(engine.dispatcher_stats().retried, 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancel_releases_the_reservation() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;

    engine.submit(buy("cx-1", dec!(2), dec!(100))).await?;
    wait_for_order(&engine, "cx-1", status_is(OrderStatus::Acknowledged)).await;
    engine
        .wait_until(WAIT, |s| quote_balance(s) == (dec!(9800), dec!(200)))
        .await?;

    let id = ClientOrderId::from("cx-1");
    assert_eq!(engine.cancel(&id).await?, CancelOutcome::Canceled);
    assert_eq!(engine.reader().order(&id).map(|o| o.status), Some(OrderStatus::Canceled));
    assert_eq!(paper.order(&id).map(|o| o.status), Some(OrderStatus::Canceled));

    let state = engine
        .wait_until(WAIT, |s| quote_balance(s) == (dec!(10000), dec!(0)))
        .await?;
    assert_matches_exchange(&state, &paper);

    // a second cancel changes nothing
    assert_eq!(
        engine.cancel(&id).await?,
        CancelOutcome::AlreadyTerminal(OrderStatus::Canceled)
    );

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancel_of_unknown_order_fails() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;

    let err = engine.cancel(&ClientOrderId::from("nope")).await.unwrap_err();
    assert!(matches!(err, Error::OrderNotFound(_)));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn lost_submission_is_resent_with_the_same_key() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let mut config = test_config();
    config.dispatcher.max_attempts = 2;
    let engine = start(&config, &paper, None).await;

    paper.push_command_errors([
        Error::TransientNetwork("reset".into()),
        Error::TransientNetwork("reset".into()),
    ]);
    engine.submit(buy("lost-1", dec!(1), dec!(100))).await?;
    wait_for_order(&engine, "lost-1", status_is(OrderStatus::Submitted)).await;

    // the sweeper re-sends once the ack is overdue
    wait_for_order(&engine, "lost-1", status_is(OrderStatus::Acknowledged)).await;
    assert_eq!(paper.accepted_orders(), 1);
    assert!(engine.dispatcher_stats().failed >= 1);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn market_order_fills_at_the_reference_price() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;

    let intent = OrderIntent::market("BTCUSDT", Side::Buy, dec!(2)).with_reference_price(dec!(100));
    let id = engine.submit(intent).await?.client_id().clone();
    let order = wait_for_order(&engine, id.as_str(), status_is(OrderStatus::Filled)).await;
    assert_eq!(order.average_fill_price, Some(dec!(100)));

    let state = engine
        .wait_until(WAIT, |s| quote_balance(s) == (dec!(9800), dec!(0)))
        .await?;
    assert_eq!(state.net_position(&Symbol::new("BTCUSDT")), dec!(2));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn open_orders_count_against_the_limit_under_concurrency() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let mut config = test_config();
    config.risk.count_open_orders = true;
    let engine = start(&config, &paper, None).await;

    // 6 + 6 would breach the limit of 10 once both rest
    let receipts = join_all([
        engine.submit(buy("exp-1", dec!(6), dec!(100))),
        engine.submit(buy("exp-2", dec!(6), dec!(100))),
    ])
    .await;
    let queued = receipts
        .iter()
        .filter(|r| matches!(r, Ok(SubmitReceipt::Queued(_))))
        .count();
    let limited = receipts
        .iter()
        .filter(|r| {
            matches!(
                r,
                Ok(SubmitReceipt::Rejected {
                    reason: RejectReason::PositionLimit { .. },
                    ..
                })
            )
        })
        .count();
    assert_eq!((queued, limited), (1, 1));

    let state = engine
        .wait_until(WAIT, |s| s.open_order_exposure(&Symbol::new("BTCUSDT")) == dec!(6))
        .await?;
    assert_eq!(state.open_orders().count(), 1);
    engine.wait_until(WAIT, |s| s.open_orders().all(|o| o.status == OrderStatus::Acknowledged)).await?;
    assert_eq!(paper.accepted_orders(), 1);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancel_during_submission_is_sent_after_it_resolves() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;
    paper.set_latency(Some(Duration::from_millis(150)));

    engine.submit(buy("defer-1", dec!(2), dec!(100))).await?;
    wait_for_order(&engine, "defer-1", status_is(OrderStatus::Submitted)).await;

    let id = ClientOrderId::from("defer-1");
    assert_eq!(engine.cancel(&id).await?, CancelOutcome::Deferred);

    wait_for_order(&engine, "defer-1", status_is(OrderStatus::Canceled)).await;
    assert_eq!(paper.order(&id).map(|o| o.status), Some(OrderStatus::Canceled));
    assert_eq!(paper.accepted_orders(), 1);
    engine
        .wait_until(WAIT, |s| quote_balance(s) == (dec!(10000), dec!(0)))
        .await?;

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn resting_order_expires_after_its_lifetime() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let mut config = test_config();
    config.orders.max_lifetime_ms = 300;
    let engine = start(&config, &paper, None).await;

    engine.submit(buy("old-1", dec!(2), dec!(100))).await?;
    wait_for_order(&engine, "old-1", status_is(OrderStatus::Acknowledged)).await;

    let order = wait_for_order(&engine, "old-1", status_is(OrderStatus::Expired)).await;
    assert_eq!(order.filled_quantity, dec!(0));
    // the exchange was told to cancel it
    let id = ClientOrderId::from("old-1");
    assert_eq!(paper.order(&id).map(|o| o.status), Some(OrderStatus::Canceled));
    engine
        .wait_until(WAIT, |s| quote_balance(s) == (dec!(10000), dec!(0)))
        .await?;
    assert_eq!(paper.accepted_orders(), 1);

    engine.shutdown().await;
    Ok(())
}

/// Lifecycle manager on a running reconciliation loop, dispatch worker not started
struct Manual {
    manager: Arc<OrderLifecycleManager>,
    queue: mpsc::Receiver<ClientOrderId>,
    reconcile: ReconcileHandle,
    reader: StateReader,
    task: JoinHandle<()>,
}

impl Manual {
    async fn new(paper: &Arc<PaperExchange>) -> Self {
        let config = test_config();
        let dispatcher = Arc::new(CommandDispatcher::new(paper.clone(), &config.dispatcher));
        let reconciler = ReconciliationLoop::new(
            StateStore::new(16),
            dispatcher.clone(),
            config.reconciliation.clone(),
            None,
        );
        let (reconcile, inbox) = reconciler.channel();
        let reader = reconciler.store().reader();
        let task = tokio::spawn(reconciler.run(Bootstrap::Resync, inbox));

        let deadline = tokio::time::Instant::now() + WAIT;
        while reader.snapshot().last_resync.is_none() {
            assert!(tokio::time::Instant::now() < deadline, "startup resync never finished");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (manager, queue) = OrderLifecycleManager::new(
            reader.clone(),
            reconcile.clone(),
            dispatcher,
            RiskGate::new(config.risk.clone()),
            config.orders.clone(),
        );
        Self {
            manager,
            queue,
            reconcile,
            reader,
            task,
        }
    }

    /// Start the dispatch worker and give it time to drain the queue
    async fn drain(self) -> anyhow::Result<StateReader> {
        let worker = tokio::spawn(self.manager.clone().run_dispatch(self.queue));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(self.manager.sweep().await, SweepReport::default());
        worker.abort();
        self.reconcile.shutdown().await;
        self.task.await?;
        Ok(self.reader)
    }
}

#[tokio::test]
async fn cancel_of_queued_order_never_reaches_the_exchange() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let manual = Manual::new(&paper).await;
    let id = ClientOrderId::from("queued-1");

    let receipt = manual.manager.submit(buy("queued-1", dec!(1), dec!(100))).await?;
    assert_eq!(receipt, SubmitReceipt::Queued(id.clone()));
    assert_eq!(manual.manager.cancel(&id).await?, CancelOutcome::Canceled);
    assert_eq!(manual.reader.order(&id).map(|o| o.status), Some(OrderStatus::Canceled));

    let reader = manual.drain().await?;
    assert_eq!(paper.accepted_orders(), 0);
    assert_eq!(reader.order(&id).map(|o| o.status), Some(OrderStatus::Canceled));
    Ok(())
}

#[tokio::test]
async fn restored_pending_order_cancels_without_dispatch() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let manual = Manual::new(&paper).await;
    let id = ClientOrderId::from("restored-1");

    // as left behind by a checkpoint: pending, never queued
    let order = Order::pending(&buy("restored-1", dec!(1), dec!(100)), Utc::now());
    manual.reconcile.propose(LocalMutation::Track(order)).await?;
    assert_eq!(manual.manager.cancel(&id).await?, CancelOutcome::Canceled);
    assert_eq!(manual.manager.sweep().await.requeued, 0);

    let reader = manual.drain().await?;
    assert_eq!(paper.accepted_orders(), 0);
    assert_eq!(reader.order(&id).map(|o| o.status), Some(OrderStatus::Canceled));
    Ok(())
}

#[tokio::test]
async fn order_closed_while_queued_is_not_sent() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let manual = Manual::new(&paper).await;
    let id = ClientOrderId::from("closed-1");

    let order = Order::pending(&buy("closed-1", dec!(1), dec!(100)), Utc::now());
    manual.reconcile.propose(LocalMutation::Track(order)).await?;
    assert_eq!(manual.manager.sweep().await.requeued, 1);
    // closed by another writer while it waits in the queue
    manual
        .reconcile
        .propose(LocalMutation::Canceled { client_id: id.clone() })
        .await?;

    let reader = manual.drain().await?;
    assert_eq!(paper.accepted_orders(), 0);
    assert_eq!(reader.order(&id).map(|o| o.status), Some(OrderStatus::Canceled));
    Ok(())
}
