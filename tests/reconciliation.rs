//! Feed gaps, duplicates and connectivity loss against the paper exchange

mod common;

use aleph_ledger::core::{ClientOrderId, OrderIntent, OrderStatus, Side, StreamId, Symbol};
use aleph_ledger::engine::SubmitReceipt;
use aleph_ledger::exchanges::{BALANCES_STREAM, ORDERS_STREAM};
use common::*;
use rust_decimal_macros::dec;

#[tokio::test]
async fn unresolved_gap_is_repaired_by_resync() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;
    let startup_resyncs = engine.reconcile_counts().resyncs;

    let intent = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(10), dec!(100)).with_client_id("gap-1");
    engine.submit(intent).await?;
    wait_for_order(&engine, "gap-1", status_is(OrderStatus::Acknowledged)).await;

    // orders stream: NEW #1, fills #2..#5 with #3 never delivered
    let id = ClientOrderId::from("gap-1");
    paper.fill(&id, dec!(2), dec!(100))?;
    paper.drop_next(ORDERS_STREAM, 1);
    paper.fill(&id, dec!(3), dec!(100))?;
    paper.fill(&id, dec!(1), dec!(100))?;
    paper.fill(&id, dec!(4), dec!(100))?;

    let orders = StreamId::new(ORDERS_STREAM);
    let state = engine
        .wait_until(WAIT, |s| {
            s.cursor(&orders) == 5 && s.order(&id).is_some_and(|o| o.status == OrderStatus::Filled)
        })
        .await?;
    assert_eq!(state.order(&id).map(|o| o.filled_quantity), Some(dec!(10)));
    assert_eq!(state.net_position(&Symbol::new("BTCUSDT")), dec!(10));
    assert_matches_exchange(&state, &paper);

    let counts = engine.reconcile_counts();
    assert!(counts.buffered >= 2);
    assert!(counts.resyncs > startup_resyncs);
    assert_eq!(counts.failed_resyncs, 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_deliveries_are_applied_once() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;
    paper.set_duplicate_delivery(true);

    let intent = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(4), dec!(100)).with_client_id("twice-1");
    engine.submit(intent).await?;
    wait_for_order(&engine, "twice-1", status_is(OrderStatus::Acknowledged)).await;
    paper.fill(&ClientOrderId::from("twice-1"), dec!(4), dec!(95))?;

    let balances = StreamId::new(BALANCES_STREAM);
    let state = engine
        .wait_until(WAIT, |s| s.cursor(&balances) == 2 && quote_balance(s) == (dec!(9620), dec!(0)))
        .await?;
    assert_eq!(state.net_position(&Symbol::new("BTCUSDT")), dec!(4));
    assert_matches_exchange(&state, &paper);
    assert!(engine.reconcile_counts().duplicates >= 4);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn malformed_messages_leave_state_untouched() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;
    let before = engine.reader().snapshot();

    paper.inject_raw(ORDERS_STREAM, "{not json");
    paper.inject_raw(BALANCES_STREAM, r#"{"seq": 1, "data": {"e": "balanceUpdate", "a": "USDT"}}"#);
    let engine_ref = &engine;
    tokio::time::timeout(WAIT, async move {
        while engine_ref.normalizer_counts().malformed < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await?;

    let after = engine.reader().snapshot();
    assert_eq!(after.balances, before.balances);
    assert_eq!(after.cursors, before.cursors);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failed_resync_halts_until_resumed() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;

    // every attempt of the next resync fails
    paper.fail_snapshots(3);
    engine.request_resync("operator check").await?;
    let state = engine.wait_until(WAIT, |s| s.is_halted()).await?;
    assert!(
        state
            .halted
            .as_ref()
            .is_some_and(|h| h.reason.contains("operator check"))
    );
    assert_eq!(engine.reconcile_counts().failed_resyncs, 1);

    let intent = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(1), dec!(100)).with_client_id("halted-1");
    assert!(matches!(engine.submit(intent).await?, SubmitReceipt::Rejected { .. }));
    assert_eq!(paper.accepted_orders(), 0);

    engine.resume().await?;
    engine.wait_until(WAIT, |s| !s.is_halted()).await?;

    let intent = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(1), dec!(100)).with_client_id("resumed-1");
    assert!(matches!(engine.submit(intent).await?, SubmitReceipt::Queued(_)));
    wait_for_order(&engine, "resumed-1", status_is(OrderStatus::Acknowledged)).await;

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn connection_loss_resyncs_after_reconnect() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let engine = start(&test_config(), &paper, None).await;

    let intent = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(2), dec!(100)).with_client_id("conn-1");
    engine.submit(intent).await?;
    wait_for_order(&engine, "conn-1", status_is(OrderStatus::Acknowledged)).await;

    paper.disconnect("maintenance");
    // snapshots fail while disconnected, so the resync gives up and halts
    engine.wait_until(WAIT, |s| s.is_halted() && !s.connected).await?;

    // activity the engine cannot see until it resyncs
    paper.drop_next(ORDERS_STREAM, 1);
    paper.drop_next(BALANCES_STREAM, 1);
    paper.fill(&ClientOrderId::from("conn-1"), dec!(2), dec!(100))?;

    let resyncs = engine.reconcile_counts().resyncs;
    paper.reconnect();
    let state = engine
        .wait_until(WAIT, |s| {
            s.order(&ClientOrderId::from("conn-1"))
                .is_some_and(|o| o.status == OrderStatus::Filled)
        })
        .await?;
    assert!(engine.reconcile_counts().resyncs > resyncs);
    assert_matches_exchange(&state, &paper);
    // a successful resync does not lift the halt by itself
    assert!(state.is_halted());

    engine.resume().await?;
    engine.wait_until(WAIT, |s| !s.is_halted()).await?;

    engine.shutdown().await;
    Ok(())
}
