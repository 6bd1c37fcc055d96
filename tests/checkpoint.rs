//! Checkpoints and restarts

mod common;

use std::sync::Arc;

use aleph_ledger::core::{ClientOrderId, OrderIntent, OrderStatus, Side, Symbol};
use aleph_ledger::exchanges::PaperExchange;
use aleph_ledger::storage::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use common::*;
use rust_decimal_macros::dec;

#[tokio::test]
async fn restart_replays_what_was_missed() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let paper = Arc::new(PaperExchange::new(paper_config()).with_replay(true));
    let config = test_config();
    let id = ClientOrderId::from("restart-1");

    {
        let store = FileCheckpointStore::open(dir.path())?;
        let engine = start(&config, &paper, Some(Arc::new(store))).await;
        let intent = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(4), dec!(100)).with_client_id("restart-1");
        engine.submit(intent).await?;
        wait_for_order(&engine, "restart-1", status_is(OrderStatus::Acknowledged)).await;
        paper.fill(&id, dec!(1), dec!(100))?;
        wait_for_order(&engine, "restart-1", |o| o.filled_quantity == dec!(1)).await;
        engine.shutdown().await;
    }

    // the exchange keeps trading while the engine is down
    paper.fill(&id, dec!(3), dec!(100))?;

    let store = FileCheckpointStore::open(dir.path())?;
    let saved = store.load()?.expect("checkpoint written on shutdown");
    assert_eq!(saved.order(&id).map(|o| o.filled_quantity), Some(dec!(1)));

    let engine = start(&config, &paper, Some(Arc::new(store))).await;
    let order = wait_for_order(&engine, "restart-1", status_is(OrderStatus::Filled)).await;
    assert_eq!(order.filled_quantity, dec!(4));
    let state = engine
        .wait_until(WAIT, |s| quote_balance(s) == (dec!(9600), dec!(0)))
        .await?;
    assert_eq!(state.net_position(&Symbol::new("BTCUSDT")), dec!(4));
    assert_matches_exchange(&state, &paper);
    // caught up from the stream alone
    assert_eq!(engine.reconcile_counts().resyncs, 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn restart_without_replay_resyncs() -> anyhow::Result<()> {
    init_tracing();
    let paper = paper();
    let config = test_config();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let id = ClientOrderId::from("noreplay-1");

    let engine = start(&config, &paper, Some(checkpoints.clone())).await;
    let intent = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(2), dec!(100)).with_client_id("noreplay-1");
    engine.submit(intent).await?;
    wait_for_order(&engine, "noreplay-1", status_is(OrderStatus::Acknowledged)).await;
    engine.checkpoint().await?;
    engine.shutdown().await;

    paper.fill(&id, dec!(2), dec!(100))?;

    let engine = start(&config, &paper, Some(checkpoints.clone())).await;
    let order = wait_for_order(&engine, "noreplay-1", status_is(OrderStatus::Filled)).await;
    let saved = checkpoints.load()?.expect("checkpoint");
    assert_eq!(Some(order.created_at), saved.order(&id).map(|o| o.created_at));
    assert!(engine.reconcile_counts().resyncs >= 1);
    assert_matches_exchange(&engine.reader().snapshot(), &paper);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn periodic_checkpoints_track_published_state() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let paper = paper();
    let mut config = test_config();
    config.reconciliation.checkpoint_interval_ms = 20;
    let store = Arc::new(FileCheckpointStore::open(dir.path())?);

    let engine = start(&config, &paper, Some(store.clone())).await;
    let intent = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(1), dec!(100)).with_client_id("periodic-1");
    engine.submit(intent).await?;
    wait_for_order(&engine, "periodic-1", status_is(OrderStatus::Acknowledged)).await;

    let id = ClientOrderId::from("periodic-1");
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let saved = store.load()?;
        if saved.as_ref().and_then(|s| s.order(&id)).is_some_and(|o| o.status == OrderStatus::Acknowledged) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no checkpoint with the acknowledged order");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // another engine may not share the directory
    assert!(FileCheckpointStore::open(dir.path()).is_err());

    engine.shutdown().await;
    Ok(())
}
