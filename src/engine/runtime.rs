//! Engine runtime - Wires the components into running tasks
//!
//! One task per exchange stream (normalize + forward), the reconciliation
//! loop as single writer, the lifecycle dispatch worker and sweeper, and an
//! optional strategy runner.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{ClientOrderId, Config, Error, OrderIntent, RawMessage, Result, StreamId, Transport};
use crate::engine::order::{CancelOutcome, OrderLifecycleManager, SubmitReceipt};
use crate::engine::reconcile::{Bootstrap, ReconcileCounts, ReconcileHandle, ReconciliationLoop};
use crate::engine::risk::RiskGate;
use crate::engine::state::{AccountState, StateReader, StateStore};
use crate::execution::{CommandDispatcher, DispatcherStats};
use crate::feeds::{EventNormalizer, NormalizerCounts};
use crate::storage::CheckpointStore;
use crate::strategies::StrategyRunner;

pub struct Engine;

impl Engine {
    /// Restore from the checkpoint store if it has state, start every task
    /// and return a handle. The first snapshot (or replay request) is issued
    /// before any feed event is applied.
    pub async fn start(
        config: &Config,
        transport: Arc<dyn Transport>,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
        strategies: StrategyRunner,
    ) -> Result<EngineHandle> {
        let recon_config = config.reconciliation.clone();
        let restored = match &checkpoints {
            Some(store) => store.load()?,
            None => None,
        };
        let (store, bootstrap) = match restored {
            Some(mut state) => {
                info!(
                    "Restored checkpoint v{} ({} orders, {} positions)",
                    state.version,
                    state.orders.len(),
                    state.positions.len()
                );
                state.connected = false;
                (
                    StateStore::restore(state, recon_config.recent_event_capacity),
                    Bootstrap::Replay,
                )
            }
            None => (StateStore::new(recon_config.recent_event_capacity), Bootstrap::Resync),
        };

        let dispatcher = Arc::new(CommandDispatcher::new(transport.clone(), &config.dispatcher));
        let reconciler = ReconciliationLoop::new(store, dispatcher.clone(), recon_config, checkpoints);
        let (reconcile, inbox) = reconciler.channel();
        let reader = reconciler.store().reader();

        let normalizer = Arc::new(EventNormalizer::new());
        let mut tasks = Vec::new();
        for stream in transport.streams() {
            let rx = transport.events(&stream)?;
            tasks.push(tokio::spawn(stream_worker(
                stream,
                rx,
                normalizer.clone(),
                reconcile.clone(),
            )));
        }

        let loop_task = tokio::spawn(reconciler.run(bootstrap, inbox));

        let (manager, queue) = OrderLifecycleManager::new(
            reader.clone(),
            reconcile.clone(),
            dispatcher.clone(),
            RiskGate::new(config.risk.clone()),
            config.orders.clone(),
        );
        tasks.push(tokio::spawn(manager.clone().run_dispatch(queue)));
        tasks.push(tokio::spawn(manager.clone().run_sweeper()));

        if !strategies.is_empty() {
            tasks.push(tokio::spawn(
                strategies.run(manager.clone(), config.strategy.decision_interval()),
            ));
        }

        info!("Engine started on {} ({} streams)", transport.name(), transport.streams().len());
        Ok(EngineHandle {
            reader,
            manager,
            reconcile,
            dispatcher,
            normalizer,
            loop_task,
            tasks,
        })
    }
}

async fn stream_worker(
    stream: StreamId,
    rx: flume::Receiver<RawMessage>,
    normalizer: Arc<EventNormalizer>,
    reconcile: ReconcileHandle,
) {
    debug!("Stream worker {} started", stream);
    while let Ok(raw) = rx.recv_async().await {
        let Some(event) = normalizer.normalize(&raw) else {
            continue;
        };
        if reconcile.push_event(event).await.is_err() {
            break;
        }
    }
    debug!("Stream worker {} stopped", stream);
}

/// Running engine
pub struct EngineHandle {
    reader: StateReader,
    manager: Arc<OrderLifecycleManager>,
    reconcile: ReconcileHandle,
    dispatcher: Arc<CommandDispatcher>,
    normalizer: Arc<EventNormalizer>,
    loop_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Read-only reporting view
    pub fn reader(&self) -> &StateReader {
        &self.reader
    }

    pub fn manager(&self) -> &Arc<OrderLifecycleManager> {
        &self.manager
    }

    pub async fn submit(&self, intent: OrderIntent) -> Result<SubmitReceipt> {
        self.manager.submit(intent).await
    }

    pub async fn cancel(&self, client_id: &ClientOrderId) -> Result<CancelOutcome> {
        self.manager.cancel(client_id).await
    }

    /// Clear a trading halt; a fresh resync follows
    pub async fn resume(&self) -> Result<()> {
        self.reconcile.resume().await
    }

    pub async fn request_resync(&self, reason: &str) -> Result<()> {
        self.reconcile.request_resync(reason).await
    }

    pub async fn checkpoint(&self) -> Result<()> {
        self.reconcile.checkpoint().await
    }

    pub fn normalizer_counts(&self) -> NormalizerCounts {
        self.normalizer.counts()
    }

    pub fn reconcile_counts(&self) -> ReconcileCounts {
        self.reconcile.counts()
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Poll published state until `ready` holds
    pub async fn wait_until<F>(&self, timeout: Duration, ready: F) -> Result<Arc<AccountState>>
    where
        F: Fn(&AccountState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.reader.snapshot();
            if ready(&state) {
                return Ok(state);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop producers first, then let the loop write its final checkpoint
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        futures::future::join_all(self.tasks).await;
        self.reconcile.shutdown().await;
        if let Err(e) = self.loop_task.await {
            warn!("Reconciliation loop ended abnormally: {}", e);
        }
        info!("Engine stopped");
    }
}
