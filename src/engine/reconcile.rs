//! Reconciliation Loop - Single writer of the State Store
//!
//! Consumes normalized events in per-stream sequence order, buffers events
//! that arrive ahead of a gap, and falls back to a full snapshot resync when a
//! gap is not filled in time, the connection drops, or a reducer reports that
//! local state contradicts the exchange. Local mutations from the lifecycle
//! manager go through the same inbox so there is exactly one writer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::config::ReconcileConfig;
use crate::core::{Command, CommandResponse, Error, ExchangeSnapshot, Result, StreamId};
use crate::engine::state::{Applied, LocalMutation, StateStore};
use crate::execution::CommandDispatcher;
use crate::feeds::{EventKind, NormalizedEvent};
use crate::storage::CheckpointStore;

/// Everything the loop can be asked to do
#[derive(Debug)]
pub enum EngineInput {
    Event(NormalizedEvent),
    Local {
        mutation: LocalMutation,
        ack: Option<oneshot::Sender<Applied>>,
    },
    Resync {
        reason: String,
    },
    /// Clear a trading halt and resync
    Resume,
    Checkpoint {
        ack: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

#[derive(Debug, Default)]
pub struct ReconcileStats {
    applied: AtomicU64,
    duplicates: AtomicU64,
    buffered: AtomicU64,
    divergences: AtomicU64,
    resyncs: AtomicU64,
    failed_resyncs: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub applied: u64,
    pub duplicates: u64,
    pub buffered: u64,
    pub divergences: u64,
    pub resyncs: u64,
    pub failed_resyncs: u64,
}

impl ReconcileStats {
    pub fn counts(&self) -> ReconcileCounts {
        ReconcileCounts {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            divergences: self.divergences.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            failed_resyncs: self.failed_resyncs.load(Ordering::Relaxed),
        }
    }
}

/// Sender side of the loop's inbox
#[derive(Debug, Clone)]
pub struct ReconcileHandle {
    tx: mpsc::Sender<EngineInput>,
    stats: Arc<ReconcileStats>,
}

fn stopped() -> Error {
    Error::InvalidState("reconciliation loop stopped".into())
}

impl ReconcileHandle {
    pub async fn push_event(&self, event: NormalizedEvent) -> Result<()> {
        self.tx.send(EngineInput::Event(event)).await.map_err(|_| stopped())
    }

    /// Apply a local mutation and wait until the writer has applied it
    pub async fn propose(&self, mutation: LocalMutation) -> Result<Applied> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(EngineInput::Local {
                mutation,
                ack: Some(ack),
            })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn request_resync(&self, reason: impl Into<String>) -> Result<()> {
        self.tx
            .send(EngineInput::Resync {
                reason: reason.into(),
            })
            .await
            .map_err(|_| stopped())
    }

    pub async fn resume(&self) -> Result<()> {
        self.tx.send(EngineInput::Resume).await.map_err(|_| stopped())
    }

    pub async fn checkpoint(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(EngineInput::Checkpoint { ack })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineInput::Shutdown).await;
    }

    pub fn counts(&self) -> ReconcileCounts {
        self.stats.counts()
    }
}

/// Out-of-order events waiting for a gap to close
#[derive(Debug, Default)]
struct StreamBuffer {
    pending: BTreeMap<u64, NormalizedEvent>,
    gap_since: Option<Instant>,
}

/// How the loop brings itself up to date when it starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    /// Fetch a full snapshot
    Resync,
    /// Restored from a checkpoint; ask the exchange to replay past our cursors
    Replay,
}

pub struct ReconciliationLoop {
    store: StateStore,
    dispatcher: Arc<CommandDispatcher>,
    config: ReconcileConfig,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    buffers: HashMap<StreamId, StreamBuffer>,
    stats: Arc<ReconcileStats>,
    pending_resync: Option<String>,
    /// Set on connection loss, cleared by a successful resync
    stale: bool,
}

impl ReconciliationLoop {
    pub fn new(
        store: StateStore,
        dispatcher: Arc<CommandDispatcher>,
        config: ReconcileConfig,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            checkpoints,
            buffers: HashMap::new(),
            stats: Arc::new(ReconcileStats::default()),
            pending_resync: None,
            stale: false,
        }
    }

    /// Create the inbox; the handle is cloneable and may outlive the loop
    pub fn channel(&self) -> (ReconcileHandle, mpsc::Receiver<EngineInput>) {
        let (tx, rx) = mpsc::channel(self.config.inbox_capacity.max(1));
        (
            ReconcileHandle {
                tx,
                stats: self.stats.clone(),
            },
            rx,
        )
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run until `Shutdown` or until every handle is dropped.
    /// Checkpoints once more on the way out.
    pub async fn run(mut self, bootstrap: Bootstrap, mut inbox: mpsc::Receiver<EngineInput>) {
        self.bootstrap(bootstrap).await;
        self.store.publish();

        let mut gap_tick = tokio::time::interval(self.config.gap_check_interval());
        gap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let checkpoint_every = self.config.checkpoint_interval();
        let mut checkpoint_tick =
            tokio::time::interval(checkpoint_every.unwrap_or(std::time::Duration::from_secs(3600)));
        checkpoint_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        checkpoint_tick.reset();

        info!("Reconciliation loop running");
        loop {
            tokio::select! {
                input = inbox.recv() => match input {
                    Some(EngineInput::Shutdown) | None => break,
                    Some(input) => self.handle(input).await,
                },
                _ = gap_tick.tick() => self.check_gaps(),
                _ = checkpoint_tick.tick(), if checkpoint_every.is_some() => {
                    self.store.publish();
                    if let Err(e) = self.checkpoint() {
                        warn!("Periodic checkpoint failed: {}", e);
                    }
                }
            }

            if let Some(reason) = self.pending_resync.take() {
                self.resync(&reason).await;
            }
            self.store.publish();
        }

        self.store.publish();
        if let Err(e) = self.checkpoint() {
            error!("Final checkpoint failed: {}", e);
        }
        info!("Reconciliation loop stopped");
    }

    async fn bootstrap(&mut self, bootstrap: Bootstrap) {
        let transport = self.dispatcher.transport().clone();
        if bootstrap == Bootstrap::Replay && transport.supports_replay() {
            for stream in transport.streams() {
                let cursor = self.store.state().cursor(&stream);
                info!("Requesting replay of {} after {}", stream, cursor);
                if let Err(e) = transport.request_replay(&stream, cursor).await {
                    warn!("Replay of {} refused ({}), falling back to resync", stream, e);
                    self.resync("replay refused").await;
                    return;
                }
            }
            self.store.set_connected(true);
            return;
        }
        self.resync("startup").await;
    }

    async fn handle(&mut self, input: EngineInput) {
        match input {
            EngineInput::Event(event) => self.on_event(event).await,
            EngineInput::Local { mutation, ack } => {
                let applied = self.store.apply_local(mutation);
                // proposers must observe their own write
                self.store.publish();
                if let Some(ack) = ack {
                    let _ = ack.send(applied);
                }
            }
            EngineInput::Resync { reason } => self.pending_resync = Some(reason),
            EngineInput::Resume => {
                if self.store.apply_local(LocalMutation::Resume) == Applied::Changed {
                    info!("Trading resumed by operator");
                }
                self.pending_resync = Some("resume".into());
            }
            EngineInput::Checkpoint { ack } => {
                self.store.publish();
                let _ = ack.send(self.checkpoint());
            }
            EngineInput::Shutdown => {}
        }
    }

    async fn on_event(&mut self, event: NormalizedEvent) {
        if event.kind.is_connectivity() {
            self.store.apply_event(&event);
            match &event.kind {
                EventKind::ConnectionLost { reason } => {
                    warn!(
                        "Connection lost on {}: {}",
                        event.stream,
                        reason.as_deref().unwrap_or("no reason given")
                    );
                    self.stale = true;
                    self.pending_resync = Some("connection lost".into());
                }
                _ => {
                    info!("Connection restored on {}", event.stream);
                    if self.stale {
                        self.pending_resync = Some("connection restored".into());
                    }
                }
            }
            return;
        }

        let stream = event.stream.clone();
        let cursor = self.store.state().cursor(&stream);
        if event.sequence <= cursor {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!("Duplicate {} #{} (cursor {})", stream, event.sequence, cursor);
            return;
        }

        if event.sequence == cursor + 1 {
            self.apply(event);
            self.drain(&stream);
            return;
        }

        let buffer = self.buffers.entry(stream.clone()).or_default();
        if buffer.pending.contains_key(&event.sequence) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return;
        }
        debug!("Buffering {} #{} ahead of cursor {}", stream, event.sequence, cursor);
        buffer.pending.insert(event.sequence, event);
        self.stats.buffered.fetch_add(1, Ordering::Relaxed);

        if buffer.gap_since.is_none() {
            buffer.gap_since = Some(Instant::now());
            warn!("Sequence gap on {}: cursor {}", stream, cursor);
            let transport = self.dispatcher.transport().clone();
            if transport.supports_replay() {
                if let Err(e) = transport.request_replay(&stream, cursor).await {
                    warn!("Replay request for {} failed: {}", stream, e);
                }
            }
        }
    }

    fn apply(&mut self, event: NormalizedEvent) {
        match self.store.apply_event(&event) {
            Applied::Divergent(why) => {
                self.stats.divergences.fetch_add(1, Ordering::Relaxed);
                warn!("{} #{} diverges from local state: {}", event.stream, event.sequence, why);
                self.pending_resync = Some(Error::StateDivergence(why).to_string());
            }
            _ => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.store.set_cursor(&event.stream, event.sequence);
    }

    /// Apply buffered events that became contiguous
    fn drain(&mut self, stream: &StreamId) {
        loop {
            let cursor = self.store.state().cursor(stream);
            let Some(buffer) = self.buffers.get_mut(stream) else {
                return;
            };
            // Anything at or below the cursor is already covered
            while buffer
                .pending
                .first_key_value()
                .is_some_and(|(seq, _)| *seq <= cursor)
            {
                buffer.pending.pop_first();
            }
            let next = buffer.pending.first_key_value().map(|(seq, _)| *seq);
            match next {
                Some(seq) if seq == cursor + 1 => {
                    let event = buffer.pending.pop_first().map(|(_, event)| event);
                    if let Some(event) = event {
                        self.apply(event);
                    }
                }
                Some(_) => return,
                None => {
                    if buffer.gap_since.take().is_some() {
                        info!("Gap on {} closed at {}", stream, cursor);
                    }
                    return;
                }
            }
        }
    }

    fn check_gaps(&mut self) {
        let timeout = self.config.gap_timeout();
        for (stream, buffer) in &self.buffers {
            let Some(since) = buffer.gap_since else {
                continue;
            };
            if since.elapsed() < timeout {
                continue;
            }
            let received = buffer.pending.keys().next().copied().unwrap_or_default();
            let err = Error::SequenceGapUnresolved {
                stream: stream.to_string(),
                cursor: self.store.state().cursor(stream),
                received,
            };
            warn!("{} after {:?}", err, timeout);
            self.pending_resync = Some(err.to_string());
            return;
        }
    }

    async fn fetch_snapshot(&self) -> Result<ExchangeSnapshot> {
        match self
            .dispatcher
            .send_once(Command::FetchSnapshot, self.config.fetch_timeout())
            .await?
        {
            CommandResponse::Snapshot(snapshot) => Ok(snapshot),
            other => Err(Error::InvalidState(format!(
                "unexpected response to snapshot request: {:?}",
                other
            ))),
        }
    }

    /// Replace local state with the exchange's authoritative snapshot.
    /// Halts trading when every attempt fails.
    async fn resync(&mut self, reason: &str) {
        self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
        info!("Resyncing account state: {}", reason);
        let attempts = self.config.max_resync_attempts.max(1);

        for attempt in 1..=attempts {
            match self.fetch_snapshot().await {
                Ok(snapshot) => {
                    self.install(snapshot);
                    info!("Resync complete (attempt {})", attempt);
                    return;
                }
                Err(e) if attempt < attempts => {
                    warn!("Snapshot attempt {}/{} failed: {}", attempt, attempts, e);
                    tokio::time::sleep(self.config.resync_backoff()).await;
                }
                Err(e) => {
                    error!("Snapshot attempt {}/{} failed: {}", attempt, attempts, e);
                }
            }
        }

        self.stats.failed_resyncs.fetch_add(1, Ordering::Relaxed);
        let halt = format!("resync failed after {} attempts ({})", attempts, reason);
        error!("Halting trading: {}", halt);
        self.store.apply_local(LocalMutation::Halt { reason: halt });
    }

    fn install(&mut self, snapshot: ExchangeSnapshot) {
        self.store.replace(snapshot);
        self.store.set_connected(true);
        self.stale = false;
        let streams: Vec<StreamId> = self.buffers.keys().cloned().collect();
        for stream in streams {
            self.drain(&stream);
            if let Some(buffer) = self.buffers.get_mut(&stream) {
                if buffer.pending.is_empty() {
                    buffer.gap_since = None;
                } else {
                    // still ahead of the snapshot: a fresh gap
                    buffer.gap_since = Some(Instant::now());
                }
            }
        }
    }

    fn checkpoint(&self) -> Result<()> {
        match &self.checkpoints {
            Some(store) => store.save(self.store.state()),
            None => Ok(()),
        }
    }
}
