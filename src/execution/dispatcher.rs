//! Command Dispatcher - Rate-limited, retrying path to the exchange
//!
//! Transient failures (network, throttling, timeouts) are retried with
//! backoff under the same client order id. Anything else is returned to the
//! caller on the first occurrence. Commands for the same order are sent one
//! at a time, in the order they were dispatched.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::DispatcherConfig;
use crate::core::{ClientOrderId, Command, CommandResponse, Error, Result, Transport};
use crate::execution::backoff::BackoffPolicy;
use crate::execution::rate_limit::RequestLimiter;

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Requests handed to the transport, retries included
    pub sent: u64,
    pub retried: u64,
    /// Commands that ultimately failed
    pub failed: u64,
}

type OrderLock = Arc<tokio::sync::Mutex<()>>;

/// Command dispatcher
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    limiter: RequestLimiter,
    backoff: BackoffPolicy,
    request_timeout: Duration,
    order_locks: Mutex<HashMap<ClientOrderId, OrderLock>>,
    counters: Counters,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn Transport>, config: &DispatcherConfig) -> Self {
        Self {
            transport,
            limiter: RequestLimiter::from_config(config),
            backoff: BackoffPolicy::from(config),
            request_timeout: config.request_timeout(),
            order_locks: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Send a command, retrying transient failures.
    ///
    /// Returns the exchange response, or the first non-transient error, or the
    /// last transient error once attempts are exhausted.
    pub async fn dispatch(&self, command: Command) -> Result<CommandResponse> {
        let lock = command.client_id().map(|id| self.order_lock(id));
        let guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let result = self.send_with_retry(&command).await;

        drop(guard);
        if let (Some(id), Some(lock)) = (command.client_id(), lock) {
            self.release_order_lock(id, lock);
        }
        if result.is_err() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// One throttled attempt, no retries. Callers that run their own retry
    /// schedule (resync) still share the token bucket.
    pub async fn send_once(&self, command: Command, timeout: Duration) -> Result<CommandResponse> {
        self.limiter.acquire().await;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(timeout, self.transport.send_command(command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    async fn send_with_retry(&self, command: &Command) -> Result<CommandResponse> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.send_once(command.clone(), self.request_timeout).await;

            let err = match outcome {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            if !err.is_transient() {
                debug!("{} {:?} failed permanently: {}", command.label(), command.client_id(), err);
                return Err(err);
            }
            if self.backoff.exhausted(attempt) {
                warn!(
                    "{} {:?} gave up after {} attempts: {}",
                    command.label(),
                    command.client_id(),
                    attempt,
                    err
                );
                return Err(err);
            }

            let delay = self.backoff.delay_with_hint(attempt, err.retry_after());
            warn!(
                "{} {:?} attempt {} failed ({}), retrying in {:?}",
                command.label(),
                command.client_id(),
                attempt,
                err,
                delay
            );
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        }
    }

    fn order_lock(&self, client_id: &ClientOrderId) -> OrderLock {
        self.order_locks
            .lock()
            .entry(client_id.clone())
            .or_default()
            .clone()
    }

    fn release_order_lock(&self, client_id: &ClientOrderId, lock: OrderLock) {
        let mut locks = self.order_locks.lock();
        drop(lock);
        // Only the map still holds it: nobody is waiting
        if locks.get(client_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(client_id);
        }
    }
}
