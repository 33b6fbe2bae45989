// ABOUTME: Durable message bus with independent inbound and outbound processing loops.
// ABOUTME: Applies publish-time flow control, dispatches to handlers under a timeout, and resolves retry/dead-letter.

use crate::config::BusConfig;
use crate::event::{Direction, Envelope, InboundEvent, OutboundEvent};
use crate::metrics;
use crate::queue::{
    NewMessage, QueueMessage, QueueStats, QueueStatus, QueueStore, RecoveryReport, ReplayOutcome,
};
use crate::rate_limit::RateLimiter;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Consumer of inbound events (typically the conversation router)
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_inbound(&self, event: InboundEvent) -> Result<()>;
}

/// Consumer of outbound events (typically a channel adapter)
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    async fn handle_outbound(&self, event: OutboundEvent) -> Result<()>;
}

#[async_trait]
impl<F, Fut> InboundHandler for F
where
    F: Fn(InboundEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle_inbound(&self, event: InboundEvent) -> Result<()> {
        (self)(event).await
    }
}

#[async_trait]
impl<F, Fut> OutboundHandler for F
where
    F: Fn(OutboundEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle_outbound(&self, event: OutboundEvent) -> Result<()> {
        (self)(event).await
    }
}

/// How flow control treated a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Accepted with `available_at` pushed out because the queue is overloaded
    Deferred,
    /// Idempotency key already bound; nothing was written
    Duplicate,
    /// Dead-lettered on arrival: the direction's backlog ceiling was reached
    RejectedBacklog,
    /// Dead-lettered on arrival: the conversation exceeded its rate-limit window
    RejectedRateLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub queue_id: String,
    pub inserted: bool,
    pub status: QueueStatus,
    pub admission: Admission,
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<CancellationToken>,
    loops: Vec<JoinHandle<()>>,
}

struct BusInner {
    store: QueueStore,
    config: BusConfig,
    limiter: RateLimiter,
    inbound_handlers: RwLock<Vec<Arc<dyn InboundHandler>>>,
    outbound_handlers: RwLock<Vec<Arc<dyn OutboundHandler>>>,
    inbound_wake: Notify,
    outbound_wake: Notify,
    lifecycle: Mutex<Lifecycle>,
}

/// Cloneable handle to the bus; all clones share one set of loops and handlers
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    pub fn new(store: QueueStore, config: BusConfig) -> Self {
        let limiter = RateLimiter::new(
            config.rate_limit_window(),
            config.rate_limit_max,
            config.rate_limit_max_keys,
        );
        Self {
            inner: Arc::new(BusInner {
                store,
                config,
                limiter,
                inbound_handlers: RwLock::new(Vec::new()),
                outbound_handlers: RwLock::new(Vec::new()),
                inbound_wake: Notify::new(),
                outbound_wake: Notify::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.inner.store
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Register an inbound handler; handlers run in registration order
    pub fn on_inbound(&self, handler: Arc<dyn InboundHandler>) {
        match self.inner.inbound_handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(e) => tracing::error!(error = %e, "Inbound handler list poisoned"),
        }
        self.wake(Direction::Inbound);
    }

    /// Register an outbound handler; handlers run in registration order
    pub fn on_outbound(&self, handler: Arc<dyn OutboundHandler>) {
        match self.inner.outbound_handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(e) => tracing::error!(error = %e, "Outbound handler list poisoned"),
        }
        self.wake(Direction::Outbound);
    }

    fn handler_count(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self
                .inner
                .inbound_handlers
                .read()
                .map(|h| h.len())
                .unwrap_or(0),
            Direction::Outbound => self
                .inner
                .outbound_handlers
                .read()
                .map(|h| h.len())
                .unwrap_or(0),
        }
    }

    /// Nudge a direction's loop to poll now instead of waiting out the interval
    pub fn wake(&self, direction: Direction) {
        match direction {
            Direction::Inbound => self.inner.inbound_wake.notify_one(),
            Direction::Outbound => self.inner.outbound_wake.notify_one(),
        }
    }

    fn wake_signal(&self, direction: Direction) -> &Notify {
        match direction {
            Direction::Inbound => &self.inner.inbound_wake,
            Direction::Outbound => &self.inner.outbound_wake,
        }
    }

    // ─── Publish ────────────────────────────────────────────────

    pub fn publish_inbound(&self, event: InboundEvent) -> Result<PublishOutcome> {
        self.publish(Envelope::Inbound(event))
    }

    pub fn publish_outbound(&self, event: OutboundEvent) -> Result<PublishOutcome> {
        self.publish(Envelope::Outbound(event))
    }

    /// Admit an event through flow control and persist it.
    ///
    /// Order of checks: duplicate key, hard backlog ceiling, per-conversation
    /// rate limit, then soft overload deferral. Rejected events are stored as
    /// dead-letter rows so an operator can inspect and replay them.
    pub fn publish(&self, envelope: Envelope) -> Result<PublishOutcome> {
        let cfg = &self.inner.config;
        let store = &self.inner.store;
        let direction = envelope.direction();
        let conversation = envelope.conversation_key();
        let key = envelope.idempotency_key();
        let now = Utc::now();

        if let Some(existing) = store.find_by_idempotency_key(direction, &key)? {
            metrics::record_duplicate(direction);
            tracing::debug!(
                queue_id = %existing.queue_id,
                idempotency_key = %key,
                "Duplicate publish ignored"
            );
            return Ok(PublishOutcome {
                queue_id: existing.queue_id,
                inserted: false,
                status: existing.status,
                admission: Admission::Duplicate,
            });
        }

        let mut msg = NewMessage::new(direction, envelope.encode()?, cfg.max_attempts).with_key(&key);
        let active = store.count_active(direction)?;
        let ceiling = match direction {
            Direction::Inbound => cfg.max_pending_inbound,
            Direction::Outbound => cfg.max_pending_outbound,
        };

        if active >= ceiling {
            let reason = format!(
                "backlog limit reached: {} {} messages pending or processing (limit {})",
                active, direction, ceiling
            );
            return self.reject(&msg, reason, Admission::RejectedBacklog, "backlog", now);
        }

        if !self.inner.limiter.try_acquire(direction, &conversation) {
            let reason = format!(
                "rate limit exceeded for {}: more than {} messages per {}ms",
                conversation, cfg.rate_limit_max, cfg.rate_limit_window_ms
            );
            return self.reject(&msg, reason, Admission::RejectedRateLimit, "rate_limit", now);
        }

        let mut admission = Admission::Accepted;
        if active > cfg.overload_threshold {
            msg.available_at = Some(now + Duration::milliseconds(cfg.overload_backoff_ms as i64));
            admission = Admission::Deferred;
            metrics::record_deferred(direction);
            tracing::warn!(
                direction = %direction,
                active,
                threshold = cfg.overload_threshold,
                backoff_ms = cfg.overload_backoff_ms,
                "Queue overloaded, deferring message"
            );
        }

        let outcome = store.enqueue(&msg, now)?;
        if !outcome.inserted {
            metrics::record_duplicate(direction);
            admission = Admission::Duplicate;
        } else {
            metrics::record_published(direction);
            tracing::debug!(
                queue_id = %outcome.queue_id,
                direction = %direction,
                conversation = %conversation,
                "Message published"
            );
            self.wake(direction);
        }

        Ok(PublishOutcome {
            queue_id: outcome.queue_id,
            inserted: outcome.inserted,
            status: outcome.status,
            admission,
        })
    }

    fn reject(
        &self,
        msg: &NewMessage,
        reason: String,
        admission: Admission,
        label: &'static str,
        now: chrono::DateTime<Utc>,
    ) -> Result<PublishOutcome> {
        let outcome = self.inner.store.enqueue_dead_letter(msg, &reason, now)?;
        metrics::record_rejected(msg.direction, label);
        tracing::warn!(
            queue_id = %outcome.queue_id,
            direction = %msg.direction,
            reason = %reason,
            "Message dead-lettered on arrival"
        );
        Ok(PublishOutcome {
            queue_id: outcome.queue_id,
            inserted: outcome.inserted,
            status: outcome.status,
            admission: if outcome.inserted {
                admission
            } else {
                Admission::Duplicate
            },
        })
    }

    // ─── Lifecycle ──────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.inner
            .lifecycle
            .lock()
            .map(|lc| lc.shutdown.is_some())
            .unwrap_or(false)
    }

    /// Recover stale `processing` rows, then spawn both loops and the periodic stale sweep.
    /// Calling it again while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock()
            .map_err(|e| anyhow::anyhow!("Bus lifecycle mutex poisoned: {}", e))?;
        if lifecycle.shutdown.is_some() {
            return Ok(());
        }

        let report = self.recover_stale()?;
        tracing::info!(
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            "Stale processing recovery complete"
        );

        let token = CancellationToken::new();
        for direction in Direction::ALL {
            let bus = self.clone();
            let token = token.clone();
            lifecycle
                .loops
                .push(tokio::spawn(async move { bus.run_loop(direction, token).await }));
        }
        let bus = self.clone();
        let sweep_token = token.clone();
        lifecycle
            .loops
            .push(tokio::spawn(async move { bus.recovery_loop(sweep_token).await }));
        lifecycle.shutdown = Some(token);

        tracing::info!(
            poll_interval_ms = self.inner.config.poll_interval_ms,
            batch_size = self.inner.config.batch_size,
            "Message bus started"
        );
        Ok(())
    }

    /// Ask both loops to exit and wait for them. In-flight handlers are not aborted;
    /// they are bounded only by the per-message timeout.
    pub async fn stop(&self) {
        let (token, loops) = match self.inner.lifecycle.lock() {
            Ok(mut lifecycle) => (lifecycle.shutdown.take(), std::mem::take(&mut lifecycle.loops)),
            Err(e) => {
                tracing::error!(error = %e, "Bus lifecycle mutex poisoned");
                return;
            }
        };
        let Some(token) = token else {
            return;
        };

        token.cancel();
        for direction in Direction::ALL {
            self.wake(direction);
        }
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Bus loop ended abnormally");
            }
        }
        tracing::info!("Message bus stopped");
    }

    /// Requeue or dead-letter rows whose claim is older than the processing timeout
    pub fn recover_stale(&self) -> Result<RecoveryReport> {
        self.recover_claims_older_than(self.inner.config.processing_timeout_ms)
    }

    fn recover_claims_older_than(&self, age_ms: u64) -> Result<RecoveryReport> {
        let cfg = &self.inner.config;
        let now = Utc::now();
        let stale_before = now - Duration::milliseconds(age_ms as i64);
        let report =
            self.inner
                .store
                .recover_stale_processing(stale_before, cfg.retry_base_ms, now)?;
        if report.total() > 0 {
            metrics::record_stale_recovered(report.total());
            for direction in Direction::ALL {
                self.wake(direction);
            }
        }
        Ok(report)
    }

    /// Periodic stale sweep while running. Uses twice the processing timeout so a
    /// row whose handler is still inside its own timeout is never reclaimed.
    async fn recovery_loop(&self, shutdown: CancellationToken) {
        let timeout = self.inner.config.processing_timeout();
        let mut ticker = tokio::time::interval(timeout.max(std::time::Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // start() already ran a sweep
        ticker.tick().await;

        let age_ms = self.inner.config.processing_timeout_ms.saturating_mul(2);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.recover_claims_older_than(age_ms) {
                        Ok(report) if report.total() > 0 => tracing::info!(
                            requeued = report.requeued,
                            dead_lettered = report.dead_lettered,
                            "Recovered stale processing rows"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Stale processing sweep failed"),
                    }
                }
            }
        }
    }

    async fn run_loop(&self, direction: Direction, shutdown: CancellationToken) {
        tracing::debug!(direction = %direction, "Bus loop started");
        let poll_interval = self.inner.config.poll_interval();
        let batch_size = self.inner.config.batch_size;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let handled = match self.drain_once(direction).await {
                Ok(handled) => handled,
                Err(e) => {
                    tracing::error!(direction = %direction, error = %e, "Bus iteration failed");
                    0
                }
            };
            // A full batch likely means more is due; go again without waiting.
            if handled >= batch_size {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake_signal(direction).notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        tracing::debug!(direction = %direction, "Bus loop exited");
    }

    // ─── Processing ─────────────────────────────────────────────

    /// Process one due batch for a direction, oldest first. Returns the number
    /// of rows this call claimed and resolved. Rows stay pending while no
    /// handler is registered for the direction.
    pub async fn drain_once(&self, direction: Direction) -> Result<usize> {
        if self.handler_count(direction) == 0 {
            return Ok(0);
        }
        let batch =
            self.inner
                .store
                .list_due(direction, Utc::now(), self.inner.config.batch_size)?;
        let mut handled = 0;
        for row in batch {
            if self.process_row(row).await? {
                handled += 1;
            }
        }
        Ok(handled)
    }

    async fn process_row(&self, row: QueueMessage) -> Result<bool> {
        let store = &self.inner.store;
        if !store.claim(&row.id, Utc::now())? {
            tracing::debug!(queue_id = %row.id, "Lost claim race, skipping");
            return Ok(false);
        }

        let envelope = match Envelope::decode(row.direction, &row.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let error = format!("invalid payload: {:#}", e);
                store.mark_dead_letter(&row.id, row.attempts + 1, &error, Utc::now())?;
                metrics::record_dead_lettered(row.direction);
                tracing::error!(queue_id = %row.id, error = %error, "Undecodable message dead-lettered");
                return Ok(true);
            }
        };

        let timeout = self.inner.config.processing_timeout();
        let error = match tokio::time::timeout(timeout, self.dispatch(envelope)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some(format!(
                "handler timed out after {}ms",
                self.inner.config.processing_timeout_ms
            )),
        };
        self.resolve(&row, error)?;
        Ok(true)
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        match envelope {
            Envelope::Inbound(event) => {
                let handlers = self
                    .inner
                    .inbound_handlers
                    .read()
                    .map_err(|e| anyhow::anyhow!("Inbound handler list poisoned: {}", e))?
                    .clone();
                for handler in handlers {
                    handler.handle_inbound(event.clone()).await?;
                }
            }
            Envelope::Outbound(event) => {
                let handlers = self
                    .inner
                    .outbound_handlers
                    .read()
                    .map_err(|e| anyhow::anyhow!("Outbound handler list poisoned: {}", e))?
                    .clone();
                for handler in handlers {
                    handler.handle_outbound(event.clone()).await?;
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, row: &QueueMessage, error: Option<String>) -> Result<()> {
        let store = &self.inner.store;
        let now = Utc::now();

        let Some(error) = error else {
            store.mark_processed(&row.id, now)?;
            metrics::record_processed(row.direction);
            tracing::debug!(queue_id = %row.id, direction = %row.direction, "Message processed");
            return Ok(());
        };

        let attempts = row.attempts + 1;
        if attempts >= row.max_attempts {
            store.mark_dead_letter(&row.id, attempts, &error, now)?;
            metrics::record_dead_lettered(row.direction);
            tracing::error!(
                queue_id = %row.id,
                direction = %row.direction,
                attempts,
                error = %error,
                "Message dead-lettered after exhausting retries"
            );
        } else {
            let delay_ms = self.inner.config.retry_delay_ms(attempts);
            let available_at = now + Duration::milliseconds(delay_ms as i64);
            store.mark_retry(&row.id, attempts, available_at, &error, now)?;
            metrics::record_retried(row.direction);
            tracing::warn!(
                queue_id = %row.id,
                direction = %row.direction,
                attempts,
                max_attempts = row.max_attempts,
                delay_ms,
                error = %error,
                "Handler failed, scheduling retry"
            );
        }
        Ok(())
    }

    // ─── Operator surface ───────────────────────────────────────

    pub fn list_dead_letter(
        &self,
        direction: Option<Direction>,
        limit: usize,
    ) -> Result<Vec<QueueMessage>> {
        self.inner.store.list_dead_letter(direction, limit)
    }

    pub fn replay_dead_letter(&self, id: &str) -> Result<ReplayOutcome> {
        let outcome = self.inner.store.replay_dead_letter(id, Utc::now())?;
        self.after_replay(&outcome);
        Ok(outcome)
    }

    pub fn replay_dead_letter_batch(
        &self,
        direction: Option<Direction>,
        limit: usize,
    ) -> Result<ReplayOutcome> {
        let outcome = self
            .inner
            .store
            .replay_dead_letter_batch(direction, limit, Utc::now())?;
        self.after_replay(&outcome);
        Ok(outcome)
    }

    fn after_replay(&self, outcome: &ReplayOutcome) {
        if outcome.replayed == 0 {
            return;
        }
        metrics::record_replayed(outcome.replayed);
        tracing::info!(replayed = outcome.replayed, "Dead-letter rows replayed");
        for direction in Direction::ALL {
            self.wake(direction);
        }
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.inner.store.stats()
    }
}
