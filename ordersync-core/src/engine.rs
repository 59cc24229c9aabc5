// Copyright 2025 Ordersync Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Sync engine orchestration.
//!
//! A [`SyncEngine`] keeps one derived store consistent with one source. It
//! runs two tasks:
//!
//! - a **supervisor** that opens a watch session, reconciles, then applies
//!   live changes until the session fails, and restarts with backoff;
//! - a **retry drain** that re-applies failed events on a fixed interval.
//!
//! # State machine
//!
//! ```text
//! Starting ─► Reconciling ─► Watching ─┐
//!                 ▲                    │ session error
//!                 │                    ▼
//!             Restarting ◄──────── Degraded ──► Stopped (restart limit)
//! ```
//!
//! The watch session is opened before reconciling, so changes made while
//! the reconciler runs are buffered by the session and applied afterwards.
//! This relies on every write being ordered by source cluster time: live,
//! retried and delete events carry the oplog position of their change, and
//! reconcile writes carry the cluster time read just before the scan. A
//! buffered change older than that position is already reflected by the
//! scan and is skipped as stale; a newer one wins over the reconcile write.
//!
//! [`SyncEngine::stop`] ends both tasks without draining the retry queue.
//! An engine that gave up after repeated session failures is `Stopped` and
//! can be started again without calling `stop` first.
//!
//! # Example
//!
//! ```rust
//! use ordersync_core::engine::{SyncEngine, SyncEngineConfig};
//! use ordersync_core::mapper::ProductCacheMapper;
//! use ordersync_core::source::MockSource;
//! use ordersync_core::store::MockStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncEngineConfig::builder()
//!     .name("product-cache")
//!     .retry_interval(Duration::from_secs(5))
//!     .build()?;
//!
//! let mut engine = SyncEngine::new(
//!     config,
//!     Arc::new(MockSource::new("shop.products")),
//!     Arc::new(MockStore::new()),
//!     Arc::new(ProductCacheMapper),
//! );
//!
//! engine.start().await?;
//! // ...
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::applier::{ApplyOutcome, SyncApplier, DEFAULT_TOMBSTONE_TTL};
use crate::event::normalize;
use crate::mapper::RecordMapper;
use crate::metrics;
use crate::reconciler::{ReconcileError, ReconcileReport, Reconciler};
use crate::retry::{DeadLetterReason, RetryConfig, RetryEntry, RetryQueue};
use crate::source::{ChangeStream, Source, SourceError};
use crate::store::DerivedStore;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Invalid engine configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {parameter}: {message}")]
pub struct ConfigError {
    /// Offending parameter
    pub parameter: &'static str,
    /// What is wrong with it
    pub message: String,
}

impl ConfigError {
    fn new(parameter: &'static str, message: impl Into<String>) -> Self {
        Self {
            parameter,
            message: message.into(),
        }
    }
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `start` was called on a running engine
    #[error("Engine is already running")]
    AlreadyRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// An on-demand reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),

    /// A worker task panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Opening the first watch session
    Starting,
    /// Running the reconciler
    Reconciling,
    /// Applying live changes
    Watching,
    /// The session failed; a restart is pending
    Degraded,
    /// Waiting out the restart backoff and reopening the session
    Restarting,
    /// Not running
    Stopped,
}

impl EngineState {
    /// Lowercase name, used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Reconciling => "reconciling",
            Self::Watching => "watching",
            Self::Degraded => "degraded",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        }
    }

    /// Value exported by the `ordersync_engine_state` gauge.
    #[must_use]
    pub const fn as_gauge(&self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Reconciling => 2,
            Self::Watching => 3,
            Self::Degraded => 4,
            Self::Restarting => 5,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Engine name, used in logs and metric labels
    pub name: String,

    /// Field holding the source's last-modified time
    pub timestamp_field: String,

    /// How often the retry queue is drained
    pub retry_interval: Duration,

    /// Retry queue bounds
    pub retry: RetryConfig,

    /// Re-run reconciliation periodically while watching
    pub reconcile_interval: Option<Duration>,

    /// First restart delay; doubles per consecutive failure
    pub restart_initial_backoff: Duration,

    /// Restart delay cap
    pub restart_max_backoff: Duration,

    /// Backoff jitter factor (0.0 to 1.0)
    pub restart_jitter: f64,

    /// Consecutive failed sessions before giving up (0 = never)
    pub max_restart_attempts: u32,

    /// How long delete tombstones are kept
    pub tombstone_ttl: Duration,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            name: "sync".to_string(),
            timestamp_field: "updatedAt".to_string(),
            retry_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
            reconcile_interval: None,
            restart_initial_backoff: Duration::from_secs(1),
            restart_max_backoff: Duration::from_secs(60),
            restart_jitter: 0.1,
            max_restart_attempts: 10,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
        }
    }
}

impl SyncEngineConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> SyncEngineConfigBuilder {
        SyncEngineConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first invalid parameter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::new("name", "must not be empty"));
        }
        if self.timestamp_field.is_empty() {
            return Err(ConfigError::new("timestamp_field", "must not be empty"));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::new("retry_interval", "must be greater than 0"));
        }
        if self.retry.capacity == 0 {
            return Err(ConfigError::new("retry_capacity", "must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::new("max_retry_attempts", "must be greater than 0"));
        }
        if self.reconcile_interval.is_some_and(|i| i.is_zero()) {
            return Err(ConfigError::new("reconcile_interval", "must be greater than 0"));
        }
        if self.restart_initial_backoff.is_zero() {
            return Err(ConfigError::new("restart_initial_backoff", "must be greater than 0"));
        }
        if self.restart_initial_backoff > self.restart_max_backoff {
            return Err(ConfigError::new(
                "restart_initial_backoff",
                format!(
                    "{:?} must be <= restart_max_backoff ({:?})",
                    self.restart_initial_backoff, self.restart_max_backoff
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.restart_jitter) {
            return Err(ConfigError::new(
                "restart_jitter",
                format!("{} must be between 0.0 and 1.0", self.restart_jitter),
            ));
        }
        Ok(())
    }

    /// Restart delay for the given consecutive failure (1-based).
    ///
    /// Exponential: `initial * 2^(attempt-1)`, capped at the maximum, with
    /// ±(base * jitter / 2) of random jitter.
    #[must_use]
    pub fn restart_backoff(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.restart_initial_backoff.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.restart_max_backoff.as_millis()).unwrap_or(u64::MAX);

        let base_ms = initial_ms
            .saturating_mul(1_u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX))
            .min(max_ms);

        if self.restart_jitter > 0.0 {
            let jitter_range = (base_ms as f64) * self.restart_jitter;
            let jitter = (rand::random::<f64>() * jitter_range) - (jitter_range / 2.0);
            Duration::from_millis(((base_ms as f64) + jitter).max(0.0) as u64)
        } else {
            Duration::from_millis(base_ms)
        }
    }
}

/// Builder for [`SyncEngineConfig`].
#[derive(Debug, Default)]
pub struct SyncEngineConfigBuilder {
    config: Option<SyncEngineConfig>,
}

impl SyncEngineConfigBuilder {
    fn config(&mut self) -> &mut SyncEngineConfig {
        self.config.get_or_insert_with(SyncEngineConfig::default)
    }

    /// Sets the engine name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config().name = name.into();
        self
    }

    /// Sets the source's last-modified field. Default: `updatedAt`
    #[must_use]
    pub fn timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.config().timestamp_field = field.into();
        self
    }

    /// Sets the retry drain interval. Default: 5s
    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config().retry_interval = interval;
        self
    }

    /// Sets the retry queue capacity. Default: 10,000
    #[must_use]
    pub fn retry_capacity(mut self, capacity: usize) -> Self {
        self.config().retry.capacity = capacity;
        self
    }

    /// Sets the attempts before dead-lettering. Default: 20
    #[must_use]
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.config().retry.max_attempts = attempts;
        self
    }

    /// Sets how many dead letters are kept. Default: 1,000
    #[must_use]
    pub fn dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.config().retry.dead_letter_capacity = capacity;
        self
    }

    /// Enables periodic re-reconciliation while watching.
    #[must_use]
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.config().reconcile_interval = Some(interval);
        self
    }

    /// Sets the restart backoff bounds. Default: 1s to 60s
    #[must_use]
    pub fn restart_backoff(mut self, initial: Duration, max: Duration) -> Self {
        let config = self.config();
        config.restart_initial_backoff = initial;
        config.restart_max_backoff = max;
        self
    }

    /// Sets the restart backoff jitter factor. Default: 0.1
    #[must_use]
    pub fn restart_jitter(mut self, jitter: f64) -> Self {
        self.config().restart_jitter = jitter;
        self
    }

    /// Sets the consecutive failed sessions before giving up (0 = never). Default: 10
    #[must_use]
    pub fn max_restart_attempts(mut self, attempts: u32) -> Self {
        self.config().max_restart_attempts = attempts;
        self
    }

    /// Sets the delete tombstone lifetime. Default: 10 minutes
    #[must_use]
    pub fn tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.config().tombstone_ttl = ttl;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if validation fails.
    pub fn build(mut self) -> Result<SyncEngineConfig, ConfigError> {
        let config = self.config.take().unwrap_or_default();
        config.validate()?;
        Ok(config)
    }
}

/// Engine counters.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Live changes normalized into events
    pub events_received: u64,
    /// Raw changes discarded by the normalizer
    pub events_dropped: u64,
    /// Live events written to the store
    pub events_applied: u64,
    /// Live events skipped as older than the stored state
    pub events_stale: u64,
    /// Live events that failed to apply
    pub apply_failures: u64,
    /// Retry entries applied successfully
    pub retries_succeeded: u64,
    /// Events dead-lettered, live or during retries
    pub dead_lettered: u64,
    /// Completed reconciliation runs
    pub reconcile_runs: u64,
    /// Report of the last completed reconciliation
    pub last_reconcile: Option<ReconcileReport>,
    /// Session restarts
    pub restarts: u64,
    /// Most recent session failure
    pub last_error: Option<String>,
}

/// Why a watch session ended.
enum SessionEnd {
    Shutdown,
    Failed { error: String, reconciled: bool },
}

/// Shared state handed to the engine's tasks.
#[derive(Clone)]
struct Worker {
    config: SyncEngineConfig,
    source: Arc<dyn Source>,
    applier: Arc<SyncApplier>,
    reconciler: Arc<Reconciler>,
    retry_queue: Arc<RetryQueue>,
    stats: Arc<RwLock<EngineStats>>,
    state: Arc<watch::Sender<EngineState>>,
}

impl Worker {
    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(engine = %self.config.name, from = %previous, to = %state, "Engine state changed");
        }
        metrics::set_engine_state(&self.config.name, state);
    }

    async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let report = self.reconciler.run().await?;
        let mut stats = self.stats.write().await;
        stats.reconcile_runs += 1;
        stats.last_reconcile = Some(report);
        Ok(report)
    }

    #[instrument(skip_all, fields(engine = %self.config.name))]
    async fn supervise(self, mut shutdown: broadcast::Receiver<()>, stop_all: broadcast::Sender<()>) {
        let mut failures: u32 = 0;

        loop {
            match self.run_session(&mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed { error, reconciled } => {
                    self.set_state(EngineState::Degraded);
                    error!(error = %error, "Sync session failed");
                    self.stats.write().await.last_error = Some(error);

                    failures = if reconciled { 1 } else { failures + 1 };
                    let limit = self.config.max_restart_attempts;
                    if limit > 0 && failures > limit {
                        error!(
                            attempts = limit,
                            "Giving up after repeated session failures; derived store is no longer being synchronized"
                        );
                        let _ = stop_all.send(());
                        break;
                    }

                    let backoff = self.config.restart_backoff(failures);
                    self.set_state(EngineState::Restarting);
                    self.stats.write().await.restarts += 1;
                    metrics::increment_engine_restarts(&self.config.name);
                    warn!(attempt = failures, backoff_ms = backoff.as_millis() as u64, "Restarting sync session");

                    tokio::select! {
                        _ = shutdown.recv() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        self.set_state(EngineState::Stopped);
    }

    async fn run_session(&self, shutdown: &mut broadcast::Receiver<()>) -> SessionEnd {
        let failed = |error: String, reconciled: bool| SessionEnd::Failed { error, reconciled };

        let changes = tokio::select! {
            _ = shutdown.recv() => return SessionEnd::Shutdown,
            result = self.source.watch() => match result {
                Ok(changes) => changes,
                Err(e) => {
                    metrics::increment_source_errors(&self.config.name, e.category());
                    return failed(format!("failed to open watch session: {e}"), false);
                }
            },
        };

        self.set_state(EngineState::Reconciling);
        tokio::select! {
            _ = shutdown.recv() => return SessionEnd::Shutdown,
            result = self.reconcile() => {
                if let Err(e) = result {
                    return failed(e.to_string(), false);
                }
            }
        }

        self.set_state(EngineState::Watching);
        self.watch(changes, shutdown).await
    }

    async fn watch(
        &self,
        mut changes: ChangeStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let mut reconcile_timer = self.config.reconcile_interval.map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });

        loop {
            tokio::select! {
                _ = shutdown.recv() => return SessionEnd::Shutdown,

                () = next_tick(&mut reconcile_timer) => {
                    debug!(engine = %self.config.name, "Periodic reconciliation");
                    self.set_state(EngineState::Reconciling);
                    if let Err(e) = self.reconcile().await {
                        return SessionEnd::Failed { error: e.to_string(), reconciled: true };
                    }
                    self.set_state(EngineState::Watching);
                }

                item = changes.next() => match item {
                    Some(Ok(raw)) => self.handle_change(raw).await,
                    Some(Err(e)) => {
                        metrics::increment_source_errors(&self.config.name, e.category());
                        return SessionEnd::Failed {
                            error: describe_watch_error(&e),
                            reconciled: true,
                        };
                    }
                    None => {
                        metrics::increment_source_errors(&self.config.name, "ended");
                        return SessionEnd::Failed {
                            error: "change stream ended unexpectedly".to_string(),
                            reconciled: true,
                        };
                    }
                },
            }
        }
    }

    async fn handle_change(&self, raw: crate::event::RawChange) {
        let Some(event) = normalize(raw, &self.config.timestamp_field) else {
            self.stats.write().await.events_dropped += 1;
            metrics::increment_events_dropped(&self.config.name, "unsupported");
            return;
        };

        metrics::increment_events_received(&self.config.name, event.operation.as_str());
        let result = self.applier.apply(&event).await;

        let mut stats = self.stats.write().await;
        stats.events_received += 1;
        match result {
            Ok(outcome) => {
                if outcome == ApplyOutcome::Stale {
                    stats.events_stale += 1;
                } else {
                    stats.events_applied += 1;
                }
                self.retry_queue
                    .discard_superseded(&event.key, event.cluster_time);
            }
            Err(e) if e.is_transient() => {
                stats.apply_failures += 1;
                self.retry_queue.enqueue(RetryEntry::new(event, &e));
            }
            Err(e) => {
                stats.apply_failures += 1;
                stats.dead_lettered += 1;
                self.retry_queue
                    .dead_letter(RetryEntry::new(event, &e), DeadLetterReason::Permanent);
            }
        }
    }

    #[instrument(skip_all, fields(engine = %self.config.name))]
    async fn drain_retries(self, mut shutdown: broadcast::Receiver<()>) {
        let mut timer = interval(self.config.retry_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = timer.tick() => {
                    if self.retry_queue.is_empty() {
                        continue;
                    }
                    let report = tokio::select! {
                        _ = shutdown.recv() => break,
                        report = self.retry_queue.drain_once(&self.applier) => report,
                    };
                    if !report.skipped {
                        let mut stats = self.stats.write().await;
                        stats.retries_succeeded += report.succeeded as u64;
                        stats.dead_lettered += report.dead_lettered as u64;
                    }
                }
            }
        }

        debug!("Retry drain task stopped");
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn describe_watch_error(error: &SourceError) -> String {
    format!(
        "change stream failed ({}, retryable: {}): {error}",
        error.category(),
        error.is_retryable()
    )
}

/// Keeps one derived store synchronized with one source.
pub struct SyncEngine {
    worker: Worker,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("name", &self.worker.config.name)
            .field("source", &self.worker.source.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Creates an engine. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(
        config: SyncEngineConfig,
        source: Arc<dyn Source>,
        store: Arc<dyn DerivedStore>,
        mapper: Arc<dyn RecordMapper>,
    ) -> Self {
        info!(
            engine = %config.name,
            source = %source.name(),
            store = %store.metadata().name,
            mapper = %mapper.name(),
            "Creating sync engine"
        );

        let applier = Arc::new(
            SyncApplier::new(config.name.clone(), store, mapper).with_tombstone_ttl(config.tombstone_ttl),
        );
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&source), Arc::clone(&applier)));
        let retry_queue = Arc::new(RetryQueue::new(config.name.clone(), config.retry));
        let (state, _) = watch::channel(EngineState::Stopped);

        Self {
            worker: Worker {
                config,
                source,
                applier,
                reconciler,
                retry_queue,
                stats: Arc::new(RwLock::new(EngineStats::default())),
                state: Arc::new(state),
            },
            shutdown_tx: None,
            handles: Vec::new(),
        }
    }

    /// Spawns the supervisor and retry drain tasks.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] if the engine is running.
    #[instrument(skip(self), fields(engine = %self.worker.config.name))]
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.shutdown_tx.is_some() {
            if self.state() != EngineState::Stopped {
                return Err(EngineError::AlreadyRunning);
            }
            info!("Releasing tasks of a run that gave up");
            self.stop().await?;
        }

        info!("Starting sync engine");
        self.worker.set_state(EngineState::Starting);

        let (shutdown_tx, _) = broadcast::channel(1);
        let supervisor_rx = shutdown_tx.subscribe();
        let drain_rx = shutdown_tx.subscribe();

        let supervisor = self.worker.clone();
        let stop_all = shutdown_tx.clone();
        self.handles
            .push(tokio::spawn(async move { supervisor.supervise(supervisor_rx, stop_all).await }));

        let drainer = self.worker.clone();
        self.handles
            .push(tokio::spawn(async move { drainer.drain_retries(drain_rx).await }));

        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Stops both tasks and discards the retry queue.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Worker`] if a task panicked.
    #[instrument(skip(self), fields(engine = %self.worker.config.name))]
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            warn!("Engine is not running");
            return Ok(());
        };

        info!("Stopping sync engine");
        let _ = shutdown_tx.send(());

        let mut failure = None;
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Engine task failed");
                failure = Some(EngineError::Worker(e.to_string()));
            }
        }

        let dropped = self.worker.retry_queue.clear();
        if dropped > 0 {
            warn!(dropped, "Discarded pending retries on shutdown");
        }
        self.worker.set_state(EngineState::Stopped);

        let stats = self.worker.stats.read().await;
        info!(
            events_received = stats.events_received,
            events_applied = stats.events_applied,
            apply_failures = stats.apply_failures,
            dead_lettered = stats.dead_lettered,
            restarts = stats.restarts,
            "Sync engine stopped"
        );

        failure.map_or(Ok(()), Err)
    }

    /// Runs a reconciliation pass now, alongside the live loop.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Reconcile`] if the pass fails.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport, EngineError> {
        Ok(self.worker.reconcile().await?)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.worker.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.worker.state.subscribe()
    }

    /// Returns true unless the engine is stopped or gave up.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() != EngineState::Stopped
    }

    /// Snapshot of the engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.worker.stats.read().await.clone()
    }

    /// The engine's retry queue.
    #[must_use]
    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.worker.retry_queue
    }

    /// The engine's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.worker.config.name
    }
}
