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

//! Retry Queue
//!
//! Bounded in-memory buffer of change events whose application failed
//! transiently. The engine drains it on a fixed timer through the same
//! [`SyncApplier`] the live loop uses.
//!
//! # Semantics
//!
//! - At most one entry per key. A newer event (by cluster time) for a
//!   queued key replaces the older one; an older event for a queued key is
//!   dropped.
//! - A drain snapshots the queue and clears it, then re-applies the
//!   snapshot. Only entries that fail again go back, and only if nothing
//!   newer for their key arrived during the drain.
//! - Drains never overlap: a drain that starts while another is running
//!   returns at once with [`DrainReport::skipped`] set.
//! - Entries that fail permanently, reach `max_attempts`, or are pushed out
//!   by a full queue become [`DeadLetter`]s, kept in a bounded ring.
//!
//! The queue lives in process memory and is lost on restart; the
//! reconciliation run at every start repairs what it held.

use crate::applier::SyncApplier;
use crate::event::ChangeEvent;
use crate::metrics;
use crate::record::{may_replace, RecordId};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Queue bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of queued entries
    pub capacity: usize,

    /// Attempts, the first live failure included, before an entry is dead-lettered
    pub max_attempts: u32,

    /// Number of dead letters kept for inspection
    pub dead_letter_capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_attempts: 20,
            dead_letter_capacity: 1_000,
        }
    }
}

/// A failed event waiting to be re-applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEntry {
    /// The event to re-apply
    pub event: ChangeEvent,

    /// Failed attempts so far
    pub attempts: u32,

    /// When the event first failed
    pub first_failed_at: DateTime<Utc>,

    /// Message of the most recent failure
    pub last_error: String,
}

impl RetryEntry {
    /// Creates an entry for an event that just failed once.
    pub fn new(event: ChangeEvent, error: &impl fmt::Display) -> Self {
        Self {
            event,
            attempts: 1,
            first_failed_at: Utc::now(),
            last_error: error.to_string(),
        }
    }

    /// Key of the queued event.
    #[must_use]
    pub fn key(&self) -> &RecordId {
        &self.event.key
    }
}

/// Why an entry left the queue without being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// The entry failed `max_attempts` times.
    MaxAttempts,
    /// The event can never be applied.
    Permanent,
    /// The queue was full and this was its oldest entry.
    Overflow,
}

impl DeadLetterReason {
    /// Lowercase name, used as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MaxAttempts => "max_attempts",
            Self::Permanent => "permanent",
            Self::Overflow => "overflow",
        }
    }
}

/// An event given up on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// The abandoned entry
    pub entry: RetryEntry,

    /// Why it was abandoned
    pub reason: DeadLetterReason,

    /// When it was abandoned
    pub dead_at: DateTime<Utc>,
}

/// Result of [`RetryQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The entry was added.
    Queued,
    /// The entry replaced an older one for the same key.
    Replaced,
    /// A newer entry for the key is already queued; this one was dropped.
    Ignored,
    /// The entry was added after dead-lettering the oldest entry.
    Overflowed {
        /// Key of the evicted entry
        evicted: RecordId,
    },
}

/// Counters from one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another drain was in flight; nothing was done.
    pub skipped: bool,
    /// Entries taken from the queue
    pub attempted: usize,
    /// Entries applied successfully
    pub succeeded: usize,
    /// Entries that failed again and went back to the queue
    pub requeued: usize,
    /// Entries that failed again but were made obsolete by a newer entry
    pub superseded: usize,
    /// Entries dead-lettered during this drain
    pub dead_lettered: usize,
}

/// Bounded retry buffer for one engine.
#[derive(Debug)]
pub struct RetryQueue {
    engine: String,
    config: RetryConfig,
    live: Mutex<VecDeque<RetryEntry>>,
    dead: Mutex<VecDeque<DeadLetter>>,
    drain_gate: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl RetryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(engine: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            engine: engine.into(),
            config,
            live: Mutex::new(VecDeque::new()),
            dead: Mutex::new(VecDeque::new()),
            drain_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the queue bounds.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Adds a failed event.
    pub fn enqueue(&self, entry: RetryEntry) -> EnqueueOutcome {
        let outcome = self.push(entry, false);
        debug!(engine = %self.engine, outcome = ?outcome, "Enqueued change event for retry");
        outcome
    }

    /// Inserts `entry`, resolving same-key conflicts by cluster time.
    ///
    /// On equal timestamps a fresh entry replaces the queued one, while a
    /// requeued entry yields to it.
    fn push(&self, entry: RetryEntry, requeue: bool) -> EnqueueOutcome {
        let mut live = lock(&self.live);

        if let Some(existing) = live.iter_mut().find(|e| e.key() == entry.key()) {
            let incoming = entry.event.cluster_time;
            let queued = existing.event.cluster_time;
            let replace = if requeue {
                !may_replace(queued, incoming)
            } else {
                may_replace(incoming, queued)
            };

            return if replace {
                *existing = entry;
                EnqueueOutcome::Replaced
            } else {
                EnqueueOutcome::Ignored
            };
        }

        let mut outcome = EnqueueOutcome::Queued;
        if live.len() >= self.config.capacity {
            if let Some(oldest) = live.pop_front() {
                outcome = EnqueueOutcome::Overflowed {
                    evicted: oldest.key().clone(),
                };
                self.dead_letter(oldest, DeadLetterReason::Overflow);
            }
        }

        live.push_back(entry);
        metrics::set_retry_queue_size(&self.engine, live.len());
        outcome
    }

    /// Records a dead letter. Also used by the engine for permanent live failures.
    pub fn dead_letter(&self, entry: RetryEntry, reason: DeadLetterReason) {
        error!(
            engine = %self.engine,
            key = %entry.key(),
            operation = %entry.event.operation,
            reason = reason.as_str(),
            attempts = entry.attempts,
            error = %entry.last_error,
            "Change event dead-lettered"
        );
        metrics::increment_dead_letters(&self.engine, reason.as_str());

        let mut dead = lock(&self.dead);
        if dead.len() >= self.config.dead_letter_capacity {
            dead.pop_front();
        }
        if self.config.dead_letter_capacity > 0 {
            dead.push_back(DeadLetter {
                entry,
                reason,
                dead_at: Utc::now(),
            });
        }
    }

    /// Removes queued entries for `key` that an applied event at
    /// `cluster_time` has made obsolete. Returns how many were removed.
    pub fn discard_superseded(&self, key: &RecordId, cluster_time: Option<DateTime<Utc>>) -> usize {
        let mut live = lock(&self.live);
        let before = live.len();
        live.retain(|e| !(e.key() == key && may_replace(cluster_time, e.event.cluster_time)));
        let removed = before - live.len();

        if removed > 0 {
            debug!(engine = %self.engine, key = %key, removed, "Discarded superseded retry entries");
            metrics::set_retry_queue_size(&self.engine, live.len());
        }
        removed
    }

    /// Re-applies every queued entry once.
    ///
    /// Returns immediately with `skipped = true` if another drain is
    /// running. The live queue is snapshotted and cleared before any
    /// application, so events enqueued meanwhile wait for the next drain.
    pub async fn drain_once(&self, applier: &SyncApplier) -> DrainReport {
        let Ok(_gate) = self.drain_gate.try_lock() else {
            debug!(engine = %self.engine, "Retry drain already in flight, skipping");
            return DrainReport {
                skipped: true,
                ..DrainReport::default()
            };
        };

        let batch: Vec<RetryEntry> = {
            let mut live = lock(&self.live);
            let batch = live.drain(..).collect();
            metrics::set_retry_queue_size(&self.engine, 0);
            batch
        };

        let mut report = DrainReport {
            attempted: batch.len(),
            ..DrainReport::default()
        };
        if batch.is_empty() {
            return report;
        }

        info!(engine = %self.engine, entries = batch.len(), "Retrying failed change events");

        for mut entry in batch {
            match applier.apply(&entry.event).await {
                Ok(_) => {
                    report.succeeded += 1;
                    metrics::increment_retries(&self.engine, "succeeded");
                }
                Err(e) if e.is_transient() => {
                    entry.attempts += 1;
                    entry.last_error = e.to_string();

                    if entry.attempts >= self.config.max_attempts {
                        report.dead_lettered += 1;
                        metrics::increment_retries(&self.engine, "dead_lettered");
                        self.dead_letter(entry, DeadLetterReason::MaxAttempts);
                        continue;
                    }

                    match self.push(entry, true) {
                        EnqueueOutcome::Ignored => {
                            report.superseded += 1;
                            metrics::increment_retries(&self.engine, "superseded");
                        }
                        EnqueueOutcome::Overflowed { .. } => {
                            report.requeued += 1;
                            report.dead_lettered += 1;
                            metrics::increment_retries(&self.engine, "requeued");
                        }
                        EnqueueOutcome::Queued | EnqueueOutcome::Replaced => {
                            report.requeued += 1;
                            metrics::increment_retries(&self.engine, "requeued");
                        }
                    }
                }
                Err(e) => {
                    entry.attempts += 1;
                    entry.last_error = e.to_string();
                    report.dead_lettered += 1;
                    metrics::increment_retries(&self.engine, "dead_lettered");
                    self.dead_letter(entry, DeadLetterReason::Permanent);
                }
            }
        }

        info!(
            engine = %self.engine,
            succeeded = report.succeeded,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            "Retry drain complete"
        );
        report
    }

    /// Returns true while a drain is running.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.drain_gate.try_lock().is_err()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.live).len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the queued entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RetryEntry> {
        lock(&self.live).iter().cloned().collect()
    }

    /// Copies the dead letters, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.dead).iter().cloned().collect()
    }

    /// Drops every queued entry. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut live = lock(&self.live);
        let dropped = live.len();
        live.clear();
        metrics::set_retry_queue_size(&self.engine, 0);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::IdentityMapper;
    use crate::record::SourceRecord;
    use crate::store::MockStore;
    use bson::doc;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn update(key: &str, day: u32) -> ChangeEvent {
        ChangeEvent::update(SourceRecord::new(key, doc! { "_id": key, "day": day }, Some(at(day))))
            .at(at(day))
    }

    fn entry(key: &str, day: u32) -> RetryEntry {
        RetryEntry::new(update(key, day), &"store unavailable")
    }

    fn config(capacity: usize, max_attempts: u32) -> RetryConfig {
        RetryConfig {
            capacity,
            max_attempts,
            dead_letter_capacity: 10,
        }
    }

    fn applier(store: &MockStore) -> SyncApplier {
        SyncApplier::new("test", Arc::new(store.clone()), Arc::new(IdentityMapper))
    }

    #[test]
    fn test_enqueue_supersedes_by_key() {
        let queue = RetryQueue::new("test", RetryConfig::default());

        assert_eq!(queue.enqueue(entry("a", 2)), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(entry("a", 1)), EnqueueOutcome::Ignored);
        assert_eq!(queue.enqueue(entry("a", 3)), EnqueueOutcome::Replaced);
        assert_eq!(queue.enqueue(entry("b", 1)), EnqueueOutcome::Queued);

        let queued = queue.snapshot();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].event.cluster_time, Some(at(3)));
    }

    #[test]
    fn test_overflow_dead_letters_oldest() {
        let queue = RetryQueue::new("test", config(2, 5));
        queue.enqueue(entry("a", 1));
        queue.enqueue(entry("b", 1));

        let outcome = queue.enqueue(entry("c", 1));
        assert_eq!(outcome, EnqueueOutcome::Overflowed { evicted: RecordId::from("a") });
        assert_eq!(queue.len(), 2);

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::Overflow);
    }

    #[test]
    fn test_discard_superseded() {
        let queue = RetryQueue::new("test", RetryConfig::default());
        queue.enqueue(entry("a", 2));
        queue.enqueue(entry("b", 2));

        assert_eq!(queue.discard_superseded(&RecordId::from("a"), Some(at(1))), 0);
        assert_eq!(queue.discard_superseded(&RecordId::from("a"), Some(at(2))), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_applies_and_clears() {
        let store = MockStore::new();
        let applier = applier(&store);
        let queue = RetryQueue::new("test", RetryConfig::default());
        queue.enqueue(entry("a", 1));
        queue.enqueue(entry("b", 1));

        let report = queue.drain_once(&applier).await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 2);
        assert!(queue.is_empty());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_drain_requeues_only_failures() {
        let store = MockStore::new();
        let applier = applier(&store);
        let queue = RetryQueue::new("test", RetryConfig::default());
        queue.enqueue(entry("a", 1));
        queue.enqueue(entry("b", 1));
        queue.enqueue(entry("c", 1));

        store.fail_next_writes(1);
        let report = queue.drain_once(&applier).await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.requeued, 1);
        let remaining = queue.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key(), &RecordId::from("a"));
        assert_eq!(remaining[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_drain_after_three_failed_writes() {
        let store = MockStore::new();
        let applier = applier(&store);
        let queue = RetryQueue::new("test", RetryConfig::default());

        store.fail_next_writes(3);
        for key in ["a", "b", "c"] {
            let event = update(key, 1);
            let err = applier.apply(&event).await.unwrap_err();
            assert!(err.is_transient());
            queue.enqueue(RetryEntry::new(event, &err));
        }
        assert!(store.is_empty());
        assert_eq!(queue.len(), 3);

        let report = queue.drain_once(&applier).await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 3);
        assert!(queue.is_empty());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_update_does_not_outlive_delete_in_same_second() {
        let store = MockStore::new();
        let applier = applier(&store);
        let queue = RetryQueue::new("test", RetryConfig::default());
        let second = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        applier.apply(&update("p1", 1)).await.unwrap();

        // The document clock says 10:00:00.500, the oplog 10:00:00 + 1.
        let failed = ChangeEvent::update(SourceRecord::new(
            "p1",
            doc! { "_id": "p1", "qty": 3 },
            Some(second + chrono::Duration::milliseconds(500)),
        ))
        .at(second + chrono::Duration::microseconds(1));
        store.fail_next_writes(1);
        let err = applier.apply(&failed).await.unwrap_err();
        queue.enqueue(RetryEntry::new(failed.clone(), &err));

        let delete = ChangeEvent::delete(
            RecordId::from("p1"),
            Some(second + chrono::Duration::microseconds(2)),
        );
        applier.apply(&delete).await.unwrap();
        assert_eq!(queue.discard_superseded(&delete.key, delete.cluster_time), 1);

        // Even if the update was already taken by a drain, it stays dead.
        queue.enqueue(RetryEntry::new(failed, &"store unavailable"));
        let report = queue.drain_once(&applier).await;

        assert_eq!(report.succeeded, 1);
        assert!(store.get(&RecordId::from("p1")).is_none());
    }

    #[tokio::test]
    async fn test_drain_dead_letters_after_max_attempts() {
        let store = MockStore::new();
        let applier = applier(&store);
        let queue = RetryQueue::new("test", config(10, 3));
        queue.enqueue(entry("a", 1));

        store.fail_next_writes(10);
        queue.drain_once(&applier).await;
        assert_eq!(queue.len(), 1);
        let report = queue.drain_once(&applier).await;

        assert_eq!(report.dead_lettered, 1);
        assert!(queue.is_empty());
        let dead = queue.dead_letters();
        assert_eq!(dead[0].reason, DeadLetterReason::MaxAttempts);
        assert_eq!(dead[0].entry.attempts, 3);
    }

    #[tokio::test]
    async fn test_drain_dead_letters_permanent_failures() {
        let store = MockStore::new().with_permanent_failures();
        let applier = applier(&store);
        let queue = RetryQueue::new("test", RetryConfig::default());
        queue.enqueue(entry("a", 1));

        store.fail_next_writes(1);
        let report = queue.drain_once(&applier).await;

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(queue.dead_letters()[0].reason, DeadLetterReason::Permanent);
    }

    #[test]
    fn test_clear() {
        let queue = RetryQueue::new("test", RetryConfig::default());
        queue.enqueue(entry("a", 1));
        queue.enqueue(entry("b", 1));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dead_letter_ring_is_bounded() {
        let queue = RetryQueue::new(
            "test",
            RetryConfig {
                capacity: 10,
                max_attempts: 3,
                dead_letter_capacity: 2,
            },
        );
        for key in ["a", "b", "c"] {
            queue.dead_letter(entry(key, 1), DeadLetterReason::Permanent);
        }

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].entry.key(), &RecordId::from("b"));
    }
}
