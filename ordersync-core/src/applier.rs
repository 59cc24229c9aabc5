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

//! Sync Applier
//!
//! [`SyncApplier::apply`] writes one [`ChangeEvent`] to the derived store.
//! It is the only code path that writes: the live watch loop, the retry
//! drain and the reconciler all go through it, and an async gate lets one
//! application run at a time.
//!
//! # Rules
//!
//! Ordering uses [`ChangeEvent::cluster_time`] for every operation kind.
//! Each stored record remembers the cluster time of the change it was
//! built from.
//!
//! - Insert/update: the payload must be present and accepted by the mapper
//!   before anything is written. The write is skipped as
//!   [`ApplyOutcome::Stale`] when the stored record was built from a
//!   strictly later change, or when a live tombstone shows the key was
//!   deleted after the event.
//! - Delete: skipped as [`ApplyOutcome::Stale`] when the stored record was
//!   built from a strictly later change. Otherwise delete if present; a
//!   missing key is success ([`ApplyOutcome::AlreadyAbsent`]). Either way a
//!   tombstone is kept for `tombstone_ttl`.
//! - Events without a cluster time are applied without ordering checks.
//! - Store errors are transient when the store says retrying may help and
//!   permanent otherwise.
//!
//! Applying the same event twice leaves the store as applying it once.

use crate::event::{ChangeEvent, Operation};
use crate::mapper::{MappingError, RecordMapper};
use crate::metrics::{self, Timer};
use crate::record::{may_replace, DerivedRecord, RecordId};
use crate::store::{DerivedStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default time a delete tombstone is kept.
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(600);

/// Why an event can never be applied.
#[derive(Debug, Error)]
pub enum PermanentCause {
    /// An insert or update arrived without a readable document.
    #[error("event has no payload")]
    MissingPayload,

    /// The mapper rejected the payload.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// The store rejected the write and retrying will not help.
    #[error(transparent)]
    Rejected(StoreError),
}

/// A failed application.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The store was unavailable; the same event may succeed later.
    #[error("transient failure: {0}")]
    Transient(#[source] StoreError),

    /// The event is invalid or was rejected; it must not be retried.
    #[error("permanent failure: {0}")]
    Permanent(#[source] PermanentCause),
}

impl SyncError {
    /// Maps a store error by its retryability.
    #[must_use]
    pub fn from_store(err: StoreError) -> Self {
        if err.is_retryable() {
            Self::Transient(err)
        } else {
            Self::Permanent(PermanentCause::Rejected(err))
        }
    }

    /// Returns true if the event should go to the retry queue.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }
}

impl From<MappingError> for SyncError {
    fn from(err: MappingError) -> Self {
        Self::Permanent(PermanentCause::Mapping(err))
    }
}

/// Result of a successful application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The derived record was inserted or replaced.
    Upserted,
    /// The derived record was removed.
    Deleted,
    /// A delete found nothing to remove.
    AlreadyAbsent,
    /// The store already reflects a newer state; nothing was written.
    Stale,
}

impl ApplyOutcome {
    /// Lowercase name, used as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Upserted => "upserted",
            Self::Deleted => "deleted",
            Self::AlreadyAbsent => "already_absent",
            Self::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    deleted_at: Option<DateTime<Utc>>,
    recorded: Instant,
}

impl Tombstone {
    /// Returns true if an upsert at `cluster_time` predates the delete.
    ///
    /// A delete of unknown time shadows every ordered upsert.
    fn shadows(&self, cluster_time: Option<DateTime<Utc>>) -> bool {
        match (cluster_time, self.deleted_at) {
            (Some(ts), Some(deleted_at)) => ts < deleted_at,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Applies change events to one derived store.
pub struct SyncApplier {
    engine: String,
    store: Arc<dyn DerivedStore>,
    mapper: Arc<dyn RecordMapper>,
    store_type: String,
    tombstone_ttl: Duration,
    gate: Mutex<HashMap<RecordId, Tombstone>>,
}

impl std::fmt::Debug for SyncApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncApplier")
            .field("engine", &self.engine)
            .field("store_type", &self.store_type)
            .field("mapper", &self.mapper.name())
            .field("tombstone_ttl", &self.tombstone_ttl)
            .finish_non_exhaustive()
    }
}

impl SyncApplier {
    /// Creates an applier writing to `store` through `mapper`.
    #[must_use]
    pub fn new(
        engine: impl Into<String>,
        store: Arc<dyn DerivedStore>,
        mapper: Arc<dyn RecordMapper>,
    ) -> Self {
        let store_type = store.metadata().store_type;
        Self {
            engine: engine.into(),
            store,
            mapper,
            store_type,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            gate: Mutex::new(HashMap::new()),
        }
    }

    /// Sets how long delete tombstones are kept.
    #[must_use]
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// The store this applier writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DerivedStore> {
        &self.store
    }

    /// Name of the owning engine.
    #[must_use]
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Number of tombstones currently held, expired ones included.
    pub async fn tombstone_count(&self) -> usize {
        self.gate.lock().await.len()
    }

    /// Applies one event.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transient`] if the store was unavailable and
    /// [`SyncError::Permanent`] if the event is invalid or was rejected.
    pub async fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome, SyncError> {
        let _timer = Timer::new(self.store_type.clone(), metrics::record_apply_duration);
        let mut tombstones = self.gate.lock().await;

        let result = match event.operation {
            Operation::Insert | Operation::Update => self.upsert(event, &mut tombstones).await,
            Operation::Delete => self.delete(event, &mut tombstones).await,
        };

        match &result {
            Ok(outcome) => {
                debug!(
                    engine = %self.engine,
                    key = %event.key,
                    operation = %event.operation,
                    outcome = outcome.as_str(),
                    "Applied change event"
                );
                metrics::increment_events_applied(&self.engine, event.operation.as_str(), outcome.as_str());
            }
            Err(e) => {
                warn!(
                    engine = %self.engine,
                    key = %event.key,
                    operation = %event.operation,
                    error = %e,
                    "Failed to apply change event"
                );
                metrics::increment_apply_failures(&self.engine, e.category());
            }
        }

        result
    }

    async fn upsert(
        &self,
        event: &ChangeEvent,
        tombstones: &mut HashMap<RecordId, Tombstone>,
    ) -> Result<ApplyOutcome, SyncError> {
        let record = event
            .payload
            .as_ref()
            .ok_or(SyncError::Permanent(PermanentCause::MissingPayload))?;
        let fields = self.mapper.map(record)?;

        if let Some(tombstone) = tombstones.get(&event.key) {
            if tombstone.recorded.elapsed() < self.tombstone_ttl
                && tombstone.shadows(event.cluster_time)
            {
                return Ok(ApplyOutcome::Stale);
            }
        }

        let current = self
            .store
            .find_by_key(&event.key)
            .await
            .map_err(SyncError::from_store)?;

        let mut cluster_time = event.cluster_time;
        if let Some(current) = current {
            if !may_replace(event.cluster_time, current.source_cluster_time) {
                return Ok(ApplyOutcome::Stale);
            }
            cluster_time = cluster_time.or(current.source_cluster_time);
        }

        self.store
            .upsert(
                DerivedRecord::new(event.key.clone(), fields, record.updated_at)
                    .with_cluster_time(cluster_time),
            )
            .await
            .map_err(SyncError::from_store)?;

        tombstones.remove(&event.key);
        Ok(ApplyOutcome::Upserted)
    }

    async fn delete(
        &self,
        event: &ChangeEvent,
        tombstones: &mut HashMap<RecordId, Tombstone>,
    ) -> Result<ApplyOutcome, SyncError> {
        let current = self
            .store
            .find_by_key(&event.key)
            .await
            .map_err(SyncError::from_store)?;

        if let Some(current) = &current {
            if !may_replace(event.cluster_time, current.source_cluster_time) {
                return Ok(ApplyOutcome::Stale);
            }
        }

        let removed = current.is_some()
            && self
                .store
                .delete_by_key(&event.key)
                .await
                .map_err(SyncError::from_store)?;

        let ttl = self.tombstone_ttl;
        tombstones.retain(|_, t| t.recorded.elapsed() < ttl);
        let deleted_at = match tombstones.get(&event.key).map(|t| t.deleted_at) {
            Some(Some(previous)) => event.cluster_time.map(|ts| ts.max(previous)),
            _ => event.cluster_time,
        };
        tombstones.insert(
            event.key.clone(),
            Tombstone {
                deleted_at,
                recorded: Instant::now(),
            },
        );

        Ok(if removed {
            ApplyOutcome::Deleted
        } else {
            ApplyOutcome::AlreadyAbsent
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{IdentityMapper, ProductCacheMapper};
    use crate::record::SourceRecord;
    use crate::store::MockStore;
    use bson::doc;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn applier(store: &MockStore) -> SyncApplier {
        SyncApplier::new("test", Arc::new(store.clone()), Arc::new(IdentityMapper))
    }

    fn update(key: &str, qty: i32, day: u32) -> ChangeEvent {
        ChangeEvent::update(SourceRecord::new(key, doc! { "_id": key, "qty": qty }, Some(at(day))))
            .at(at(day))
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = MockStore::new();
        let applier = applier(&store);
        let event = update("p1", 5, 1);

        assert_eq!(applier.apply(&event).await.unwrap(), ApplyOutcome::Upserted);
        let first = store.get(&RecordId::from("p1")).unwrap();
        assert_eq!(applier.apply(&event).await.unwrap(), ApplyOutcome::Upserted);
        let second = store.get(&RecordId::from("p1")).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(first.fields, second.fields);
        assert_eq!(first.source_updated_at, second.source_updated_at);
    }

    #[tokio::test]
    async fn test_delete_of_absent_key_succeeds() {
        let store = MockStore::new();
        let applier = applier(&store);

        let outcome = applier
            .apply(&ChangeEvent::delete(RecordId::from("ghost"), Some(at(1))))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyAbsent);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_older_event_is_stale() {
        let store = MockStore::new();
        let applier = applier(&store);

        applier.apply(&update("p1", 9, 5)).await.unwrap();
        let outcome = applier.apply(&update("p1", 1, 2)).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(
            store.get(&RecordId::from("p1")).unwrap().fields.get_i32("qty").unwrap(),
            9
        );
    }

    #[tokio::test]
    async fn test_tombstone_blocks_delayed_insert() {
        let store = MockStore::new();
        let applier = applier(&store);

        applier.apply(&update("p1", 1, 1)).await.unwrap();
        applier
            .apply(&ChangeEvent::delete(RecordId::from("p1"), Some(at(3))))
            .await
            .unwrap();

        // A retried insert from before the delete must not resurrect it.
        let outcome = applier.apply(&update("p1", 1, 2)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert!(store.is_empty());

        // A later re-creation goes through and clears the tombstone.
        assert_eq!(applier.apply(&update("p1", 2, 4)).await.unwrap(), ApplyOutcome::Upserted);
        assert_eq!(applier.tombstone_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstone_expires() {
        let store = MockStore::new();
        let applier = applier(&store).with_tombstone_ttl(Duration::from_secs(10));

        applier
            .apply(&ChangeEvent::delete(RecordId::from("p1"), Some(at(3))))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(applier.apply(&update("p1", 1, 2)).await.unwrap(), ApplyOutcome::Upserted);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_permanent_and_writes_nothing() {
        let store = MockStore::new();
        let applier = SyncApplier::new("test", Arc::new(store.clone()), Arc::new(ProductCacheMapper));

        let err = applier.apply(&update("p1", 1, 1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Permanent(PermanentCause::Mapping(_))));
        assert_eq!(store.upsert_count(), 0);

        let missing = ChangeEvent {
            operation: Operation::Update,
            key: RecordId::from("p2"),
            payload: None,
            source_timestamp: None,
            cluster_time: Some(at(1)),
        };
        let err = applier.apply(&missing).await.unwrap_err();
        assert!(matches!(err, SyncError::Permanent(PermanentCause::MissingPayload)));
    }

    #[tokio::test]
    async fn test_store_failures_are_classified() {
        let store = MockStore::new();
        let applier = applier(&store);

        store.fail_next_writes(1);
        let err = applier.apply(&update("p1", 1, 1)).await.unwrap_err();
        assert!(err.is_transient());

        let store = MockStore::new().with_permanent_failures();
        let applier = SyncApplier::new("test", Arc::new(store.clone()), Arc::new(IdentityMapper));
        store.fail_next_writes(1);
        let err = applier.apply(&update("p1", 1, 1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Permanent(PermanentCause::Rejected(_))));
        assert_eq!(err.category(), "permanent");
    }

    #[tokio::test]
    async fn test_upsert_writes_projection_and_timestamp() {
        let store = MockStore::new();
        let applier = applier(&store);

        applier.apply(&update("p1", 3, 7)).await.unwrap();
        let stored = store.get(&RecordId::from("p1")).unwrap();

        assert_eq!(stored.fields, doc! { "qty": 3 });
        assert_eq!(stored.source_updated_at, Some(at(7)));
        assert_eq!(stored.source_cluster_time, Some(at(7)));
    }

    #[tokio::test]
    async fn test_delayed_delete_does_not_remove_newer_record() {
        let store = MockStore::new();
        let applier = applier(&store);

        applier.apply(&update("p1", 1, 6)).await.unwrap();
        let outcome = applier
            .apply(&ChangeEvent::delete(RecordId::from("p1"), Some(at(5))))
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Stale);
        assert!(store.get(&RecordId::from("p1")).is_some());
        assert_eq!(store.delete_count(), 0);
        assert_eq!(applier.tombstone_count().await, 0);
    }

    #[tokio::test]
    async fn test_ordering_ignores_document_clock() {
        let store = MockStore::new();
        let applier = applier(&store);
        let second = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        // The document timestamp runs ahead of the oplog; the delete at the
        // next oplog position still wins.
        let ahead = second + chrono::Duration::milliseconds(500);
        let update = ChangeEvent::update(SourceRecord::new("p1", doc! { "_id": "p1" }, Some(ahead)))
            .at(second + chrono::Duration::microseconds(1));
        let delete = ChangeEvent::delete(
            RecordId::from("p1"),
            Some(second + chrono::Duration::microseconds(2)),
        );

        applier.apply(&update).await.unwrap();
        assert_eq!(applier.apply(&delete).await.unwrap(), ApplyOutcome::Deleted);
        assert_eq!(applier.apply(&update).await.unwrap(), ApplyOutcome::Stale);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_event_without_cluster_time_keeps_stored_position() {
        let store = MockStore::new();
        let applier = applier(&store);

        applier.apply(&update("p1", 1, 4)).await.unwrap();
        let unordered =
            ChangeEvent::update(SourceRecord::new("p1", doc! { "_id": "p1", "qty": 2 }, Some(at(9))));
        assert_eq!(applier.apply(&unordered).await.unwrap(), ApplyOutcome::Upserted);

        let stored = store.get(&RecordId::from("p1")).unwrap();
        assert_eq!(stored.fields.get_i32("qty").unwrap(), 2);
        assert_eq!(stored.source_cluster_time, Some(at(4)));
        assert_eq!(applier.apply(&update("p1", 0, 3)).await.unwrap(), ApplyOutcome::Stale);
    }
}
