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

//! Bootstrap reconciliation between a source and its derived store.
//!
//! Every source record is looked up in the store. Missing records are
//! inserted, outdated ones updated, current ones left alone. Nothing is
//! ever deleted: a derived record whose source is gone stays until a delete
//! event for it arrives.
//!
//! Whether a record is outdated is decided on document timestamps
//! (`updatedAt`). The writes themselves are stamped with the source's
//! cluster time read before the scan starts, so a live change or delete
//! applied in the meantime is never overwritten by the older scan image.

use crate::applier::{ApplyOutcome, SyncApplier, SyncError};
use crate::event::ChangeEvent;
use crate::metrics;
use crate::record::{is_strictly_newer, RecordId};
use crate::source::{Source, SourceError};
use crate::store::StoreError;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// A reconciliation run that could not complete.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The source could not be read.
    #[error("failed to read source: {0}")]
    Source(#[source] SourceError),

    /// The derived store could not be queried.
    #[error("failed to look up derived record {key}: {source}")]
    Lookup {
        /// Key being looked up
        key: RecordId,
        /// Store failure
        #[source]
        source: StoreError,
    },

    /// A write failed transiently.
    #[error("failed to write derived record {key}: {source}")]
    Apply {
        /// Key being written
        key: RecordId,
        /// Apply failure
        #[source]
        source: SyncError,
    },
}

/// Counters from one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Source records read, malformed ones included
    pub scanned: u64,
    /// Records missing from the store and written
    pub inserted: u64,
    /// Outdated records rewritten
    pub updated: u64,
    /// Records already current
    pub unchanged: u64,
    /// Records skipped because they can never be applied
    pub invalid: u64,
}

/// Brings a derived store up to date with its source.
pub struct Reconciler {
    engine: String,
    source: Arc<dyn Source>,
    applier: Arc<SyncApplier>,
}

impl Reconciler {
    /// Creates a reconciler writing through `applier`.
    #[must_use]
    pub fn new(source: Arc<dyn Source>, applier: Arc<SyncApplier>) -> Self {
        Self {
            engine: applier.engine().to_string(),
            source,
            applier,
        }
    }

    /// Runs one reconciliation pass.
    ///
    /// # Errors
    ///
    /// Source read failures, store lookup failures and transient write
    /// failures end the run. Malformed or rejected records are counted in
    /// [`ReconcileReport::invalid`] and skipped.
    #[instrument(skip(self), fields(engine = %self.engine, source = %self.source.name()))]
    pub async fn run(&self) -> Result<ReconcileReport, ReconcileError> {
        let started = Instant::now();
        info!("Starting reconciliation");

        let result = self.reconcile().await;
        metrics::record_reconcile_duration(&self.engine, started.elapsed());

        match &result {
            Ok(report) => {
                info!(
                    scanned = report.scanned,
                    inserted = report.inserted,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    invalid = report.invalid,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Reconciliation complete"
                );
                metrics::increment_reconcile_runs(&self.engine, "completed");
                metrics::increment_reconcile_records(&self.engine, "inserted", report.inserted);
                metrics::increment_reconcile_records(&self.engine, "updated", report.updated);
                metrics::increment_reconcile_records(&self.engine, "unchanged", report.unchanged);
                metrics::increment_reconcile_records(&self.engine, "invalid", report.invalid);
            }
            Err(e) => {
                warn!(error = %e, "Reconciliation failed");
                metrics::increment_reconcile_runs(&self.engine, "failed");
            }
        }

        result
    }

    async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let snapshot_time = self
            .source
            .cluster_time()
            .await
            .map_err(ReconcileError::Source)?;
        debug!(cluster_time = ?snapshot_time, "Scan position");

        let mut records = self.source.scan().await.map_err(ReconcileError::Source)?;
        let store = self.applier.store();
        let mut report = ReconcileReport::default();

        while let Some(item) = records.next().await {
            report.scanned += 1;

            let record = match item {
                Ok(record) => record,
                Err(SourceError::Malformed(e)) => {
                    warn!(error = %e, "Skipping malformed source document");
                    report.invalid += 1;
                    continue;
                }
                Err(e) => return Err(ReconcileError::Source(e)),
            };

            let key = record.id.clone();
            let current = store
                .find_by_key(&key)
                .await
                .map_err(|source| ReconcileError::Lookup {
                    key: key.clone(),
                    source,
                })?;

            let event = match current {
                None => ChangeEvent::insert(record),
                Some(current)
                    if is_strictly_newer(record.updated_at, current.source_updated_at) =>
                {
                    ChangeEvent::update(record)
                }
                Some(_) => {
                    report.unchanged += 1;
                    continue;
                }
            };

            let event = match snapshot_time {
                Some(at) => event.at(at),
                None => event,
            };
            let is_insert = event.operation == crate::event::Operation::Insert;
            match self.applier.apply(&event).await {
                Ok(ApplyOutcome::Stale) => report.unchanged += 1,
                Ok(_) if is_insert => report.inserted += 1,
                Ok(_) => report.updated += 1,
                Err(e @ SyncError::Transient(_)) => {
                    return Err(ReconcileError::Apply { key, source: e });
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping record that cannot be applied");
                    report.invalid += 1;
                }
            }

            if report.scanned % 1000 == 0 {
                debug!(scanned = report.scanned, "Reconciliation progress");
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{IdentityMapper, ProductCacheMapper};
    use crate::record::{DerivedRecord, RecordError};
    use crate::source::MockSource;
    use crate::store::MockStore;
    use bson::doc;
    use chrono::{TimeZone, Utc};

    fn ts(day: u32) -> bson::DateTime {
        bson::DateTime::from_chrono(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap())
    }

    fn setup(source: &MockSource, store: &MockStore) -> Reconciler {
        let applier = Arc::new(SyncApplier::new(
            "test",
            Arc::new(store.clone()),
            Arc::new(IdentityMapper),
        ));
        Reconciler::new(Arc::new(source.clone()), applier)
    }

    #[tokio::test]
    async fn test_reconcile_fills_empty_store() {
        let source = MockSource::new("shop.products");
        let store = MockStore::new();
        source.seed(doc! { "_id": "a", "updatedAt": ts(1) });
        source.seed(doc! { "_id": "b", "updatedAt": ts(1) });

        let report = setup(&source, &store).run().await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_updates_only_outdated() {
        let source = MockSource::new("shop.products");
        let store = MockStore::new();
        source.seed(doc! { "_id": "old", "v": 2, "updatedAt": ts(5) });
        source.seed(doc! { "_id": "same", "v": 1, "updatedAt": ts(3) });

        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();
        store.seed(DerivedRecord::new(RecordId::from("old"), doc! { "v": 1 }, Some(day(1))));
        store.seed(DerivedRecord::new(RecordId::from("same"), doc! { "v": 1 }, Some(day(3))));

        let report = setup(&source, &store).run().await.unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.get(&RecordId::from("old")).unwrap().fields.get_i32("v").unwrap(), 2);
        assert_eq!(store.upsert_count(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_writes_carry_scan_position() {
        let source = MockSource::new("shop.products");
        let store = MockStore::new();
        source.seed(doc! { "_id": "a", "updatedAt": ts(1) });

        setup(&source, &store).run().await.unwrap();

        let written = store.get(&RecordId::from("a")).unwrap().source_cluster_time.unwrap();
        let later = source.cluster_time().await.unwrap().unwrap();
        assert!(written < later);
    }

    #[tokio::test]
    async fn test_reconcile_does_not_overwrite_later_live_write() {
        let source = MockSource::new("shop.products");
        let store = MockStore::new();
        source.seed(doc! { "_id": "a", "v": 2, "updatedAt": ts(5) });

        // Applied from the change stream after the scan position was taken.
        let live = Utc::now() + chrono::Duration::hours(1);
        let day = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.seed(
            DerivedRecord::new(RecordId::from("a"), doc! { "v": 3 }, Some(day))
                .with_cluster_time(Some(live)),
        );

        let report = setup(&source, &store).run().await.unwrap();

        assert_eq!(report.unchanged, 1);
        assert_eq!(store.get(&RecordId::from("a")).unwrap().fields.get_i32("v").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_never_deletes() {
        let source = MockSource::new("shop.products");
        let store = MockStore::new();
        store.seed(DerivedRecord::new(RecordId::from("orphan"), doc! {}, None));

        let report = setup(&source, &store).run().await.unwrap();

        assert_eq!(report.scanned, 0);
        assert!(store.get(&RecordId::from("orphan")).is_some());
    }

    #[tokio::test]
    async fn test_reconcile_counts_invalid_records() {
        let source = MockSource::new("shop.products");
        let store = MockStore::new();
        source.seed(doc! { "_id": "bad", "title": "no price" });
        source.seed_malformed(RecordError::MissingId);

        let applier = Arc::new(SyncApplier::new(
            "test",
            Arc::new(store.clone()),
            Arc::new(ProductCacheMapper),
        ));
        let report = Reconciler::new(Arc::new(source), applier).run().await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.invalid, 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_aborts_on_transient_failure() {
        let source = MockSource::new("shop.products");
        let store = MockStore::new();
        source.seed(doc! { "_id": "a" });
        store.fail_next_writes(1);

        let err = setup(&source, &store).run().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Apply { .. }));
    }

    #[tokio::test]
    async fn test_reconcile_aborts_on_source_failure() {
        let source = MockSource::new("shop.products");
        let store = MockStore::new();
        source.fail_next_scans(1);

        let err = setup(&source, &store).run().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Source(_)));
    }
}
