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

//! Change notifications and their canonical form.
//!
//! A source watcher yields [`RawChange`]s, which mirror what a MongoDB change
//! stream delivers. [`normalize`] turns each one into a [`ChangeEvent`], the
//! only shape the applier, reconciler and retry queue deal with.
//!
//! Events are ordered by their cluster time, the oplog position of the
//! mutation. Every operation kind carries one, so an update and a later
//! delete of the same record compare on the same clock. The document's own
//! `updatedAt` is kept as [`ChangeEvent::source_timestamp`] and only decides
//! whether reconciliation rewrites a record.
//!
//! # Examples
//!
//! ```rust
//! use ordersync_core::event::{normalize, Namespace, Operation, OperationType, RawChange};
//! use bson::doc;
//! use chrono::Utc;
//!
//! let raw = RawChange {
//!     operation: OperationType::Delete,
//!     namespace: Namespace::new("shop", "products"),
//!     document_key: Some(doc! { "_id": "p1" }),
//!     full_document: None,
//!     cluster_time: Utc::now(),
//! };
//!
//! let event = normalize(raw, "updatedAt").expect("deletes are kept");
//! assert_eq!(event.operation, Operation::Delete);
//! assert!(event.payload.is_none());
//! assert!(event.cluster_time.is_some());
//! ```

use crate::record::{RecordId, SourceRecord};
use bson::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// MongoDB change stream operation types.
///
/// The `Unknown` variant keeps the original operation name so that kinds
/// introduced by newer servers can be logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted
    Insert,

    /// A document was modified in place
    Update,

    /// A document was deleted
    Delete,

    /// A document was replaced entirely
    Replace,

    /// The change stream was invalidated (collection dropped, renamed, etc.)
    Invalidate,

    /// A collection was dropped
    Drop,

    /// A database was dropped
    #[serde(rename = "dropdatabase")]
    DropDatabase,

    /// A collection was renamed
    Rename,

    /// An operation type this build does not know about
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Returns the change stream name of the operation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Invalidate => "invalidate",
            Self::Drop => "drop",
            Self::DropDatabase => "dropDatabase",
            Self::Rename => "rename",
            Self::Unknown(name) => name,
        }
    }
}

/// MongoDB namespace (database + collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Namespace {
    /// Database name
    pub database: String,

    /// Collection name
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// A mutation notification as delivered by the source feed.
///
/// Insert and update notifications are expected to carry `full_document`
/// (the watcher requests `updateLookup`); deletes only carry the key.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    /// Kind of mutation
    pub operation: OperationType,

    /// Where it happened
    pub namespace: Namespace,

    /// `{ _id: ... }` of the affected document
    pub document_key: Option<Document>,

    /// Post-image of the document, when the server provides one
    pub full_document: Option<Document>,

    /// Oplog time of the mutation, see [`cluster_time_from_timestamp`]
    pub cluster_time: DateTime<Utc>,
}

/// The three mutations the engine propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Record created upstream
    Insert,

    /// Record modified or replaced upstream
    Update,

    /// Record removed upstream
    Delete,
}

impl Operation {
    /// Lowercase name, used as a log field and metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical change flowing from the watcher (or reconciler) to the applier.
///
/// `payload` is always `None` for deletes; consumers must not expect a
/// document there.
///
/// An event without a cluster time cannot be ordered against other events.
/// The applier lets it through instead of guessing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Mutation kind
    pub operation: Operation,

    /// Key of the affected record
    pub key: RecordId,

    /// Full source record for inserts and updates
    pub payload: Option<SourceRecord>,

    /// The document's last-modified time, `None` for deletes
    pub source_timestamp: Option<DateTime<Utc>>,

    /// Oplog position of the mutation, used for last-writer-wins
    pub cluster_time: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    /// Creates an insert event carrying `record`, without a cluster time.
    #[must_use]
    pub fn insert(record: SourceRecord) -> Self {
        Self::with_payload(Operation::Insert, record)
    }

    /// Creates an update event carrying `record`, without a cluster time.
    #[must_use]
    pub fn update(record: SourceRecord) -> Self {
        Self::with_payload(Operation::Update, record)
    }

    /// Creates a delete event for `key` at `cluster_time`.
    #[must_use]
    pub fn delete(key: RecordId, cluster_time: Option<DateTime<Utc>>) -> Self {
        Self {
            operation: Operation::Delete,
            key,
            payload: None,
            source_timestamp: None,
            cluster_time,
        }
    }

    fn with_payload(operation: Operation, record: SourceRecord) -> Self {
        Self {
            operation,
            key: record.id.clone(),
            source_timestamp: record.updated_at,
            cluster_time: None,
            payload: Some(record),
        }
    }

    /// Stamps the event with the oplog position it was observed at.
    #[must_use]
    pub fn at(mut self, cluster_time: DateTime<Utc>) -> Self {
        self.cluster_time = Some(cluster_time);
        self
    }

    /// Returns true if this is a delete.
    #[inline]
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }
}

/// Maps a raw notification to a [`ChangeEvent`].
///
/// Returns `None` (after logging a warning) for operation kinds the engine
/// does not propagate and for notifications without a usable key. An
/// insert or update whose document cannot be read keeps `payload: None`;
/// the applier rejects it as a permanent failure.
#[must_use]
pub fn normalize(raw: RawChange, timestamp_field: &str) -> Option<ChangeEvent> {
    let operation = match raw.operation {
        OperationType::Insert => Operation::Insert,
        OperationType::Update | OperationType::Replace => Operation::Update,
        OperationType::Delete => Operation::Delete,
        ref other => {
            warn!(
                operation = other.as_str(),
                namespace = %raw.namespace.full_name(),
                "Dropping unrecognized change operation"
            );
            return None;
        }
    };

    let key = match raw.document_key.as_ref().map(RecordId::from_document) {
        Some(Ok(key)) => key,
        Some(Err(e)) => {
            warn!(operation = %operation, error = %e, "Dropping change with unusable document key");
            return None;
        }
        None => {
            warn!(operation = %operation, "Dropping change without document key");
            return None;
        }
    };

    if operation == Operation::Delete {
        return Some(ChangeEvent::delete(key, Some(raw.cluster_time)));
    }

    let payload = raw
        .full_document
        .and_then(|doc| match SourceRecord::from_document(doc, timestamp_field) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = %key, error = %e, "Change carries an unreadable full document");
                None
            }
        });

    let source_timestamp = payload.as_ref().and_then(|record| record.updated_at);

    Some(ChangeEvent {
        operation,
        key,
        payload,
        source_timestamp,
        cluster_time: Some(raw.cluster_time),
    })
}

/// Converts an oplog timestamp into a totally ordered point in time.
///
/// The increment orders mutations within one second. It is folded into the
/// microseconds so two mutations in the same second still compare in oplog
/// order after the conversion. Increments past 999 999 saturate.
#[must_use]
pub fn cluster_time_from_timestamp(ts: bson::Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::from(ts.time), ts.increment.min(999_999) * 1_000)
}

/// Conversion from the MongoDB driver's change stream event.
impl From<mongodb::change_stream::event::ChangeStreamEvent<Document>> for RawChange {
    fn from(event: mongodb::change_stream::event::ChangeStreamEvent<Document>) -> Self {
        use mongodb::change_stream::event::OperationType as MongoOpType;

        let operation = match event.operation_type {
            MongoOpType::Insert => OperationType::Insert,
            MongoOpType::Update => OperationType::Update,
            MongoOpType::Delete => OperationType::Delete,
            MongoOpType::Replace => OperationType::Replace,
            MongoOpType::Invalidate => OperationType::Invalidate,
            MongoOpType::Drop => OperationType::Drop,
            MongoOpType::DropDatabase => OperationType::DropDatabase,
            MongoOpType::Rename => OperationType::Rename,
            other => OperationType::Unknown(format!("{other:?}")),
        };

        let namespace = event
            .ns
            .map(|ns| Namespace::new(ns.db, ns.coll.unwrap_or_default()))
            .unwrap_or_default();

        let cluster_time = event
            .cluster_time
            .and_then(cluster_time_from_timestamp)
            .unwrap_or_else(|| {
                warn!("Change stream event without a valid cluster time, using current time");
                Utc::now()
            });

        Self {
            operation,
            namespace,
            document_key: event.document_key,
            full_document: event.full_document,
            cluster_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use chrono::TimeZone;

    fn raw(operation: OperationType, key: Option<Document>, full: Option<Document>) -> RawChange {
        RawChange {
            operation,
            namespace: Namespace::new("shop", "products"),
            document_key: key,
            full_document: full,
            cluster_time: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_operation_type_serialization() {
        let json = serde_json::to_string(&OperationType::Insert).unwrap();
        assert_eq!(json, r#""insert""#);

        let op: OperationType = serde_json::from_str(r#""shardCollection""#).unwrap();
        assert_eq!(op, OperationType::Unknown("shardCollection".into()));
    }

    #[test]
    fn test_normalize_insert_uses_document_timestamp() {
        let updated = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let full = doc! { "_id": "p1", "qty": 5, "updatedAt": bson::DateTime::from_chrono(updated) };

        let event = normalize(
            raw(OperationType::Insert, Some(doc! { "_id": "p1" }), Some(full)),
            "updatedAt",
        )
        .unwrap();

        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.key, RecordId::from("p1"));
        assert_eq!(event.source_timestamp, Some(updated));
        assert_eq!(event.cluster_time, Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        assert_eq!(event.payload.unwrap().fields.get_i32("qty").unwrap(), 5);
    }

    #[test]
    fn test_normalize_update_without_document_timestamp() {
        let event = normalize(
            raw(
                OperationType::Update,
                Some(doc! { "_id": "p1" }),
                Some(doc! { "_id": "p1", "qty": 3 }),
            ),
            "updatedAt",
        )
        .unwrap();

        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.source_timestamp, None);
        assert_eq!(
            event.cluster_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_normalize_replace_is_update() {
        let event = normalize(
            raw(
                OperationType::Replace,
                Some(doc! { "_id": 1 }),
                Some(doc! { "_id": 1 }),
            ),
            "updatedAt",
        )
        .unwrap();
        assert_eq!(event.operation, Operation::Update);
    }

    #[test]
    fn test_normalize_delete_has_no_payload() {
        let event = normalize(
            raw(OperationType::Delete, Some(doc! { "_id": "p1" }), None),
            "updatedAt",
        )
        .unwrap();

        assert!(event.is_delete());
        assert!(event.payload.is_none());
        assert!(event.source_timestamp.is_none());
        assert!(event.cluster_time.is_some());
    }

    #[test]
    fn test_update_then_delete_in_same_second_keep_oplog_order() {
        // The document says 10:00:00.500, but the oplog orders the update
        // one increment before the delete within second 10:00:00.
        let second = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let secs = u32::try_from(second.timestamp()).unwrap();
        let updated = second + chrono::Duration::milliseconds(500);

        let mut update = raw(
            OperationType::Update,
            Some(doc! { "_id": "p1" }),
            Some(doc! { "_id": "p1", "updatedAt": bson::DateTime::from_chrono(updated) }),
        );
        update.cluster_time = cluster_time_from_timestamp(bson::Timestamp { time: secs, increment: 1 }).unwrap();
        let mut delete = raw(OperationType::Delete, Some(doc! { "_id": "p1" }), None);
        delete.cluster_time = cluster_time_from_timestamp(bson::Timestamp { time: secs, increment: 2 }).unwrap();

        let update = normalize(update, "updatedAt").unwrap();
        let delete = normalize(delete, "updatedAt").unwrap();

        assert_eq!(update.source_timestamp, Some(updated));
        assert!(update.cluster_time < delete.cluster_time);
    }

    #[test]
    fn test_cluster_time_from_timestamp_orders_by_increment() {
        let a = cluster_time_from_timestamp(bson::Timestamp { time: 100, increment: 7 }).unwrap();
        let b = cluster_time_from_timestamp(bson::Timestamp { time: 100, increment: 8 }).unwrap();
        let c = cluster_time_from_timestamp(bson::Timestamp { time: 101, increment: 0 }).unwrap();
        assert!(a < b && b < c);
        assert_eq!(a.timestamp(), 100);
    }

    #[test]
    fn test_normalize_update_without_full_document_keeps_event() {
        let event = normalize(
            raw(OperationType::Update, Some(doc! { "_id": "p1" }), None),
            "updatedAt",
        )
        .unwrap();
        assert!(event.payload.is_none());
    }

    #[test]
    fn test_normalize_drops_unrecognized_operations() {
        for op in [
            OperationType::Drop,
            OperationType::Rename,
            OperationType::DropDatabase,
            OperationType::Invalidate,
            OperationType::Unknown("modify".into()),
        ] {
            assert!(normalize(raw(op, Some(doc! { "_id": 1 }), None), "updatedAt").is_none());
        }
    }

    #[test]
    fn test_normalize_drops_missing_key() {
        assert!(normalize(raw(OperationType::Delete, None, None), "updatedAt").is_none());
        assert!(normalize(
            raw(OperationType::Delete, Some(doc! { "_id": [1, 2] }), None),
            "updatedAt"
        )
        .is_none());
    }
}
