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

//! MongoDB-backed derived store.
//!
//! Each derived record is one document in the cache collection:
//!
//! ```text
//! { _id, ...mapped fields, sourceUpdatedAt, syncedAt }
//! ```
//!
//! `sourceUpdatedAt` is `null` when the source record carried no timestamp.
//! Writes are whole-document `replace_one` upserts, so applying the same
//! record twice leaves one identical document.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::DateTime;
use futures::StreamExt;
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::Collection;
use ordersync_core::record::{timestamp_from_bson, DerivedRecord, RecordId};
use ordersync_core::store::{DerivedStore, RecordStream, StoreError, StoreMetadata};
use tracing::{debug, instrument};

/// Field holding the source timestamp a cache document was built from.
pub const SOURCE_UPDATED_AT_FIELD: &str = "sourceUpdatedAt";

/// Field holding the source cluster time, in microseconds since the epoch.
pub const SOURCE_CLUSTER_TIME_FIELD: &str = "sourceClusterTime";

/// Field holding the time the engine last wrote a cache document.
pub const SYNCED_AT_FIELD: &str = "syncedAt";

/// Server error codes that are safe to retry.
const RETRYABLE_CODES: &[i32] = &[
    6,     // HostUnreachable
    7,     // HostNotFound
    89,    // NetworkTimeout
    91,    // ShutdownInProgress
    189,   // PrimarySteppedDown
    262,   // ExceededTimeLimit
    9001,  // SocketException
    10107, // NotWritablePrimary
    11600, // InterruptedAtShutdown
    11602, // InterruptedDueToReplStateChange
    13435, // NotPrimaryNoSecondaryOk
    13436, // NotPrimaryOrSecondary
];

/// Derived store over a MongoDB collection.
///
/// # Example
///
/// ```rust,no_run
/// use ordersync_stores::mongo_cache::MongoCacheStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
/// let store = MongoCacheStore::new(client.database("product_cache").collection("productcaches"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MongoCacheStore {
    collection: Collection<Document>,
    name: String,
}

impl MongoCacheStore {
    /// Creates a store writing to `collection`.
    #[must_use]
    pub fn new(collection: Collection<Document>) -> Self {
        let name = format!("{}.{}", collection.namespace().db, collection.name());
        Self { collection, name }
    }

    /// The underlying collection.
    #[must_use]
    pub fn collection(&self) -> &Collection<Document> {
        &self.collection
    }
}

/// Builds the cache document for `record`.
///
/// A mapped field named `_id` or colliding with a bookkeeping field is
/// overwritten.
#[must_use]
pub fn to_document(record: &DerivedRecord) -> Document {
    let mut document = doc! { "_id": record.id.to_bson() };
    for (key, value) in &record.fields {
        if key != "_id" {
            document.insert(key.clone(), value.clone());
        }
    }
    document.insert(
        SOURCE_UPDATED_AT_FIELD,
        record
            .source_updated_at
            .map_or(Bson::Null, |ts| Bson::DateTime(bson::DateTime::from_chrono(ts))),
    );
    document.insert(
        SOURCE_CLUSTER_TIME_FIELD,
        record
            .source_cluster_time
            .map_or(Bson::Null, |ts| Bson::Int64(ts.timestamp_micros())),
    );
    document.insert(
        SYNCED_AT_FIELD,
        bson::DateTime::from_chrono(record.synced_at),
    );
    document
}

/// Reads a cache document back into a [`DerivedRecord`].
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if the document has no usable `_id`.
pub fn from_document(mut document: Document) -> Result<DerivedRecord, StoreError> {
    let id = RecordId::from_document(&document)
        .map_err(|e| StoreError::serialization(e, "cache document has no usable _id"))?;
    document.remove("_id");

    let source_updated_at = document
        .remove(SOURCE_UPDATED_AT_FIELD)
        .as_ref()
        .and_then(timestamp_from_bson);
    let source_cluster_time = document
        .remove(SOURCE_CLUSTER_TIME_FIELD)
        .and_then(|v| v.as_i64())
        .and_then(DateTime::from_timestamp_micros);
    let synced_at = document
        .remove(SYNCED_AT_FIELD)
        .as_ref()
        .and_then(timestamp_from_bson);

    let mut record =
        DerivedRecord::new(id, document, source_updated_at).with_cluster_time(source_cluster_time);
    if let Some(synced_at) = synced_at {
        record.synced_at = synced_at;
    }
    Ok(record)
}

enum Failure {
    Connection,
    Encoding,
    Write { retryable: bool },
}

/// Maps a driver error onto the store error taxonomy.
#[must_use]
pub fn classify(error: MongoError) -> StoreError {
    let labelled = error.contains_label("RetryableWriteError")
        || error.contains_label("TransientTransactionError");

    let failure = match error.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => Failure::Connection,
        ErrorKind::BsonSerialization(_) | ErrorKind::BsonDeserialization(_) => Failure::Encoding,
        ErrorKind::Command(command) => Failure::Write {
            retryable: labelled || RETRYABLE_CODES.contains(&command.code),
        },
        ErrorKind::Write(WriteFailure::WriteConcernError(_)) => Failure::Write { retryable: true },
        ErrorKind::Write(WriteFailure::WriteError(write)) => Failure::Write {
            retryable: labelled || RETRYABLE_CODES.contains(&write.code),
        },
        _ => Failure::Write { retryable: labelled },
    };

    match failure {
        Failure::Connection => StoreError::connection(error),
        Failure::Encoding => StoreError::serialization(error, "failed to encode cache document"),
        Failure::Write { retryable } => StoreError::write(error, retryable),
    }
}

#[async_trait]
impl DerivedStore for MongoCacheStore {
    async fn find_by_key(&self, key: &RecordId) -> Result<Option<DerivedRecord>, StoreError> {
        let found = self
            .collection
            .find_one(doc! { "_id": key.to_bson() })
            .await
            .map_err(classify)?;
        found.map(from_document).transpose()
    }

    #[instrument(skip(self, record), fields(store = %self.name, key = %record.id))]
    async fn upsert(&self, record: DerivedRecord) -> Result<(), StoreError> {
        let document = to_document(&record);
        let result = self
            .collection
            .replace_one(doc! { "_id": record.id.to_bson() }, document)
            .upsert(true)
            .await
            .map_err(classify)?;

        debug!(
            matched = result.matched_count,
            upserted = result.upserted_id.is_some(),
            "Cache document written"
        );
        Ok(())
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn delete_by_key(&self, key: &RecordId) -> Result<bool, StoreError> {
        let result = self
            .collection
            .delete_one(doc! { "_id": key.to_bson() })
            .await
            .map_err(classify)?;
        Ok(result.deleted_count > 0)
    }

    async fn scan_all(&self) -> Result<RecordStream, StoreError> {
        let cursor = self.collection.find(doc! {}).await.map_err(classify)?;
        Ok(cursor
            .map(|item| item.map_err(classify).and_then(from_document))
            .boxed())
    }

    fn metadata(&self) -> StoreMetadata {
        StoreMetadata::new(self.name.clone(), "mongodb")
            .with_property("collection", self.collection.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_document_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let record = DerivedRecord::new(
            RecordId::from("p1"),
            doc! { "title": "Lamp", "price": 12.5, "seller": { "id": "s1" } },
            Some(ts),
        );

        let document = to_document(&record);
        assert_eq!(document.get_str("_id").unwrap(), "p1");
        assert_eq!(document.get_str("title").unwrap(), "Lamp");
        assert!(document.get_datetime(SOURCE_UPDATED_AT_FIELD).is_ok());
        assert!(document.get_datetime(SYNCED_AT_FIELD).is_ok());

        let back = from_document(document).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.fields, record.fields);
        assert_eq!(back.source_updated_at, Some(ts));
    }

    #[test]
    fn test_cluster_time_keeps_microseconds() {
        let second = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let record = DerivedRecord::new(RecordId::from("p1"), doc! { "qty": 3 }, Some(second))
            .with_cluster_time(Some(second + chrono::Duration::microseconds(2)));

        let document = to_document(&record);
        let back = from_document(document).unwrap();

        assert_eq!(back.source_cluster_time, record.source_cluster_time);
        assert!(back.fields.get(SOURCE_CLUSTER_TIME_FIELD).is_none());
    }

    #[test]
    fn test_missing_source_timestamp_is_null() {
        let record = DerivedRecord::new(RecordId::from(7_i64), doc! { "title": "x" }, None);
        let document = to_document(&record);

        assert_eq!(document.get(SOURCE_UPDATED_AT_FIELD), Some(&Bson::Null));
        assert_eq!(document.get(SOURCE_CLUSTER_TIME_FIELD), Some(&Bson::Null));
        let back = from_document(document).unwrap();
        assert_eq!(back.source_updated_at, None);
        assert_eq!(back.source_cluster_time, None);
    }

    #[test]
    fn test_mapped_id_field_does_not_override_key() {
        let record = DerivedRecord::new(RecordId::from("real"), doc! { "_id": "fake" }, None);
        assert_eq!(to_document(&record).get_str("_id").unwrap(), "real");
    }

    #[test]
    fn test_document_without_id_is_rejected() {
        let err = from_document(doc! { "title": "orphan" }).unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.category(), "serialization");
    }
}
