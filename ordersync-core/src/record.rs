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

//! Source and derived record types.
//!
//! A [`SourceRecord`] is a product or order as the upstream service stores it.
//! A [`DerivedRecord`] is the projection the engine mirrors into a cache or
//! search index. Both are keyed by a [`RecordId`].
//!
//! # Example
//!
//! ```rust
//! use ordersync_core::record::{RecordId, SourceRecord};
//! use bson::{doc, oid::ObjectId};
//!
//! let oid = ObjectId::new();
//! let record = SourceRecord::from_document(
//!     doc! { "_id": oid, "title": "Desk lamp", "price": 25.0 },
//!     "updatedAt",
//! )
//! .unwrap();
//!
//! assert_eq!(record.id, RecordId::ObjectId(oid));
//! assert!(record.updated_at.is_none());
//! ```

use bson::{oid::ObjectId, spec::ElementType, Bson, Document};
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Errors raised while building records from raw documents.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecordError {
    /// The document has no `_id` field.
    #[error("document has no _id field")]
    MissingId,

    /// The `_id` is of a type the engine cannot key on.
    #[error("unsupported _id type: {0:?}")]
    UnsupportedKey(ElementType),
}

/// Key of a source or derived record.
///
/// MongoDB `_id` values are usually ObjectIds, but string and integer keys
/// are accepted too. The original BSON type is preserved so MongoDB-backed
/// stores write the same `_id` the source uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordId {
    /// A BSON ObjectId
    ObjectId(ObjectId),

    /// A 32 or 64 bit integer key
    Int(i64),

    /// A non-empty string key
    String(String),
}

impl RecordId {
    /// Builds a key from a BSON `_id` value.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::UnsupportedKey`] for documents, arrays, empty
    /// strings and other values that cannot serve as a key.
    pub fn from_bson(value: &Bson) -> Result<Self, RecordError> {
        match value {
            Bson::ObjectId(oid) => Ok(Self::ObjectId(*oid)),
            Bson::Int32(i) => Ok(Self::Int(i64::from(*i))),
            Bson::Int64(i) => Ok(Self::Int(*i)),
            Bson::String(s) if !s.is_empty() => Ok(Self::String(s.clone())),
            other => Err(RecordError::UnsupportedKey(other.element_type())),
        }
    }

    /// Reads the `_id` of a document.
    ///
    /// # Errors
    ///
    /// Returns an error if `_id` is missing or unsupported.
    pub fn from_document(document: &Document) -> Result<Self, RecordError> {
        document
            .get("_id")
            .ok_or(RecordError::MissingId)
            .and_then(Self::from_bson)
    }

    /// Parses the string form produced by [`fmt::Display`].
    ///
    /// Used by string-keyed stores such as the search index. A 24 character
    /// hex string becomes an ObjectId and a decimal string an integer key.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if let Ok(oid) = ObjectId::parse_str(value) {
            return Self::ObjectId(oid);
        }
        match value.parse::<i64>() {
            Ok(i) => Self::Int(i),
            Err(_) => Self::String(value.to_string()),
        }
    }

    /// Converts back to the BSON value used as `_id`.
    #[must_use]
    pub fn to_bson(&self) -> Bson {
        match self {
            Self::ObjectId(oid) => Bson::ObjectId(*oid),
            Self::Int(i) => Bson::Int64(*i),
            Self::String(s) => Bson::String(s.clone()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjectId(oid) => write!(f, "{}", oid.to_hex()),
            Self::Int(i) => write!(f, "{i}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<ObjectId> for RecordId {
    fn from(oid: ObjectId) -> Self {
        Self::ObjectId(oid)
    }
}

impl From<i64> for RecordId {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// An authoritative product or order as stored upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Record key (`_id`)
    pub id: RecordId,

    /// The full upstream document, `_id` included
    pub fields: Document,

    /// Last-modified time read from the configured timestamp field
    pub updated_at: Option<DateTime<Utc>>,
}

impl SourceRecord {
    /// Creates a record from its parts.
    pub fn new(id: impl Into<RecordId>, fields: Document, updated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            fields,
            updated_at,
        }
    }

    /// Builds a record from a raw upstream document.
    ///
    /// `timestamp_field` names the last-modified field (`updatedAt` for the
    /// order service's collections). A missing or unreadable timestamp is
    /// left as `None`; it does not make the record invalid.
    ///
    /// # Errors
    ///
    /// Returns an error if the document has no usable `_id`.
    pub fn from_document(document: Document, timestamp_field: &str) -> Result<Self, RecordError> {
        let id = RecordId::from_document(&document)?;
        let updated_at = document.get(timestamp_field).and_then(timestamp_from_bson);

        Ok(Self {
            id,
            fields: document,
            updated_at,
        })
    }
}

/// The engine-owned projection of a source record in a derived store.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRecord {
    /// Record key, equal to the source key
    pub id: RecordId,

    /// Projected fields as produced by the mapper
    pub fields: Document,

    /// The source document's last-modified time this projection was built from
    pub source_updated_at: Option<DateTime<Utc>>,

    /// Cluster time of the change this projection was built from
    pub source_cluster_time: Option<DateTime<Utc>>,

    /// When the engine last wrote this record
    pub synced_at: DateTime<Utc>,
}

impl DerivedRecord {
    /// Creates a derived record stamped with the current time.
    pub fn new(id: RecordId, fields: Document, source_updated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id,
            fields,
            source_updated_at,
            source_cluster_time: None,
            synced_at: Utc::now(),
        }
    }

    /// Sets the cluster time of the change the record reflects.
    #[must_use]
    pub fn with_cluster_time(mut self, cluster_time: Option<DateTime<Utc>>) -> Self {
        self.source_cluster_time = cluster_time;
        self
    }
}

/// Reads a timestamp from a BSON value.
///
/// Accepts BSON datetimes, RFC 3339 strings and oplog timestamps.
#[must_use]
pub fn timestamp_from_bson(value: &Bson) -> Option<DateTime<Utc>> {
    match value {
        Bson::DateTime(dt) => Some(dt.to_chrono()),
        Bson::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Bson::Timestamp(ts) => DateTime::from_timestamp(i64::from(ts.time), 0),
        _ => None,
    }
}

/// Returns true if a change at cluster time `candidate` may replace state
/// built from a change at `current` under last-writer-wins.
///
/// Equal timestamps replace (re-applying an event is idempotent). When
/// either side is unknown the write is allowed.
#[must_use]
pub fn may_replace(candidate: Option<DateTime<Utc>>, current: Option<DateTime<Utc>>) -> bool {
    match (candidate, current) {
        (Some(candidate), Some(current)) => candidate >= current,
        _ => true,
    }
}

/// Returns true if `candidate` is strictly newer than `current`.
///
/// Unknown timestamps count as newer so that reconciliation repairs records
/// it cannot prove are current.
#[must_use]
pub fn is_strictly_newer(candidate: Option<DateTime<Utc>>, current: Option<DateTime<Utc>>) -> bool {
    match (candidate, current) {
        (Some(candidate), Some(current)) => candidate > current,
        _ => true,
    }
}
