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

//! Derived Store Trait and Error Types
//!
//! A [`DerivedStore`] is a read-optimized copy of a source collection: the
//! product cache or the order search index. The engine is its only writer.
//!
//! Implementations live in `ordersync-stores`. [`MockStore`] is an in-memory
//! store with failure injection for tests.
//!
//! # Implementing a store
//!
//! ```rust
//! use ordersync_core::store::{DerivedStore, StoreError, StoreMetadata, RecordStream};
//! use ordersync_core::record::{DerivedRecord, RecordId};
//! use async_trait::async_trait;
//! use futures::StreamExt;
//!
//! struct NullStore;
//!
//! #[async_trait]
//! impl DerivedStore for NullStore {
//!     async fn find_by_key(&self, _key: &RecordId) -> Result<Option<DerivedRecord>, StoreError> {
//!         Ok(None)
//!     }
//!
//!     async fn upsert(&self, _record: DerivedRecord) -> Result<(), StoreError> {
//!         Ok(())
//!     }
//!
//!     async fn delete_by_key(&self, _key: &RecordId) -> Result<bool, StoreError> {
//!         Ok(false)
//!     }
//!
//!     async fn scan_all(&self) -> Result<RecordStream, StoreError> {
//!         Ok(futures::stream::empty().boxed())
//!     }
//!
//!     fn metadata(&self) -> StoreMetadata {
//!         StoreMetadata::new("null", "null")
//!     }
//! }
//! ```

use crate::record::{DerivedRecord, RecordId};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors that can occur when reading or writing a derived store.
///
/// Each variant says whether retrying the same call may succeed; the
/// applier turns that into a transient or permanent sync failure.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached.
    ///
    /// Network timeouts, refused connections, DNS failures. Retryable.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message
        message: String,
        /// The underlying connection error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A record could not be converted to or from the store's format.
    ///
    /// Not retryable: the same record will fail the same way.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message
        message: String,
        /// The underlying serialization error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The store rejected or failed a read or write.
    #[error("Write error: {message}")]
    Write {
        /// Human-readable error message
        message: String,
        /// Whether this specific failure is retryable
        retryable: bool,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The store is throttling requests (e.g. HTTP 429).
    #[error("Capacity error: {message}")]
    Capacity {
        /// Human-readable error message
        message: String,
        /// Suggested wait time before retry
        retry_after: Option<std::time::Duration>,
    },

    /// Invalid store configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Human-readable error message
        message: String,
        /// Configuration parameter name if applicable
        parameter: Option<String>,
    },
}

impl StoreError {
    /// Creates a connection error from any error type.
    #[must_use]
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Connection {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a connection error with a custom message.
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a serialization error from any error type.
    #[must_use]
    pub fn serialization(
        source: impl std::error::Error + Send + Sync + 'static,
        message: impl Into<String>,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with retryability information.
    #[must_use]
    pub fn write(source: impl std::error::Error + Send + Sync + 'static, retryable: bool) -> Self {
        Self::Write {
            message: source.to_string(),
            retryable,
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with a custom message.
    #[must_use]
    pub fn write_msg(message: impl Into<String>, retryable: bool) -> Self {
        Self::Write {
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Creates a capacity error.
    #[must_use]
    pub fn capacity(message: impl Into<String>, retry_after: Option<std::time::Duration>) -> Self {
        Self::Capacity {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>, parameter: Option<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            parameter,
        }
    }

    /// Returns whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Capacity { .. } => true,
            Self::Serialization { .. } | Self::Configuration { .. } => false,
            Self::Write { retryable, .. } => *retryable,
        }
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Serialization { .. } => "serialization",
            Self::Write { .. } => "write",
            Self::Capacity { .. } => "capacity",
            Self::Configuration { .. } => "configuration",
        }
    }
}

/// Metadata describing a store, used in logs and metric labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Human-readable name (e.g. "product-cache")
    pub name: String,

    /// Store type identifier (e.g. "mongodb", "elasticsearch")
    pub store_type: String,

    /// Additional store-specific metadata
    pub properties: HashMap<String, String>,
}

impl StoreMetadata {
    /// Creates new metadata with required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, store_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store_type: store_type.into(),
            properties: HashMap::new(),
        }
    }

    /// Adds a custom property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Stream of records produced by [`DerivedStore::scan_all`].
pub type RecordStream = BoxStream<'static, Result<DerivedRecord, StoreError>>;

/// A derived, read-optimized store keyed by [`RecordId`].
///
/// All methods take `&self`; implementations are shared between the
/// engine's tasks behind an `Arc`.
#[async_trait]
pub trait DerivedStore: Send + Sync {
    /// Looks up one record.
    async fn find_by_key(&self, key: &RecordId) -> Result<Option<DerivedRecord>, StoreError>;

    /// Inserts or fully replaces the record with `record.id`.
    async fn upsert(&self, record: DerivedRecord) -> Result<(), StoreError>;

    /// Deletes the record if present. Returns whether anything was deleted;
    /// a missing key is not an error.
    async fn delete_by_key(&self, key: &RecordId) -> Result<bool, StoreError>;

    /// Streams every record in the store.
    async fn scan_all(&self) -> Result<RecordStream, StoreError>;

    /// Returns metadata about this store.
    fn metadata(&self) -> StoreMetadata;
}

#[derive(Debug, Default)]
struct MockStoreState {
    records: BTreeMap<String, DerivedRecord>,
    fail_writes: usize,
    fail_reads: usize,
    permanent_failures: bool,
    upserts: usize,
    deletes: usize,
}

/// In-memory derived store for tests.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
///
/// # Examples
///
/// ```rust
/// use ordersync_core::store::{DerivedStore, MockStore};
/// use ordersync_core::record::{DerivedRecord, RecordId};
/// use bson::doc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MockStore::new();
/// store.fail_next_writes(1);
///
/// let record = DerivedRecord::new(RecordId::from("p1"), doc! { "title": "Lamp" }, None);
/// assert!(store.upsert(record.clone()).await.is_err());
/// store.upsert(record).await?;
///
/// assert_eq!(store.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    state: Arc<Mutex<MockStoreState>>,
}

impl MockStore {
    /// Creates an empty mock store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockStoreState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Inserts a record directly, bypassing failure injection and counters.
    pub fn seed(&self, record: DerivedRecord) {
        self.lock().records.insert(record.id.to_string(), record);
    }

    /// Makes the next `n` upserts or deletes fail with a retryable error.
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().fail_writes = n;
    }

    /// Makes the next `n` lookups fail with a retryable error.
    pub fn fail_next_reads(&self, n: usize) {
        self.lock().fail_reads = n;
    }

    /// Makes injected write failures non-retryable.
    pub fn with_permanent_failures(self) -> Self {
        self.lock().permanent_failures = true;
        self
    }

    /// Returns a copy of the record stored under `key`.
    #[must_use]
    pub fn get(&self, key: &RecordId) -> Option<DerivedRecord> {
        self.lock().records.get(&key.to_string()).cloned()
    }

    /// Returns a copy of every record, ordered by key.
    #[must_use]
    pub fn records(&self) -> Vec<DerivedRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Returns true if no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful upserts.
    #[must_use]
    pub fn upsert_count(&self) -> usize {
        self.lock().upserts
    }

    /// Number of successful deletes that removed a record.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.lock().deletes
    }

    fn injected_write_failure(state: &mut MockStoreState) -> Option<StoreError> {
        if state.fail_writes == 0 {
            return None;
        }
        state.fail_writes -= 1;
        Some(if state.permanent_failures {
            StoreError::write_msg("Simulated rejected document", false)
        } else {
            StoreError::connection_msg("Simulated connection failure")
        })
    }
}

#[async_trait]
impl DerivedStore for MockStore {
    async fn find_by_key(&self, key: &RecordId) -> Result<Option<DerivedRecord>, StoreError> {
        let mut state = self.lock();
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(StoreError::connection_msg("Simulated read failure"));
        }
        Ok(state.records.get(&key.to_string()).cloned())
    }

    async fn upsert(&self, record: DerivedRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(err) = Self::injected_write_failure(&mut state) {
            return Err(err);
        }
        state.records.insert(record.id.to_string(), record);
        state.upserts += 1;
        Ok(())
    }

    async fn delete_by_key(&self, key: &RecordId) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if let Some(err) = Self::injected_write_failure(&mut state) {
            return Err(err);
        }
        let removed = state.records.remove(&key.to_string()).is_some();
        if removed {
            state.deletes += 1;
        }
        Ok(removed)
    }

    async fn scan_all(&self) -> Result<RecordStream, StoreError> {
        let records: Vec<_> = self.lock().records.values().cloned().map(Ok).collect();
        Ok(stream::iter(records).boxed())
    }

    fn metadata(&self) -> StoreMetadata {
        StoreMetadata::new("MockStore", "mock")
    }
}
