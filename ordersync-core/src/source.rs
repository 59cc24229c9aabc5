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

//! Source Trait
//!
//! A [`Source`] is an authoritative collection the engine mirrors. It offers
//! two reads:
//!
//! - [`Source::scan`]: every current record, streamed page by page. Used by
//!   the reconciler.
//! - [`Source::watch`]: a live tail of mutations starting "now". The stream
//!   is not restartable; a transport error or the end of the stream ends
//!   the session and the engine opens a new one.
//!
//! [`Source::cluster_time`] reports the source's current position in its
//! change log. The reconciler stamps its writes with it so they order
//! against live changes the same way live changes order against each other.
//!
//! [`crate::stream::MongoSource`] implements the trait over a MongoDB
//! collection. [`MockSource`] is an in-memory implementation for tests.

use crate::event::{Namespace, OperationType, RawChange};
use crate::record::{RecordError, RecordId, SourceRecord};
use crate::stream::StreamError;
use async_trait::async_trait;
use bson::Document;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors produced while reading a source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The underlying change stream or cursor failed
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A source document could not be turned into a record
    #[error("Malformed source document: {0}")]
    Malformed(#[from] RecordError),

    /// The source is unreachable or refused the read
    #[error("Source unavailable: {message}")]
    Unavailable {
        /// Human-readable error message
        message: String,
    },
}

impl SourceError {
    /// Creates an [`SourceError::Unavailable`] error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Returns true if reopening the source may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stream(e) => e.is_retryable(),
            Self::Malformed(_) => false,
            Self::Unavailable { .. } => true,
        }
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Stream(e) => e.category(),
            Self::Malformed(_) => "malformed",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}

/// Stream of records produced by [`Source::scan`].
pub type RecordStream = BoxStream<'static, Result<SourceRecord, SourceError>>;

/// Stream of raw changes produced by [`Source::watch`].
pub type ChangeStream = BoxStream<'static, Result<RawChange, SourceError>>;

/// An authoritative collection of records.
///
/// Implementations must be `Send + Sync` so one instance can be shared by
/// the engine's supervisor task and the reconciler.
#[async_trait]
pub trait Source: Send + Sync {
    /// Short name used in logs (e.g. `"shop.products"`).
    fn name(&self) -> &str;

    /// Streams every record currently in the source.
    ///
    /// Records are read lazily; the full collection is never resident.
    /// A document that cannot be parsed is yielded as
    /// [`SourceError::Malformed`] and the scan continues.
    async fn scan(&self) -> Result<RecordStream, SourceError>;

    /// Opens a live change session starting at the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be opened.
    async fn watch(&self) -> Result<ChangeStream, SourceError>;

    /// The source's current cluster time.
    ///
    /// Every change committed before this call carries an earlier or equal
    /// cluster time. Sources without a change log clock return `None`, and
    /// reconcile writes then fall back to document timestamps alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be reached.
    async fn cluster_time(&self) -> Result<Option<DateTime<Utc>>, SourceError> {
        Ok(None)
    }
}

type WatchSender = mpsc::UnboundedSender<Result<RawChange, SourceError>>;

#[derive(Debug, Default)]
struct MockSourceState {
    records: BTreeMap<String, SourceRecord>,
    watcher: Option<WatchSender>,
    fail_watch_opens: usize,
    fail_scans: usize,
    malformed: Vec<RecordError>,
    clock: Option<DateTime<Utc>>,
}

impl MockSourceState {
    /// Wall clock, forced forward by at least a microsecond per change.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }
}

/// In-memory source for tests.
///
/// Holds a record map that [`Source::scan`] reads, and feeds every open
/// watch session through a channel. The mutation helpers
/// ([`insert`](Self::insert), [`update`](Self::update),
/// [`delete`](Self::delete)) change the record map and, if a session is
/// open, emit the matching change, like a real collection would.
/// Changes made while no session is open are not replayed.
///
/// Emitted changes are stamped from a logical clock that never repeats, and
/// [`Source::cluster_time`] reads the same clock.
///
/// Clones share state.
///
/// # Examples
///
/// ```rust
/// use ordersync_core::source::{MockSource, Source};
/// use bson::doc;
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = MockSource::new("shop.products");
/// let mut changes = source.watch().await?;
///
/// source.insert(doc! { "_id": "p1", "title": "Lamp" });
///
/// let change = changes.next().await.unwrap()?;
/// assert_eq!(change.document_key, Some(doc! { "_id": "p1" }));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MockSource {
    name: String,
    namespace: Namespace,
    timestamp_field: String,
    state: Arc<Mutex<MockSourceState>>,
    watch_opens: Arc<AtomicUsize>,
}

impl MockSource {
    /// Creates an empty mock source. `name` should look like `"db.collection"`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let namespace = match name.split_once('.') {
            Some((db, coll)) => Namespace::new(db, coll),
            None => Namespace::new("mock", name.clone()),
        };

        Self {
            name,
            namespace,
            timestamp_field: "updatedAt".to_string(),
            state: Arc::new(Mutex::new(MockSourceState::default())),
            watch_opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockSourceState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Seeds a record without emitting a change.
    pub fn seed(&self, document: Document) {
        if let Ok(record) = SourceRecord::from_document(document, &self.timestamp_field) {
            self.lock().records.insert(record.id.to_string(), record);
        }
    }

    /// Adds a document that [`Source::scan`] reports as malformed.
    pub fn seed_malformed(&self, error: RecordError) {
        self.lock().malformed.push(error);
    }

    /// Inserts a record and emits an `insert` change.
    pub fn insert(&self, document: Document) {
        self.write(OperationType::Insert, document);
    }

    /// Replaces a record and emits an `update` change.
    pub fn update(&self, document: Document) {
        self.write(OperationType::Update, document);
    }

    fn write(&self, operation: OperationType, document: Document) {
        let Ok(record) = SourceRecord::from_document(document.clone(), &self.timestamp_field)
        else {
            return;
        };

        let mut state = self.lock();
        let change = RawChange {
            operation,
            namespace: self.namespace.clone(),
            document_key: Some(bson::doc! { "_id": record.id.to_bson() }),
            full_document: Some(document),
            cluster_time: state.tick(),
        };
        state.records.insert(record.id.to_string(), record);
        Self::emit_locked(&mut state, Ok(change));
    }

    /// Removes a record and emits a `delete` change.
    pub fn delete(&self, key: &RecordId) {
        let mut state = self.lock();
        let change = RawChange {
            operation: OperationType::Delete,
            namespace: self.namespace.clone(),
            document_key: Some(bson::doc! { "_id": key.to_bson() }),
            full_document: None,
            cluster_time: state.tick(),
        };
        state.records.remove(&key.to_string());
        Self::emit_locked(&mut state, Ok(change));
    }

    /// Sends an arbitrary raw change to the open session.
    pub fn emit(&self, change: RawChange) {
        Self::emit_locked(&mut self.lock(), Ok(change));
    }

    /// Sends a transport error to the open session.
    pub fn fail_watch(&self, error: SourceError) {
        Self::emit_locked(&mut self.lock(), Err(error));
    }

    /// Ends the open session as if the server closed it.
    pub fn close_watch(&self) {
        self.lock().watcher = None;
    }

    /// Makes the next `n` calls to [`Source::watch`] fail.
    pub fn fail_next_watch_opens(&self, n: usize) {
        self.lock().fail_watch_opens = n;
    }

    /// Makes the next `n` calls to [`Source::scan`] fail.
    pub fn fail_next_scans(&self, n: usize) {
        self.lock().fail_scans = n;
    }

    /// Number of watch sessions opened so far.
    #[must_use]
    pub fn watch_opens(&self) -> usize {
        self.watch_opens.load(Ordering::SeqCst)
    }

    /// Returns true while a session is open and its consumer is alive.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.lock()
            .watcher
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Number of records currently in the source.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Returns true if the source holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit_locked(state: &mut MockSourceState, item: Result<RawChange, SourceError>) {
        let delivered = state
            .watcher
            .as_ref()
            .is_some_and(|tx| tx.send(item).is_ok());
        if !delivered {
            state.watcher = None;
        }
    }
}

#[async_trait]
impl Source for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self) -> Result<RecordStream, SourceError> {
        let mut state = self.lock();
        if state.fail_scans > 0 {
            state.fail_scans -= 1;
            return Err(SourceError::unavailable("Simulated scan failure"));
        }

        let mut items: Vec<Result<SourceRecord, SourceError>> =
            state.records.values().cloned().map(Ok).collect();
        items.extend(
            state
                .malformed
                .iter()
                .cloned()
                .map(|e| Err(SourceError::Malformed(e))),
        );

        Ok(stream::iter(items).boxed())
    }

    async fn watch(&self) -> Result<ChangeStream, SourceError> {
        let mut state = self.lock();
        if state.fail_watch_opens > 0 {
            state.fail_watch_opens -= 1;
            return Err(SourceError::unavailable("Simulated watch failure"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.watcher = Some(tx);
        self.watch_opens.fetch_add(1, Ordering::SeqCst);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn cluster_time(&self) -> Result<Option<DateTime<Utc>>, SourceError> {
        Ok(Some(self.lock().tick()))
    }
}
