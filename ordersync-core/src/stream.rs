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

//! `MongoDB` Source
//!
//! [`MongoSource`] implements [`Source`] over a `MongoDB` collection:
//!
//! - `scan()` runs a `find` with a configurable batch size and streams the
//!   cursor, so the collection is paged rather than loaded.
//! - `watch()` opens a change stream with `fullDocument: updateLookup`, so
//!   inserts and updates carry the post-image the mappers need.
//! - `cluster_time()` runs a `ping` and reads the reply's `operationTime`,
//!   the same oplog clock change events are stamped with.
//!
//! The change stream is consumed as-is. There is no resume token handling
//! and no internal reconnection: when the stream fails the engine opens a
//! new session and reconciles, which repairs anything missed in between.
//! Driver errors are still classified ([`StreamError::is_retryable`],
//! [`StreamError::category`]) for logs and metrics.
//!
//! # Examples
//!
//! ```rust,no_run
//! use ordersync_core::stream::{MongoSource, WatchConfig};
//! use ordersync_core::source::Source;
//! use mongodb::{Client, options::ClientOptions};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::with_options(ClientOptions::parse("mongodb://localhost:27017").await?)?;
//! let collection = client.database("shop").collection("products");
//!
//! let source = MongoSource::new(collection, WatchConfig::builder().batch_size(100).build()?);
//!
//! let mut changes = source.watch().await?;
//! while let Some(change) = changes.next().await {
//!     println!("{:?}", change?.operation);
//! }
//! # Ok(())
//! # }
//! ```

use crate::event::{cluster_time_from_timestamp, RawChange};
use crate::record::SourceRecord;
use crate::source::{ChangeStream, RecordStream, Source, SourceError};
use async_trait::async_trait;
use bson::Document;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mongodb::{
    error::{Error as MongoError, ErrorKind as MongoErrorKind},
    options::{ChangeStreamOptions, FullDocumentType},
    Collection,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors reported by the `MongoDB` driver, classified.
#[derive(Debug, Error)]
pub enum StreamError {
    /// `MongoDB` connection or command error
    #[error("Connection error: {message}")]
    Connection {
        /// Driver message
        message: String,
        /// Underlying driver error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// `MongoDB` error code
        code: Option<i32>,
        /// `MongoDB` error labels (e.g., "RetryableWriteError")
        labels: Vec<String>,
    },

    /// Change streams are not available (standalone server, code 40573)
    #[error("Change streams unsupported (code {code}): a replica set is required")]
    Unsupported {
        /// `MongoDB` error code
        code: i32,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<MongoError> for StreamError {
    fn from(err: MongoError) -> Self {
        Self::from_mongo_error(err)
    }
}

impl StreamError {
    /// Creates a `StreamError` from a `MongoDB` error, keeping its code and labels.
    pub fn from_mongo_error(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };

        if code == Some(40573) {
            return Self::Unsupported { code: 40573 };
        }

        let labels: Vec<String> = err.labels().iter().cloned().collect();
        let network = matches!(
            err.kind.as_ref(),
            MongoErrorKind::Io(_) | MongoErrorKind::ConnectionPoolCleared { .. }
        );

        Self::Connection {
            message: err.to_string(),
            source: Some(Box::new(err)),
            code,
            labels: if network && labels.is_empty() {
                vec!["NetworkError".to_string()]
            } else {
                labels
            },
        }
    }

    /// Returns true if the operation may succeed when retried.
    ///
    /// Checks error labels first (RetryableWriteError,
    /// TransientTransactionError, NetworkError), then the transient error
    /// codes seen during failover and network trouble.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { code, labels, .. } => {
                if labels.iter().any(|l| {
                    l == "RetryableWriteError"
                        || l == "TransientTransactionError"
                        || l == "NetworkError"
                }) {
                    return true;
                }

                code.is_some_and(|c| {
                    matches!(
                        c,
                        6 |    // HostUnreachable
                        7 |    // HostNotFound
                        43 |   // CursorNotFound
                        89 |   // NetworkTimeout
                        91 |   // ShutdownInProgress
                        10107 | // NotWritablePrimary
                        11600 | // InterruptedAtShutdown
                        11602 | // InterruptedDueToReplStateChange
                        13435 | // NotPrimaryNoSecondaryOk
                        13436 // NotPrimaryOrSecondary
                    )
                })
            }
            Self::Unsupported { .. } | Self::Configuration(_) => false,
        }
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Unsupported { .. } => "unsupported",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Configuration for [`MongoSource`].
///
/// Use [`WatchConfig::builder`]:
///
/// ```rust
/// use ordersync_core::stream::WatchConfig;
///
/// let config = WatchConfig::builder()
///     .scan_batch_size(500)
///     .timestamp_field("modifiedAt")
///     .build()
///     .unwrap();
///
/// assert!(config.full_document_on_update);
/// ```
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Aggregation pipeline appended to the change stream
    pub pipeline: Vec<Document>,

    /// Request the post-image for update events (`updateLookup`)
    pub full_document_on_update: bool,

    /// Change stream batch size
    pub batch_size: Option<u32>,

    /// Cursor batch size for the bootstrap scan
    pub scan_batch_size: u32,

    /// Field holding the record's last-modified time
    pub timestamp_field: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            pipeline: Vec::new(),
            full_document_on_update: true,
            batch_size: None,
            scan_batch_size: 1000,
            timestamp_field: "updatedAt".to_string(),
        }
    }
}

impl WatchConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> WatchConfigBuilder {
        WatchConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Configuration` for a zero batch size or an
    /// empty timestamp field.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.scan_batch_size == 0 {
            return Err(StreamError::Configuration(
                "scan_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == Some(0) {
            return Err(StreamError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.timestamp_field.is_empty() {
            return Err(StreamError::Configuration(
                "timestamp_field must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    fn to_mongo_options(&self) -> ChangeStreamOptions {
        let mut options = ChangeStreamOptions::default();

        if self.full_document_on_update {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }

        options.batch_size = self.batch_size;
        options
    }
}

/// Builder for [`WatchConfig`].
#[derive(Debug, Default)]
pub struct WatchConfigBuilder {
    pipeline: Vec<Document>,
    full_document_on_update: Option<bool>,
    batch_size: Option<u32>,
    scan_batch_size: Option<u32>,
    timestamp_field: Option<String>,
}

impl WatchConfigBuilder {
    /// Sets the aggregation pipeline for filtering events.
    #[must_use]
    pub fn pipeline(mut self, pipeline: Vec<Document>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Enables or disables the update post-image lookup.
    ///
    /// Default: enabled. Without it, update events carry no document and
    /// the applier rejects them.
    #[must_use]
    pub fn full_document_on_update(mut self, enabled: bool) -> Self {
        self.full_document_on_update = Some(enabled);
        self
    }

    /// Sets the change stream batch size.
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets the bootstrap scan batch size. Default: 1000
    #[must_use]
    pub fn scan_batch_size(mut self, size: u32) -> Self {
        self.scan_batch_size = Some(size);
        self
    }

    /// Sets the last-modified field. Default: `updatedAt`
    #[must_use]
    pub fn timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Configuration` if validation fails.
    pub fn build(self) -> Result<WatchConfig, StreamError> {
        let defaults = WatchConfig::default();
        let config = WatchConfig {
            pipeline: self.pipeline,
            full_document_on_update: self
                .full_document_on_update
                .unwrap_or(defaults.full_document_on_update),
            batch_size: self.batch_size,
            scan_batch_size: self.scan_batch_size.unwrap_or(defaults.scan_batch_size),
            timestamp_field: self.timestamp_field.unwrap_or(defaults.timestamp_field),
        };

        config.validate()?;
        Ok(config)
    }
}

/// A [`Source`] backed by a `MongoDB` collection.
#[derive(Debug, Clone)]
pub struct MongoSource {
    collection: Collection<Document>,
    config: WatchConfig,
    name: String,
}

impl MongoSource {
    /// Creates a source over `collection`.
    #[must_use]
    pub fn new(collection: Collection<Document>, config: WatchConfig) -> Self {
        let ns = collection.namespace();
        let name = format!("{}.{}", ns.db, ns.coll);

        Self {
            collection,
            config,
            name,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }
}

#[async_trait]
impl Source for MongoSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self) -> Result<RecordStream, SourceError> {
        debug!(source = %self.name, batch_size = self.config.scan_batch_size, "Opening scan cursor");

        let cursor = self
            .collection
            .find(bson::doc! {})
            .batch_size(self.config.scan_batch_size)
            .await
            .map_err(StreamError::from_mongo_error)?;

        let timestamp_field = self.config.timestamp_field.clone();
        Ok(cursor
            .map(move |item| match item {
                Ok(document) => SourceRecord::from_document(document, &timestamp_field)
                    .map_err(SourceError::from),
                Err(e) => Err(StreamError::from_mongo_error(e).into()),
            })
            .boxed())
    }

    async fn watch(&self) -> Result<ChangeStream, SourceError> {
        info!(source = %self.name, "Opening change stream");

        let options = self.config.to_mongo_options();
        let stream = if self.config.pipeline.is_empty() {
            self.collection.watch().with_options(options).await
        } else {
            self.collection
                .watch()
                .pipeline(self.config.pipeline.clone())
                .with_options(options)
                .await
        }
        .map_err(StreamError::from_mongo_error)?;

        Ok(stream
            .map(|item| match item {
                Ok(event) => Ok(RawChange::from(event)),
                Err(e) => Err(StreamError::from_mongo_error(e).into()),
            })
            .boxed())
    }

    async fn cluster_time(&self) -> Result<Option<DateTime<Utc>>, SourceError> {
        let reply = self
            .collection
            .client()
            .database(&self.collection.namespace().db)
            .run_command(bson::doc! { "ping": 1 })
            .await
            .map_err(StreamError::from_mongo_error)?;

        let time = operation_time(&reply);
        if time.is_none() {
            warn!(source = %self.name, "Server reply has no operationTime; is this a replica set?");
        }
        Ok(time)
    }
}

fn operation_time(reply: &Document) -> Option<DateTime<Utc>> {
    reply
        .get_timestamp("operationTime")
        .ok()
        .and_then(cluster_time_from_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection_error(code: Option<i32>, labels: &[&str]) -> StreamError {
        StreamError::Connection {
            message: "test".to_string(),
            source: None,
            code,
            labels: labels.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_operation_time_from_command_reply() {
        let reply = bson::doc! {
            "ok": 1.0,
            "operationTime": bson::Timestamp { time: 1_700_000_000, increment: 7 },
        };
        let time = operation_time(&reply).unwrap();
        assert_eq!(time.timestamp(), 1_700_000_000);
        assert_eq!(time.timestamp_subsec_micros(), 7);

        assert_eq!(operation_time(&bson::doc! { "ok": 1.0 }), None);
    }

    #[test]
    fn test_default_config() {
        let config = WatchConfig::default();
        assert!(config.pipeline.is_empty());
        assert!(config.full_document_on_update);
        assert_eq!(config.scan_batch_size, 1000);
        assert_eq!(config.timestamp_field, "updatedAt");
    }

    #[test]
    fn test_config_builder() {
        let config = WatchConfig::builder()
            .pipeline(vec![bson::doc! { "$match": { "operationType": "insert" } }])
            .full_document_on_update(false)
            .batch_size(50)
            .scan_batch_size(200)
            .build()
            .unwrap();

        assert_eq!(config.pipeline.len(), 1);
        assert!(!config.full_document_on_update);
        assert_eq!(config.batch_size, Some(50));
        assert_eq!(config.scan_batch_size, 200);
    }

    #[test]
    fn test_config_validation() {
        assert!(WatchConfig::builder().scan_batch_size(0).build().is_err());
        assert!(WatchConfig::builder().batch_size(0).build().is_err());
        assert!(WatchConfig::builder().timestamp_field("").build().is_err());
    }

    #[test]
    fn test_mongo_options() {
        let options = WatchConfig::default().to_mongo_options();
        assert!(matches!(options.full_document, Some(FullDocumentType::UpdateLookup)));

        let options = WatchConfig::builder()
            .full_document_on_update(false)
            .build()
            .unwrap()
            .to_mongo_options();
        assert!(options.full_document.is_none());
    }

    #[test]
    fn test_error_retryable_by_label() {
        assert!(connection_error(None, &["NetworkError"]).is_retryable());
        assert!(connection_error(None, &["RetryableWriteError"]).is_retryable());
        assert!(!connection_error(None, &[]).is_retryable());
    }

    #[test]
    fn test_error_retryable_by_code() {
        assert!(connection_error(Some(89), &[]).is_retryable());
        assert!(connection_error(Some(11602), &[]).is_retryable());
        assert!(!connection_error(Some(13), &[]).is_retryable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(connection_error(None, &[]).category(), "connection");
        assert_eq!(StreamError::Unsupported { code: 40573 }.category(), "unsupported");
        assert!(!StreamError::Configuration("x".into()).is_retryable());
    }
}
