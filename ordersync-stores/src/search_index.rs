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

//! Elasticsearch-backed derived store.
//!
//! Talks to the document REST API directly:
//!
//! - `GET /{index}/_doc/{id}` to look up a record
//! - `PUT /{index}/_doc/{id}` to write one (full replace)
//! - `DELETE /{index}/_doc/{id}` to remove one; 404 means already absent
//! - point-in-time search with `search_after` paging to scan the index
//!
//! The document `_source` is the mapped fields plus `sourceUpdatedAt` and
//! `syncedAt` as RFC 3339 strings. BSON values are converted to plain JSON:
//! object ids become hex strings and datetimes become RFC 3339 strings.
//!
//! # Error classification
//!
//! | Response | Error | Retryable |
//! |----------|-------|-----------|
//! | connect/timeout | `Connection` | yes |
//! | 429 | `Capacity` | yes |
//! | 5xx | `Write` | yes |
//! | other 4xx | `Write` | no |
//!
//! # Example
//!
//! ```rust,no_run
//! use ordersync_stores::search_index::{SearchIndexConfig, SearchIndexStore};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SearchIndexConfig::builder()
//!     .url("http://localhost:9200")
//!     .index("orders")
//!     .build()?;
//!
//! let store = SearchIndexStore::new(config)?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use chrono::{DateTime, SecondsFormat};
use futures::stream::{self, StreamExt};
use ordersync_core::record::{timestamp_from_bson, DerivedRecord, RecordId};
use ordersync_core::store::{DerivedStore, RecordStream, StoreError, StoreMetadata};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// `_source` field holding the source timestamp a document was built from.
pub const SOURCE_UPDATED_AT_FIELD: &str = "sourceUpdatedAt";

/// `_source` field holding the source cluster time, in microseconds since the epoch.
pub const SOURCE_CLUSTER_TIME_FIELD: &str = "sourceClusterTime";

/// `_source` field holding the time the engine last wrote a document.
pub const SYNCED_AT_FIELD: &str = "syncedAt";

const PIT_KEEP_ALIVE: &str = "1m";

/// Configuration for [`SearchIndexStore`].
#[derive(Debug, Clone)]
pub struct SearchIndexConfig {
    /// Cluster base URL (e.g. `http://localhost:9200`)
    pub url: Url,

    /// Index name
    pub index: String,

    /// Per-request timeout (default: 10 seconds)
    pub request_timeout: Duration,

    /// Documents per page when scanning (default: 500)
    pub page_size: usize,
}

impl SearchIndexConfig {
    /// Creates a new builder for `SearchIndexConfig`.
    #[must_use]
    pub fn builder() -> SearchIndexConfigBuilder {
        SearchIndexConfigBuilder::default()
    }
}

/// Builder for [`SearchIndexConfig`].
#[derive(Debug, Default)]
pub struct SearchIndexConfigBuilder {
    url: Option<String>,
    index: Option<String>,
    request_timeout: Option<Duration>,
    page_size: Option<usize>,
}

impl SearchIndexConfigBuilder {
    /// Sets the cluster base URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the index name.
    #[must_use]
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Sets the per-request timeout.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the scan page size.
    ///
    /// Default: 500
    #[must_use]
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Builds the `SearchIndexConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if:
    /// - URL or index is missing
    /// - URL cannot be parsed or cannot have path segments
    /// - index is empty or page size is 0
    pub fn build(self) -> Result<SearchIndexConfig, StoreError> {
        let raw_url = self.url.ok_or_else(|| {
            StoreError::configuration("Search cluster URL is required", Some("url".to_string()))
        })?;
        let url = Url::parse(&raw_url).map_err(|e| {
            StoreError::configuration(format!("Invalid search cluster URL: {e}"), Some("url".to_string()))
        })?;
        if url.cannot_be_a_base() {
            return Err(StoreError::configuration(
                format!("Search cluster URL cannot be a base: {raw_url}"),
                Some("url".to_string()),
            ));
        }

        let index = self.index.unwrap_or_default();
        if index.is_empty() {
            return Err(StoreError::configuration(
                "Index name is required",
                Some("index".to_string()),
            ));
        }

        let page_size = self.page_size.unwrap_or(500);
        if page_size == 0 {
            return Err(StoreError::configuration(
                "Page size must be greater than 0",
                Some("page_size".to_string()),
            ));
        }

        Ok(SearchIndexConfig {
            url,
            index,
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(10)),
            page_size,
        })
    }
}

/// Derived store over an Elasticsearch index.
#[derive(Debug, Clone)]
pub struct SearchIndexStore {
    client: Client,
    config: SearchIndexConfig,
}

#[derive(Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct DeleteResponse {
    result: String,
}

#[derive(Deserialize)]
struct PitResponse {
    id: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    pit_id: Option<String>,
    hits: SearchHits,
}

#[derive(Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Map<String, Value>,
    #[serde(default)]
    sort: Vec<Value>,
}

/// Paging state of a scan.
struct Scan {
    store: SearchIndexStore,
    pit_id: String,
    search_after: Option<Vec<Value>>,
    done: bool,
}

impl SearchIndexStore {
    /// Creates a store with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the HTTP client cannot be built.
    pub fn new(config: SearchIndexConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StoreError::configuration(format!("Failed to build HTTP client: {e}"), None))?;
        Ok(Self::with_client(client, config))
    }

    /// Creates a store sharing an existing HTTP client.
    #[must_use]
    pub fn with_client(client: Client, config: SearchIndexConfig) -> Self {
        debug!(url = %config.url, index = %config.index, "Initializing search index store");
        Self { client, config }
    }

    /// The store configuration.
    #[must_use]
    pub fn config(&self) -> &SearchIndexConfig {
        &self.config
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.config.url.clone();
        url.path_segments_mut()
            .map_err(|()| StoreError::configuration("Search cluster URL cannot be a base", None))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn document_url(&self, key: &RecordId) -> Result<Url, StoreError> {
        self.endpoint(&[&self.config.index, "_doc", &key.to_string()])
    }

    async fn open_pit(&self) -> Result<String, StoreError> {
        let mut url = self.endpoint(&[&self.config.index, "_pit"])?;
        url.query_pairs_mut().append_pair("keep_alive", PIT_KEEP_ALIVE);

        let response = self.client.post(url).send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        let pit: PitResponse = response.json().await.map_err(decode_error)?;
        Ok(pit.id)
    }

    async fn close_pit(&self, pit_id: &str) {
        let result = match self.endpoint(&["_pit"]) {
            Ok(url) => self
                .client
                .delete(url)
                .json(&json!({ "id": pit_id }))
                .send()
                .await
                .map_err(transport_error),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(index = %self.config.index, error = %e, "Failed to close point in time");
        }
    }

    async fn search_page(
        &self,
        pit_id: &str,
        search_after: Option<&[Value]>,
    ) -> Result<SearchResponse, StoreError> {
        let mut body = json!({
            "size": self.config.page_size,
            "pit": { "id": pit_id, "keep_alive": PIT_KEEP_ALIVE },
            "sort": [{ "_shard_doc": "asc" }],
            "track_total_hits": false,
        });
        if let Some(after) = search_after {
            body["search_after"] = Value::Array(after.to_vec());
        }

        let url = self.endpoint(&["_search"])?;
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response.json().await.map_err(decode_error)
    }

    async fn next_page(scan: &mut Scan) -> Option<Vec<Result<DerivedRecord, StoreError>>> {
        if scan.done {
            return None;
        }

        let page = match scan
            .store
            .search_page(&scan.pit_id, scan.search_after.as_deref())
            .await
        {
            Ok(page) => page,
            Err(e) => {
                scan.done = true;
                scan.store.close_pit(&scan.pit_id).await;
                return Some(vec![Err(e)]);
            }
        };

        if let Some(pit_id) = page.pit_id {
            scan.pit_id = pit_id;
        }

        if page.hits.hits.len() < scan.store.config.page_size {
            scan.done = true;
            scan.store.close_pit(&scan.pit_id).await;
        }
        if let Some(last) = page.hits.hits.last() {
            scan.search_after = Some(last.sort.clone());
        }
        if page.hits.hits.is_empty() {
            return None;
        }

        Some(
            page.hits
                .hits
                .into_iter()
                .map(|hit| from_source(RecordId::parse(&hit.id), hit.source))
                .collect(),
        )
    }
}

#[async_trait]
impl DerivedStore for SearchIndexStore {
    async fn find_by_key(&self, key: &RecordId) -> Result<Option<DerivedRecord>, StoreError> {
        let url = self.document_url(key)?;
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = check_status(response).await?;
        let found: GetResponse = response.json().await.map_err(decode_error)?;
        match found.source {
            Some(source) if found.found => from_source(key.clone(), source).map(Some),
            _ => Ok(None),
        }
    }

    #[instrument(skip(self, record), fields(index = %self.config.index, key = %record.id))]
    async fn upsert(&self, record: DerivedRecord) -> Result<(), StoreError> {
        let url = self.document_url(&record.id)?;
        let body = to_source(&record);

        let response = self
            .client
            .put(url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;

        debug!("Search document written");
        Ok(())
    }

    #[instrument(skip(self), fields(index = %self.config.index))]
    async fn delete_by_key(&self, key: &RecordId) -> Result<bool, StoreError> {
        let url = self.document_url(key)?;
        let response = self.client.delete(url).send().await.map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        let response = check_status(response).await?;
        let deleted: DeleteResponse = response.json().await.map_err(decode_error)?;
        Ok(deleted.result == "deleted")
    }

    async fn scan_all(&self) -> Result<RecordStream, StoreError> {
        let pit_id = self.open_pit().await?;
        let scan = Scan {
            store: self.clone(),
            pit_id,
            search_after: None,
            done: false,
        };

        Ok(stream::unfold(scan, |mut scan| async move {
            Self::next_page(&mut scan).await.map(|page| (page, scan))
        })
        .flat_map(stream::iter)
        .boxed())
    }

    fn metadata(&self) -> StoreMetadata {
        StoreMetadata::new(self.config.index.clone(), "elasticsearch")
            .with_property("index", self.config.index.clone())
    }
}

/// Converts a BSON value to plain JSON.
///
/// Object ids become hex strings, datetimes and oplog timestamps become
/// RFC 3339 strings, decimals become strings. Non-finite doubles become
/// `null`.
#[must_use]
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Double(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(_) | Bson::Timestamp(_) => timestamp_from_bson(value).map_or(Value::Null, |ts| {
            Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        }),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(document) => Value::Object(document_to_json(document)),
        other => other.clone().into_relaxed_extjson(),
    }
}

fn document_to_json(document: &Document) -> Map<String, Value> {
    document
        .iter()
        .map(|(key, value)| (key.clone(), bson_to_json(value)))
        .collect()
}

/// Builds the `_source` body for `record`. A mapped `_id` field is dropped.
#[must_use]
pub fn to_source(record: &DerivedRecord) -> Value {
    let mut source = document_to_json(&record.fields);
    source.remove("_id");
    source.insert(
        SOURCE_UPDATED_AT_FIELD.to_string(),
        record.source_updated_at.map_or(Value::Null, |ts| {
            Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        }),
    );
    source.insert(
        SOURCE_CLUSTER_TIME_FIELD.to_string(),
        record
            .source_cluster_time
            .map_or(Value::Null, |ts| Value::from(ts.timestamp_micros())),
    );
    source.insert(
        SYNCED_AT_FIELD.to_string(),
        Value::String(record.synced_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Value::Object(source)
}

/// Reads a `_source` body back into a [`DerivedRecord`].
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if the body cannot be represented as BSON.
pub fn from_source(id: RecordId, mut source: Map<String, Value>) -> Result<DerivedRecord, StoreError> {
    let source_updated_at = source
        .remove(SOURCE_UPDATED_AT_FIELD)
        .and_then(|v| v.as_str().map(|s| Bson::String(s.to_string())))
        .as_ref()
        .and_then(timestamp_from_bson);
    let source_cluster_time = source
        .remove(SOURCE_CLUSTER_TIME_FIELD)
        .and_then(|v| v.as_i64())
        .and_then(DateTime::from_timestamp_micros);
    let synced_at = source
        .remove(SYNCED_AT_FIELD)
        .and_then(|v| v.as_str().map(|s| Bson::String(s.to_string())))
        .as_ref()
        .and_then(timestamp_from_bson);

    let fields = bson::to_document(&source)
        .map_err(|e| StoreError::serialization(e, "search document is not representable as BSON"))?;

    let mut record =
        DerivedRecord::new(id, fields, source_updated_at).with_cluster_time(source_cluster_time);
    if let Some(synced_at) = synced_at {
        record.synced_at = synced_at;
    }
    Ok(record)
}

fn transport_error(error: reqwest::Error) -> StoreError {
    if error.is_decode() {
        decode_error(error)
    } else {
        StoreError::connection(error)
    }
}

fn decode_error(error: reqwest::Error) -> StoreError {
    StoreError::serialization(error, "unexpected search cluster response")
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a non-success response onto the store error taxonomy.
#[must_use]
pub fn status_error(status: StatusCode, message: &str, retry_after: Option<Duration>) -> StoreError {
    let message = format!("search cluster returned {status}: {message}");
    if status == StatusCode::TOO_MANY_REQUESTS {
        StoreError::capacity(message, retry_after)
    } else {
        StoreError::write_msg(message, status.is_server_error())
    }
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = retry_after(&response);
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(status_error(status, &message, retry_after))
}
