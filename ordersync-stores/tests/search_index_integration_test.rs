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

//! Integration tests for the search index store.
//!
//! These tests require an Elasticsearch 8 node on `ELASTICSEARCH_URL`
//! (default `http://localhost:9200`) with security disabled.
//!
//! To run these tests:
//! ```bash
//! cargo test --package ordersync-stores --test search_index_integration_test -- --ignored
//! ```

#![cfg(feature = "search-index")]

use bson::{doc, oid::ObjectId};
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use ordersync_core::record::{DerivedRecord, RecordId};
use ordersync_core::store::DerivedStore;
use ordersync_stores::search_index::{SearchIndexConfig, SearchIndexStore};

fn create_test_store(index: &str) -> SearchIndexStore {
    let url = std::env::var("ELASTICSEARCH_URL").unwrap_or_else(|_| "http://localhost:9200".to_string());
    let config = SearchIndexConfig::builder()
        .url(url)
        .index(index)
        .page_size(3)
        .build()
        .expect("valid configuration");
    SearchIndexStore::new(config).expect("HTTP client")
}

#[tokio::test]
#[ignore] // Requires Elasticsearch
async fn test_search_index_write_read_delete() {
    let store = create_test_store("ordersync_test_orders");
    let key = RecordId::from(ObjectId::new());
    let ts = Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap();

    store
        .upsert(DerivedRecord::new(
            key.clone(),
            doc! { "userId": "u1", "totalAmount": 99.5, "products": [{ "id": "p1", "qty": 1 }] },
            Some(ts),
        ))
        .await
        .unwrap();

    let found = store.find_by_key(&key).await.unwrap().unwrap();
    assert_eq!(found.fields.get_str("userId").unwrap(), "u1");
    assert_eq!(found.source_updated_at, Some(ts));

    assert!(store.delete_by_key(&key).await.unwrap());
    assert!(!store.delete_by_key(&key).await.unwrap());
    assert!(store.find_by_key(&key).await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Elasticsearch
async fn test_search_index_scan_pages() {
    let store = create_test_store("ordersync_test_scan");
    for i in 0..7_i64 {
        store
            .upsert(DerivedRecord::new(RecordId::from(i), doc! { "n": i }, None))
            .await
            .unwrap();
    }

    // Writes become searchable after a refresh.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let records: Vec<_> = store.scan_all().await.unwrap().collect().await;
    assert!(records.len() >= 7);
    assert!(records.iter().all(Result::is_ok));
}
