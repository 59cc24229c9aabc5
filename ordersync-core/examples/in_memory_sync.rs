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

//! Product cache sync against in-memory source and store.
//!
//! Seeds two products, lets the engine reconcile them, then drives live
//! changes through the watch session and prints the resulting cache.
//!
//! ```bash
//! cargo run -p ordersync-core --example in_memory_sync
//! ```

use bson::{doc, DateTime};
use ordersync_core::engine::{EngineState, SyncEngine, SyncEngineConfig};
use ordersync_core::mapper::ProductCacheMapper;
use ordersync_core::record::RecordId;
use ordersync_core::source::MockSource;
use ordersync_core::store::MockStore;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

fn product(id: &str, title: &str, price: f64) -> bson::Document {
    doc! {
        "_id": id,
        "title": title,
        "price": price,
        "quantity": 10,
        "seller": { "id": "seller-1" },
        "updatedAt": DateTime::now(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ordersync_core=debug")),
        )
        .with_target(false)
        .init();

    let source = MockSource::new("shop.products");
    source.seed(product("p1", "Desk lamp", 24.0));
    source.seed(product("p2", "Notebook", 3.5));
    let store = MockStore::new();

    let config = SyncEngineConfig::builder()
        .name("product-cache")
        .retry_interval(Duration::from_secs(1))
        .build()?;
    let mut engine = SyncEngine::new(
        config,
        Arc::new(source.clone()),
        Arc::new(store.clone()),
        Arc::new(ProductCacheMapper),
    );

    let mut state = engine.subscribe_state();
    engine.start().await?;
    state.wait_for(|s| *s == EngineState::Watching).await?;
    info!(cached = store.len(), "Reconciliation finished");

    source.insert(product("p3", "Pen", 1.2));
    source.update(product("p1", "Desk lamp", 19.0));
    source.delete(&RecordId::from("p2"));
    tokio::time::sleep(Duration::from_millis(200)).await;

    for record in store.records() {
        info!(key = %record.id, fields = %record.fields, "Cached product");
    }

    let stats = engine.stats().await;
    info!(
        applied = stats.events_applied,
        reconcile_runs = stats.reconcile_runs,
        "Engine stats"
    );

    engine.stop().await?;
    Ok(())
}
