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

//! Order service sync process.
//!
//! Runs two engines side by side until Ctrl+C:
//!
//! - `product-cache`: product collection → product cache collection
//! - `order-index`: order collection → order search index
//!
//! Configuration comes from the environment (and `.env`), see [`config`].

mod config;

use config::{MongoTarget, ServiceConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use mongodb::bson::Document;
use mongodb::{Client, Collection};
use ordersync_core::engine::{EngineError, SyncEngine, SyncEngineConfig};
use ordersync_core::mapper::{OrderIndexMapper, ProductCacheMapper};
use ordersync_core::metrics;
use ordersync_core::store::StoreError;
use ordersync_core::stream::{MongoSource, WatchConfig};
use ordersync_stores::mongo_cache::MongoCacheStore;
use ordersync_stores::search_index::{SearchIndexConfig, SearchIndexStore};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PRODUCT_ENGINE: &str = "product-cache";
const ORDER_ENGINE: &str = "order-index";

#[derive(Debug, Error)]
enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("engine configuration error: {0}")]
    EngineConfig(#[from] ordersync_core::engine::ConfigError),

    #[error("watch configuration error: {0}")]
    Watch(#[from] ordersync_core::stream::StreamError),

    #[error("failed to create MongoDB client: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("failed to install Prometheus exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_logging();

    if let Err(e) = run().await {
        error!("ordersync exited with error: {e}");
        return Err(e.into());
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ordersync_core=info,ordersync_stores=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .with_line_number(true)
        .init();
}

async fn run() -> Result<(), ServerError> {
    let config = ServiceConfig::from_env()?;

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "Prometheus exporter listening");
    }
    metrics::init_metrics();

    let mut clients = Clients::default();
    let products = clients.collection(&config.products).await?;
    let orders = clients.collection(&config.orders).await?;
    let product_cache = clients.collection(&config.product_cache).await?;

    let product_engine = SyncEngine::new(
        engine_config(&config, PRODUCT_ENGINE)?,
        Arc::new(MongoSource::new(products, WatchConfig::builder().build()?)),
        Arc::new(MongoCacheStore::new(product_cache)),
        Arc::new(ProductCacheMapper),
    );

    let search = SearchIndexConfig::builder()
        .url(config.elasticsearch_url.as_str())
        .index(config.order_index.as_str())
        .build()?;
    let order_engine = SyncEngine::new(
        engine_config(&config, ORDER_ENGINE)?,
        Arc::new(MongoSource::new(orders, WatchConfig::builder().build()?)),
        Arc::new(SearchIndexStore::new(search)?),
        Arc::new(OrderIndexMapper),
    );

    let mut engines = vec![product_engine, order_engine];
    for engine in &mut engines {
        engine.start().await?;
    }
    info!(engines = engines.len(), "ordersync running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    for engine in &mut engines {
        if let Err(e) = engine.stop().await {
            error!(engine = %engine.name(), "Failed to stop engine: {e}");
        }
    }

    info!("ordersync stopped");
    Ok(())
}

fn engine_config(config: &ServiceConfig, name: &str) -> Result<SyncEngineConfig, ServerError> {
    let mut builder = SyncEngineConfig::builder()
        .name(name)
        .retry_interval(config.retry_interval)
        .max_retry_attempts(config.max_retry_attempts)
        .retry_capacity(config.retry_capacity);
    if let Some(interval) = config.reconcile_interval {
        builder = builder.reconcile_interval(interval);
    }
    Ok(builder.build()?)
}

/// One MongoDB client per distinct connection string.
#[derive(Default)]
struct Clients {
    by_uri: HashMap<String, Client>,
}

impl Clients {
    async fn collection(&mut self, target: &MongoTarget) -> Result<Collection<Document>, ServerError> {
        let client = match self.by_uri.get(&target.uri) {
            Some(client) => client.clone(),
            None => {
                let client = Client::with_uri_str(&target.uri).await?;
                self.by_uri.insert(target.uri.clone(), client.clone());
                client
            }
        };

        let database = match &target.database {
            Some(name) => client.database(name),
            None => client
                .default_database()
                .unwrap_or_else(|| client.database(target.fallback_database)),
        };

        info!(
            database = %database.name(),
            collection = %target.collection,
            "Using MongoDB collection"
        );
        Ok(database.collection(&target.collection))
    }
}
