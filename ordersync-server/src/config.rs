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

//! Service configuration, read from the environment.
//!
//! A `.env` file in the working directory is loaded first by the binary.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Invalid or missing environment configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("{0} is not set")]
    Missing(&'static str),

    /// A variable is set but cannot be parsed
    #[error("{variable} has an invalid value {value:?}: {message}")]
    Invalid {
        /// Variable name
        variable: &'static str,
        /// Offending value
        value: String,
        /// Parse failure
        message: String,
    },
}

/// Where one MongoDB collection lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoTarget {
    /// Connection string
    pub uri: String,
    /// Explicit database; otherwise the URI's default database, then `fallback_database`
    pub database: Option<String>,
    /// Database used when neither the variable nor the URI names one
    pub fallback_database: &'static str,
    /// Collection name
    pub collection: String,
}

/// Everything the service needs to boot both engines.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Product source collection
    pub products: MongoTarget,
    /// Order source collection
    pub orders: MongoTarget,
    /// Product cache collection
    pub product_cache: MongoTarget,
    /// Search cluster base URL
    pub elasticsearch_url: String,
    /// Order index name
    pub order_index: String,
    /// Retry drain interval
    pub retry_interval: Duration,
    /// Attempts before an event is dead-lettered
    pub max_retry_attempts: u32,
    /// Retry queue bound
    pub retry_capacity: usize,
    /// Periodic re-reconciliation, if enabled
    pub reconcile_interval: Option<Duration>,
    /// Prometheus listener, if enabled
    pub metrics_addr: Option<SocketAddr>,
}

impl ServiceConfig {
    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let config = Self {
            products: MongoTarget {
                uri: env.required("MONGO_URI_PRODUCT")?,
                database: env.optional("PRODUCT_DATABASE"),
                fallback_database: "products",
                collection: env.or("PRODUCT_COLLECTION", "products"),
            },
            orders: MongoTarget {
                uri: env.required("MONGO_URI_ORDER")?,
                database: env.optional("ORDER_DATABASE"),
                fallback_database: "orders",
                collection: env.or("ORDER_COLLECTION", "orders"),
            },
            product_cache: MongoTarget {
                uri: env.required("MONGO_URI_PRODUCT_CACHE")?,
                database: env.optional("PRODUCT_CACHE_DATABASE"),
                fallback_database: "product_cache",
                collection: env.or("PRODUCT_CACHE_COLLECTION", "productcaches"),
            },
            elasticsearch_url: env.required("ELASTICSEARCH_URL")?,
            order_index: env.or("ORDER_INDEX", "orders"),
            retry_interval: Duration::from_secs(env.parsed("SYNC_RETRY_INTERVAL_SECS")?.unwrap_or(5)),
            max_retry_attempts: env.parsed("SYNC_MAX_RETRY_ATTEMPTS")?.unwrap_or(20),
            retry_capacity: env.parsed("SYNC_RETRY_CAPACITY")?.unwrap_or(10_000),
            reconcile_interval: env
                .parsed("SYNC_RECONCILE_INTERVAL_SECS")?
                .map(Duration::from_secs),
            metrics_addr: env.parsed("METRICS_ADDR")?,
        };

        info!(
            product_collection = %config.products.collection,
            order_collection = %config.orders.collection,
            cache_collection = %config.product_cache.collection,
            order_index = %config.order_index,
            retry_interval_secs = config.retry_interval.as_secs(),
            metrics = config.metrics_addr.is_some(),
            "Loaded service configuration"
        );
        Ok(config)
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn optional(&self, name: &'static str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn or(&self, name: &'static str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(name)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    variable: name,
                    message: e.to_string(),
                    value,
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("MONGO_URI_PRODUCT", "mongodb://products:27017"),
        ("MONGO_URI_ORDER", "mongodb://orders:27017"),
        ("MONGO_URI_PRODUCT_CACHE", "mongodb://cache:27017"),
        ("ELASTICSEARCH_URL", "http://search:9200"),
    ];

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_lookup(lookup(REQUIRED)).unwrap();

        assert_eq!(config.products.collection, "products");
        assert_eq!(config.products.database, None);
        assert_eq!(config.products.fallback_database, "products");
        assert_eq!(config.orders.collection, "orders");
        assert_eq!(config.product_cache.collection, "productcaches");
        assert_eq!(config.order_index, "orders");
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.max_retry_attempts, 20);
        assert_eq!(config.retry_capacity, 10_000);
        assert_eq!(config.reconcile_interval, None);
        assert_eq!(config.metrics_addr, None);
    }

    #[test]
    fn test_overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("PRODUCT_DATABASE", "catalog"),
            ("ORDER_INDEX", "orders-v2"),
            ("SYNC_RETRY_INTERVAL_SECS", "30"),
            ("SYNC_RECONCILE_INTERVAL_SECS", "3600"),
            ("METRICS_ADDR", "0.0.0.0:9000"),
        ]);
        let config = ServiceConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.products.database.as_deref(), Some("catalog"));
        assert_eq!(config.order_index, "orders-v2");
        assert_eq!(config.retry_interval, Duration::from_secs(30));
        assert_eq!(config.reconcile_interval, Some(Duration::from_secs(3600)));
        assert_eq!(config.metrics_addr, Some(([0, 0, 0, 0], 9000).into()));
    }

    #[test]
    fn test_missing_required_variable() {
        let vars: Vec<_> = REQUIRED
            .iter()
            .copied()
            .filter(|(k, _)| *k != "ELASTICSEARCH_URL")
            .collect();
        assert_eq!(
            ServiceConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::Missing("ELASTICSEARCH_URL"))
        );
    }

    #[test]
    fn test_blank_value_counts_as_unset() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PRODUCT_COLLECTION", "  "));
        let config = ServiceConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.products.collection, "products");
    }

    #[test]
    fn test_invalid_number() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SYNC_MAX_RETRY_ATTEMPTS", "many"));
        let err = ServiceConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { variable: "SYNC_MAX_RETRY_ATTEMPTS", .. }
        ));
    }
}
