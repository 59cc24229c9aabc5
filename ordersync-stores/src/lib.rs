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

//! Derived store implementations for ordersync.
//!
//! This crate provides backend implementations of the
//! [`DerivedStore`](ordersync_core::store::DerivedStore) trait.
//!
//! # Available Stores
//!
//! - **MongoDB cache** (`mongo-cache` feature): product cache documents in a
//!   MongoDB collection
//! - **Search index** (`search-index` feature): order documents in an
//!   Elasticsearch index, over its REST API
//!
//! # Feature Flags
//!
//! - `mongo-cache`: Enables [`mongo_cache::MongoCacheStore`] (default)
//! - `search-index`: Enables [`search_index::SearchIndexStore`] (default, pulls in `reqwest`)
//!
//! # Example: Product Cache
//!
//! ```rust,ignore
//! use ordersync_stores::mongo_cache::MongoCacheStore;
//! use ordersync_core::store::DerivedStore;
//! use ordersync_core::record::RecordId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
//! let store = MongoCacheStore::new(client.database("product_cache").collection("productcaches"));
//!
//! let cached = store.find_by_key(&RecordId::parse("65a1f0c2e4b0a1b2c3d4e5f6")).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

#[cfg(feature = "mongo-cache")]
pub mod mongo_cache;

#[cfg(feature = "search-index")]
pub mod search_index;
