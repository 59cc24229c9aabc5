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

//! Ordersync Core - change-data-capture sync engine
//!
//! This crate keeps derived stores (a product cache, an order search index)
//! consistent with the MongoDB collections they are derived from.
//!
//! # Key Components
//!
//! - **Records**: [`record`] defines keys, source and derived records, and timestamp ordering
//! - **Events**: [`event`] normalizes raw change stream notifications
//! - **Sources**: [`source`] and [`stream`] read snapshots and change streams
//! - **Stores**: [`store`] is the derived store contract
//! - **Mappers**: [`mapper`] shapes source records for a store
//! - **Applier**: [`applier`] writes events with last-writer-wins and delete tombstones
//! - **Retry**: [`retry`] buffers transiently failed events
//! - **Reconciler**: [`reconciler`] repairs drift on startup
//! - **Engine**: [`engine`] supervises all of the above
//!
//! # Example
//!
//! ```rust
//! use ordersync_core::event::{normalize, Namespace, OperationType, RawChange};
//! use bson::doc;
//!
//! let raw = RawChange {
//!     operation: OperationType::Insert,
//!     namespace: Namespace::new("shop", "products"),
//!     document_key: Some(doc! { "_id": "p1" }),
//!     full_document: Some(doc! { "_id": "p1", "title": "Lamp" }),
//!     cluster_time: chrono::Utc::now(),
//! };
//!
//! let event = normalize(raw, "updatedAt").unwrap();
//! assert!(!event.is_delete());
//! ```

pub mod applier;
pub mod engine;
pub mod event;
pub mod mapper;
pub mod metrics;
pub mod reconciler;
pub mod record;
pub mod retry;
pub mod source;
pub mod store;
pub mod stream;
