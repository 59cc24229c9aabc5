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

//! Metrics instrumentation for sync engines.
//!
//! Uses the `metrics` facade; nothing is recorded until a recorder (for
//! example `metrics-exporter-prometheus`) is installed by the binary.
//!
//! # Naming Conventions
//!
//! - Prefix with `ordersync_`
//! - Counters end with `_total`, durations with `_seconds`
//!
//! # Labels
//!
//! - **engine**: engine name such as "product-cache" (very low cardinality)
//! - **operation**: "insert", "update" or "delete"
//! - **outcome** / **result** / **reason**: small fixed sets
//! - **error\_type**: error category from `category()` methods
//! - **store\_type**: "mongodb", "elasticsearch", "mock"
//!
//! Never use record keys or error messages as labels.
//!
//! # Examples
//!
//! ```rust
//! use ordersync_core::metrics;
//!
//! metrics::increment_events_received("product-cache", "insert");
//! metrics::set_retry_queue_size("product-cache", 3);
//! ```

use crate::engine::EngineState;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all ordersync metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "ordersync";

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Changes received from a watch session.
///
/// Type: Counter
/// Labels: engine, operation
#[doc(hidden)]
pub const EVENTS_RECEIVED_TOTAL: &str = "ordersync_events_received_total";

/// Raw changes discarded by the normalizer.
///
/// Type: Counter
/// Labels: engine, reason
#[doc(hidden)]
pub const EVENTS_DROPPED_TOTAL: &str = "ordersync_events_dropped_total";

/// Events applied to a derived store, by outcome.
///
/// Type: Counter
/// Labels: engine, operation, outcome
#[doc(hidden)]
pub const EVENTS_APPLIED_TOTAL: &str = "ordersync_events_applied_total";

/// Failed applications.
///
/// Type: Counter
/// Labels: engine, error_type ("transient" or "permanent")
#[doc(hidden)]
pub const APPLY_FAILURES_TOTAL: &str = "ordersync_apply_failures_total";

/// Time spent in one application, store round trips included.
///
/// Type: Histogram
/// Labels: store_type
#[doc(hidden)]
pub const APPLY_DURATION_SECONDS: &str = "ordersync_apply_duration_seconds";

/// Entries waiting in the retry queue.
///
/// Type: Gauge
/// Labels: engine
#[doc(hidden)]
pub const RETRY_QUEUE_SIZE: &str = "ordersync_retry_queue_size";

/// Retry attempts, by result.
///
/// Type: Counter
/// Labels: engine, result ("succeeded", "requeued", "dead_lettered", "superseded")
#[doc(hidden)]
pub const RETRIES_TOTAL: &str = "ordersync_retries_total";

/// Events given up on.
///
/// Type: Counter
/// Labels: engine, reason
#[doc(hidden)]
pub const DEAD_LETTERS_TOTAL: &str = "ordersync_dead_letters_total";

/// Reconciliation runs, by result.
///
/// Type: Counter
/// Labels: engine, result ("completed", "failed")
#[doc(hidden)]
pub const RECONCILE_RUNS_TOTAL: &str = "ordersync_reconcile_runs_total";

/// Records visited by reconciliation, by action taken.
///
/// Type: Counter
/// Labels: engine, action ("inserted", "updated", "unchanged", "invalid")
#[doc(hidden)]
pub const RECONCILE_RECORDS_TOTAL: &str = "ordersync_reconcile_records_total";

/// Duration of a reconciliation run.
///
/// Type: Histogram
/// Labels: engine
#[doc(hidden)]
pub const RECONCILE_DURATION_SECONDS: &str = "ordersync_reconcile_duration_seconds";

/// Watch session failures.
///
/// Type: Counter
/// Labels: engine, error_type
#[doc(hidden)]
pub const SOURCE_ERRORS_TOTAL: &str = "ordersync_source_errors_total";

/// Engine restarts after a degraded session.
///
/// Type: Counter
/// Labels: engine
#[doc(hidden)]
pub const ENGINE_RESTARTS_TOTAL: &str = "ordersync_engine_restarts_total";

/// Current engine state, see [`EngineState::as_gauge`].
///
/// Type: Gauge
/// Labels: engine
#[doc(hidden)]
pub const ENGINE_STATE: &str = "ordersync_engine_state";

/// Registers descriptions for every metric.
///
/// Call once after installing a recorder.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_RECEIVED_TOTAL,
        "Change events received from source watch sessions"
    );
    describe_counter!(
        EVENTS_DROPPED_TOTAL,
        "Raw changes discarded during normalization"
    );
    describe_counter!(
        EVENTS_APPLIED_TOTAL,
        "Change events applied to derived stores, by outcome"
    );
    describe_counter!(APPLY_FAILURES_TOTAL, "Failed change event applications");
    describe_counter!(RETRIES_TOTAL, "Retry attempts for failed change events");
    describe_counter!(
        DEAD_LETTERS_TOTAL,
        "Change events abandoned after permanent failure, exhausted attempts or overflow"
    );
    describe_counter!(RECONCILE_RUNS_TOTAL, "Reconciliation runs");
    describe_counter!(
        RECONCILE_RECORDS_TOTAL,
        "Source records visited by reconciliation, by action"
    );
    describe_counter!(SOURCE_ERRORS_TOTAL, "Source watch session failures");
    describe_counter!(ENGINE_RESTARTS_TOTAL, "Engine restarts after a failed session");

    describe_histogram!(
        APPLY_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken to apply one change event"
    );
    describe_histogram!(
        RECONCILE_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken by one reconciliation run"
    );

    describe_gauge!(RETRY_QUEUE_SIZE, "Change events waiting for retry");
    describe_gauge!(
        ENGINE_STATE,
        "Engine state (0=stopped, 1=starting, 2=reconciling, 3=watching, 4=degraded, 5=restarting)"
    );
}

pub fn increment_events_received(engine: &str, operation: &str) {
    counter!(EVENTS_RECEIVED_TOTAL, "engine" => engine.to_string(), "operation" => operation.to_string())
        .increment(1);
}

pub fn increment_events_dropped(engine: &str, reason: &'static str) {
    counter!(EVENTS_DROPPED_TOTAL, "engine" => engine.to_string(), "reason" => reason).increment(1);
}

pub fn increment_events_applied(engine: &str, operation: &str, outcome: &'static str) {
    counter!(
        EVENTS_APPLIED_TOTAL,
        "engine" => engine.to_string(),
        "operation" => operation.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn increment_apply_failures(engine: &str, error_type: &'static str) {
    counter!(APPLY_FAILURES_TOTAL, "engine" => engine.to_string(), "error_type" => error_type)
        .increment(1);
}

pub fn record_apply_duration(duration: Duration, store_type: &str) {
    histogram!(APPLY_DURATION_SECONDS, "store_type" => store_type.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_retry_queue_size(engine: &str, size: usize) {
    gauge!(RETRY_QUEUE_SIZE, "engine" => engine.to_string()).set(size as f64);
}

pub fn increment_retries(engine: &str, result: &'static str) {
    counter!(RETRIES_TOTAL, "engine" => engine.to_string(), "result" => result).increment(1);
}

pub fn increment_dead_letters(engine: &str, reason: &'static str) {
    counter!(DEAD_LETTERS_TOTAL, "engine" => engine.to_string(), "reason" => reason).increment(1);
}

pub fn increment_reconcile_runs(engine: &str, result: &'static str) {
    counter!(RECONCILE_RUNS_TOTAL, "engine" => engine.to_string(), "result" => result).increment(1);
}

/// Adds `count` records to the reconcile counter for `action`. Zero counts are skipped.
pub fn increment_reconcile_records(engine: &str, action: &'static str, count: u64) {
    if count > 0 {
        counter!(RECONCILE_RECORDS_TOTAL, "engine" => engine.to_string(), "action" => action)
            .increment(count);
    }
}

pub fn record_reconcile_duration(engine: &str, duration: Duration) {
    histogram!(RECONCILE_DURATION_SECONDS, "engine" => engine.to_string())
        .record(duration.as_secs_f64());
}

pub fn increment_source_errors(engine: &str, error_type: &'static str) {
    counter!(SOURCE_ERRORS_TOTAL, "engine" => engine.to_string(), "error_type" => error_type)
        .increment(1);
}

pub fn increment_engine_restarts(engine: &str) {
    counter!(ENGINE_RESTARTS_TOTAL, "engine" => engine.to_string()).increment(1);
}

pub fn set_engine_state(engine: &str, state: EngineState) {
    gauge!(ENGINE_STATE, "engine" => engine.to_string()).set(f64::from(state.as_gauge()));
}

// ============================================================================
// Metric Helper Utilities
// ============================================================================

/// Helper for timing operations and automatically recording the duration.
///
/// # Examples
///
/// ```rust
/// use ordersync_core::metrics::Timer;
///
/// {
///     let _timer = Timer::new("mongodb", |duration, store_type| {
///         ordersync_core::metrics::record_apply_duration(duration, store_type);
///     });
///     // ... operation to time ...
/// } // Timer records when dropped
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    /// Creates a new timer that will record the duration when dropped.
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}
