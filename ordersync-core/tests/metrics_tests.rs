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

//! Tests for metrics instrumentation module.

use ordersync_core::engine::EngineState;
use ordersync_core::metrics::{
    Timer, APPLY_DURATION_SECONDS, DEAD_LETTERS_TOTAL, ENGINE_STATE, EVENTS_APPLIED_TOTAL,
    EVENTS_RECEIVED_TOTAL, METRIC_PREFIX, RECONCILE_DURATION_SECONDS, RETRY_QUEUE_SIZE,
};

#[test]
fn test_metric_names() {
    for name in [
        EVENTS_RECEIVED_TOTAL,
        EVENTS_APPLIED_TOTAL,
        DEAD_LETTERS_TOTAL,
        APPLY_DURATION_SECONDS,
        RECONCILE_DURATION_SECONDS,
        RETRY_QUEUE_SIZE,
        ENGINE_STATE,
    ] {
        assert!(name.starts_with(METRIC_PREFIX), "{name}");
    }
    assert!(EVENTS_RECEIVED_TOTAL.ends_with("_total"));
    assert!(APPLY_DURATION_SECONDS.ends_with("_seconds"));
    assert!(RECONCILE_DURATION_SECONDS.ends_with("_seconds"));
}

#[test]
fn test_engine_state_values() {
    assert_eq!(EngineState::Stopped.as_gauge(), 0);
    assert_eq!(EngineState::Starting.as_gauge(), 1);
    assert_eq!(EngineState::Reconciling.as_gauge(), 2);
    assert_eq!(EngineState::Watching.as_gauge(), 3);
    assert_eq!(EngineState::Degraded.as_gauge(), 4);
    assert_eq!(EngineState::Restarting.as_gauge(), 5);
}

#[test]
fn test_recording_without_recorder_is_noop() {
    ordersync_core::metrics::increment_events_received("test", "insert");
    ordersync_core::metrics::set_retry_queue_size("test", 3);
    ordersync_core::metrics::set_engine_state("test", EngineState::Watching);
}

#[test]
fn test_timer() {
    use std::thread;
    use std::time::Duration;

    let recorded_duration = std::sync::Arc::new(std::sync::Mutex::new(None));
    let recorded_duration_clone = recorded_duration.clone();

    {
        let _timer = Timer::new("test", move |duration, _label| {
            *recorded_duration_clone.lock().unwrap() = Some(duration);
        });
        thread::sleep(Duration::from_millis(10));
    }

    let duration = recorded_duration.lock().unwrap().unwrap();
    assert!(duration.as_millis() >= 10);
}
