//! Metrics for the watch-and-reconcile pipeline
//!
//! OpenTelemetry instruments on the global meter. Without an installed
//! meter provider they are no-ops, so the runtime records unconditionally.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for kubeops metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("kubeops"));

// ============================================================================
// Watch Metrics
// ============================================================================

/// Counter of watch events accepted by a watcher
///
/// Labels:
/// - `kind`: entity kind
/// - `event`: added, modified, deleted, bookmark, error
pub static WATCH_EVENTS_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubeops_watch_events_total")
        .with_description("Total number of watch events received")
        .with_unit("{events}")
        .build()
});

/// Counter of watch reconnects
///
/// Labels:
/// - `kind`: entity kind
/// - `reason`: closed, error, gone
pub static WATCH_RESTARTS_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubeops_watch_restarts_total")
        .with_description("Total number of watch reconnects")
        .with_unit("{restarts}")
        .build()
});

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of controller callback duration
///
/// Labels:
/// - `kind`: entity kind
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("kubeops_reconcile_duration_seconds")
        .with_description("Duration of controller callbacks in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed controller callbacks
///
/// Labels:
/// - `kind`: entity kind
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubeops_reconcile_errors_total")
        .with_description("Total number of failed controller callbacks")
        .with_unit("{errors}")
        .build()
});

/// Counter of entities put back into the queue with a delay
///
/// Labels:
/// - `kind`: entity kind
/// - `reason`: requested, error
pub static REQUEUES_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubeops_requeues_total")
        .with_description("Total number of delayed requeues")
        .with_unit("{requeues}")
        .build()
});

// ============================================================================
// Leader Election Metrics
// ============================================================================

/// Gauge: 1 while this replica holds the lease, 0 otherwise
///
/// Labels:
/// - `lease`: lease name
pub static IS_LEADER: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("kubeops_is_leader")
        .with_description("Whether this replica currently holds the leader lease")
        .build()
});

/// Record one watch event
pub fn record_watch_event(kind: &str, event: &'static str) {
    WATCH_EVENTS_TOTAL.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("event", event),
        ],
    );
}

/// Record one watch reconnect
pub fn record_watch_restart(kind: &str, reason: &'static str) {
    WATCH_RESTARTS_TOTAL.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("reason", reason),
        ],
    );
}

/// Record a controller callback duration and outcome
pub fn record_reconcile(kind: &str, seconds: f64, success: bool) {
    let result = if success { "success" } else { "error" };
    RECONCILE_DURATION.record(
        seconds,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("result", result),
        ],
    );
    if !success {
        RECONCILE_ERRORS.add(1, &[KeyValue::new("kind", kind.to_string())]);
    }
}

/// Record a delayed requeue
pub fn record_requeue(kind: &str, reason: &'static str) {
    REQUEUES_TOTAL.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("reason", reason),
        ],
    );
}

/// Record the current leadership of this replica
pub fn record_leadership(lease: &str, leader: bool) {
    IS_LEADER.record(
        i64::from(leader),
        &[KeyValue::new("lease", lease.to_string())],
    );
}
