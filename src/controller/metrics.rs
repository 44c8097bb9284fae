//! Prometheus metrics for the service load balancer controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `lb_operation_duration_seconds` (histogram): latency of `reconcile`, `ensure` and `delete`.
//! - `lb_reconcile_errors_total` (counter): failed syncs labeled by error kind.
//! - `lb_requeues_total` (counter): keys put back on the queue, labeled `throttled` or `error`.
//! - `lb_workqueue_depth` (gauge): keys ready for processing.

use std::sync::atomic::{AtomicI64, AtomicU64};
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    /// "reconcile", "ensure" or "delete"
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequeueLabels {
    pub reason: String,
}

/// Histogram tracking load balancer operation latency (seconds)
pub static OPERATION_DURATION_SECONDS: Lazy<Family<OperationLabels, Histogram>> =
    Lazy::new(|| {
        fn operation_histogram() -> Histogram {
            // 1ms .. ~32s across 16 buckets.
            Histogram::new(exponential_buckets(0.001, 2.0, 16))
        }

        Family::new_with_constructor(operation_histogram)
    });

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REQUEUES_TOTAL: Lazy<Family<RequeueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static WORKQUEUE_DEPTH: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "lb_operation_duration_seconds",
        "Duration of load balancer operations in seconds",
        OPERATION_DURATION_SECONDS.clone(),
    );
    registry.register(
        "lb_reconcile_errors_total",
        "Total number of failed service syncs",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "lb_requeues_total",
        "Total number of service keys requeued after a failed sync",
        REQUEUES_TOTAL.clone(),
    );
    registry.register(
        "lb_workqueue_depth",
        "Service keys waiting to be processed",
        WORKQUEUE_DEPTH.clone(),
    );

    registry
});

pub fn observe_operation(operation: &str, elapsed: Duration) {
    let labels = OperationLabels {
        operation: operation.to_string(),
    };
    OPERATION_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(elapsed.as_secs_f64());
}

pub fn inc_reconcile_error(kind: &str) {
    let labels = ErrorLabels {
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_requeue(reason: &str) {
    let labels = RequeueLabels {
        reason: reason.to_string(),
    };
    REQUEUES_TOTAL.get_or_create(&labels).inc();
}

pub fn set_workqueue_depth(depth: usize) {
    WORKQUEUE_DEPTH.set(depth as i64);
}

/// Render the registry in the OpenMetrics text format
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
