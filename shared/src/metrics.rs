//! Prometheus metrics recorded at fixed points in the core. Export plumbing
//! (the `/metrics` route) lives in the server binary.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};

use crate::breaker::BreakerState;

lazy_static! {
    pub static ref ORDERS_CREATED_TOTAL: IntCounter = register_int_counter!(
        "bookshop_orders_created_total",
        "Orders successfully created"
    )
    .unwrap();

    pub static ref ORDERS_CANCELLED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "bookshop_orders_cancelled_total",
        "Orders cancelled, by reason",
        &["reason"]
    )
    .unwrap();

    pub static ref STOCK_OPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "bookshop_stock_ops_total",
        "Fast-store stock operations, by op and result",
        &["op", "result"]
    )
    .unwrap();

    pub static ref DURABILITY_JOB_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "bookshop_durability_job_failures_total",
        "Async durable-store write jobs that failed and need replay"
    )
    .unwrap();

    pub static ref SAGA_COMPENSATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "bookshop_saga_compensations_total",
        "Saga compensation runs, by saga and step",
        &["saga", "step"]
    )
    .unwrap();

    pub static ref BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        "bookshop_breaker_state",
        "Circuit breaker state (0=closed, 1=open, 2=half_open)",
        &["name"]
    )
    .unwrap();

    pub static ref BREAKER_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "bookshop_breaker_transitions_total",
        "Circuit breaker transitions, by breaker and new state",
        &["name", "to"]
    )
    .unwrap();

    pub static ref PENDING_SCAN_SECONDS: Histogram = register_histogram!(
        "bookshop_pending_scan_seconds",
        "Duration of one expiry scanner tick"
    )
    .unwrap();

    pub static ref ORDER_CREATE_SECONDS: Histogram = register_histogram!(
        "bookshop_order_create_seconds",
        "End-to-end create-order latency"
    )
    .unwrap();
}

pub fn stock_op(op: &str, result: &str) {
    STOCK_OPS_TOTAL.with_label_values(&[op, result]).inc();
}

pub fn order_cancelled(reason: &str) {
    ORDERS_CANCELLED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn saga_compensation(saga: &str, step: &str) {
    SAGA_COMPENSATIONS_TOTAL.with_label_values(&[saga, step]).inc();
}

pub fn breaker_state(name: &str, state: BreakerState) {
    let value = match state {
        BreakerState::Closed => 0,
        BreakerState::Open => 1,
        BreakerState::HalfOpen => 2,
    };
    BREAKER_STATE.with_label_values(&[name]).set(value);
}

pub fn breaker_transition(name: &str, to: BreakerState) {
    BREAKER_TRANSITIONS_TOTAL
        .with_label_values(&[name, to.as_str()])
        .inc();
}

/// Encode every registered metric in the Prometheus text format.
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
