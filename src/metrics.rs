//! Prometheus metrics for the bridge relayer
//!
//! Registered in the default registry. There is no scrape endpoint; the
//! binary logs a text snapshot from [`encode_text`] at shutdown.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // Dispatch
    pub static ref LOGS_RECEIVED: CounterVec = register_counter_vec!(
        "relayer_logs_received_total",
        "Total number of logs delivered by the subscription",
        &["chain"]
    ).unwrap();

    pub static ref LOGS_DISPATCHED: CounterVec = register_counter_vec!(
        "relayer_logs_dispatched_total",
        "Total number of logs routed to a registration",
        &["chain", "event"]
    ).unwrap();

    pub static ref LOGS_DROPPED: CounterVec = register_counter_vec!(
        "relayer_logs_dropped_total",
        "Total number of logs dropped (removed or unmatched)",
        &["chain", "reason"]
    ).unwrap();

    pub static ref HANDLER_FAILURES: CounterVec = register_counter_vec!(
        "relayer_handler_failures_total",
        "Total number of event handler invocations that returned an error",
        &["chain", "event"]
    ).unwrap();

    // Submission
    pub static ref TRANSACTIONS: CounterVec = register_counter_vec!(
        "relayer_transactions_total",
        "Total number of transaction submissions by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_confirmation_latency_seconds",
        "Time from broadcast to receipt",
        &["chain"],
        vec![0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref RESUBMISSIONS: CounterVec = register_counter_vec!(
        "relayer_resubmissions_total",
        "Relay submissions repeated after a confirmation timeout",
        &["event"]
    ).unwrap();
}

/// Text exposition of every registered metric
pub fn encode_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        return format!("# failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
