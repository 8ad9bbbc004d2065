//! Prometheus metrics for the bus and the order engine
//!
//! Everything is registered in the default registry so `/metrics` can use
//! `prometheus::gather()`.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

pub static ENVELOPES_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_envelopes_published_total",
        "Envelopes enqueued for delivery, per feed",
        &["feed"]
    )
    .expect("envelopes_published metric registers once")
});

pub static ENVELOPES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_envelopes_dropped_total",
        "Envelopes removed from delivery queues before delivery",
        &["feed", "reason"]
    )
    .expect("envelopes_dropped metric registers once")
});

pub static SLOW_CONSUMER_DISCONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arb_slow_consumer_disconnects_total",
        "Connections dropped because a reliable envelope could not be queued"
    )
    .expect("slow_consumer_disconnects metric registers once")
});

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("arb_active_connections", "Connections attached to the bus")
        .expect("active_connections metric registers once")
});

pub static ORDER_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_order_transitions_total",
        "Accepted order transitions, per resulting status",
        &["status"]
    )
    .expect("order_transitions metric registers once")
});

pub static ILLEGAL_TRANSITIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arb_illegal_transitions_total",
        "Transitions refused by the order state machine"
    )
    .expect("illegal_transitions metric registers once")
});

pub static ADAPTER_TIMEOUTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arb_adapter_timeouts_total",
        "Exchange adapter calls that hit their deadline"
    )
    .expect("adapter_timeouts metric registers once")
});

pub static STALE_TICKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arb_stale_ticks_total",
        "Ticks discarded because a newer one was already cached"
    )
    .expect("stale_ticks metric registers once")
});

/// Render the default registry in the Prometheus text format
pub fn render() -> String {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
