use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref BYTES_SERVED: IntCounterVec = register_int_counter_vec!(
        "tunestream_bytes_served_total",
        "Bytes piped from the remote store to clients",
        &["kind"]
    )
    .unwrap();
    pub static ref UPSTREAM_RETRIES: IntCounterVec = register_int_counter_vec!(
        "tunestream_upstream_retries_total",
        "Retried upstream open attempts by failure classification",
        &["reason"]
    )
    .unwrap();
    pub static ref RESPONSES: IntCounterVec = register_int_counter_vec!(
        "tunestream_responses_total",
        "Media responses by route and status code",
        &["route", "status"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
