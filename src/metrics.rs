//metrics.rs
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Histogram,
    HistogramOpts, Opts,
};

lazy_static! {
    // Registration metrics
    pub static ref REGISTRATIONS: Counter = register_counter!(Opts::new(
        "registrations_total",
        "Total number of (token, user, role) registrations accepted"
    ))
    .unwrap();

    pub static ref UNREGISTRATIONS: Counter = register_counter!(Opts::new(
        "unregistrations_total",
        "Total number of unregister requests handled"
    ))
    .unwrap();

    // Delivery metrics
    pub static ref NOTIFICATIONS_SENT: Counter = register_counter!(Opts::new(
        "notifications_sent_total",
        "Total number of per-token deliveries accepted by the push provider"
    ))
    .unwrap();

    pub static ref NOTIFICATIONS_FAILED: Counter = register_counter!(Opts::new(
        "notifications_failed_total",
        "Total number of per-token deliveries that failed"
    ))
    .unwrap();

    pub static ref INVALID_TOKENS_REMOVED: Counter = register_counter!(Opts::new(
        "invalid_tokens_removed_total",
        "Total number of tokens removed after the push provider rejected them"
    ))
    .unwrap();

    // Client-side filter decisions, labelled by outcome
    pub static ref FILTER_DECISIONS: CounterVec = register_counter_vec!(
        Opts::new("filter_decisions_total", "Delivery filter decisions"),
        &["outcome"]
    )
    .unwrap();

    pub static ref DISPATCH_TIME: Histogram = register_histogram!(
        HistogramOpts::new(
            "dispatch_time_seconds",
            "Time taken to resolve and deliver one notification request"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .unwrap();
}

// Function to expose metrics endpoint
pub fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return format!("Error encoding metrics: {}", e);
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => metrics,
        Err(e) => format!("Error converting metrics to string: {}", e),
    }
}
