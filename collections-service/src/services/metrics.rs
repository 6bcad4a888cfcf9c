//! Prometheus metrics for collections-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    HistogramVec, TextEncoder,
};

/// Invoice counter by status transition target.
pub static INVOICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "collections_invoices_total",
        "Total number of invoice state changes by resulting status",
        &["status"] // pending, partially_paid, paid, refunded
    )
    .expect("Failed to register invoices_total")
});

/// Webhook events by type and outcome.
pub static WEBHOOK_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "collections_webhook_events_total",
        "Total number of payment provider webhook events",
        &["event_type", "outcome"] // applied, duplicate, ignored, rejected
    )
    .expect("Failed to register webhook_events_total")
});

/// Follow-up emails by kind and outcome.
pub static FOLLOW_UPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "collections_follow_ups_total",
        "Total number of follow-up emails",
        &["kind", "outcome"] // kind: sweep, manual, custom
    )
    .expect("Failed to register follow_ups_total")
});

/// Due-queue activity.
pub static SCHEDULED_EMAILS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "collections_scheduled_emails_total",
        "Total number of scheduled email operations by outcome",
        &["outcome"] // scheduled, sent, failed, skipped
    )
    .expect("Failed to register scheduled_emails_total")
});

/// Settled payment volume.
pub static PAYMENT_AMOUNT_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "collections_payment_amount_total",
        "Total settled payment amount in USD"
    )
    .expect("Failed to register payment_amount_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "collections_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "collections_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&INVOICES_TOTAL);
    Lazy::force(&WEBHOOK_EVENTS_TOTAL);
    Lazy::force(&FOLLOW_UPS_TOTAL);
    Lazy::force(&SCHEDULED_EMAILS_TOTAL);
    Lazy::force(&PAYMENT_AMOUNT_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
