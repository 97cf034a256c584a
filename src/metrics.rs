//! Prometheus metrics registry and instruments.
//!
//! Counters are labelled by activity type and outcome so operators can see
//! which remote servers are failing delivery or sending rejected activities.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Inbound
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedshelf_activities_received_total", "Total number of inbound activities by outcome"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("fedshelf_signature_verifications_total", "HTTP signature verification results"),
        &["result"]
    ).expect("metric can be created");

    // Outbound
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedshelf_deliveries_total", "Total number of delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fedshelf_delivery_duration_seconds",
            "Outbound delivery request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_WORKERS_BUSY: IntGauge = IntGauge::new(
        "fedshelf_delivery_workers_busy",
        "Number of delivery workers currently sending"
    ).expect("metric can be created");

    pub static ref DELIVERY_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "fedshelf_delivery_queue_depth",
        "Delivery jobs waiting to be sent or retried, sampled on scrape"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedshelf_errors_total", "Total number of errors"),
        &["error_type", "endpoint"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Safe to call more than once; later registrations are ignored.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVITIES_RECEIVED.clone()),
        Box::new(SIGNATURE_VERIFICATIONS.clone()),
        Box::new(DELIVERIES_TOTAL.clone()),
        Box::new(DELIVERY_DURATION_SECONDS.clone()),
        Box::new(DELIVERY_WORKERS_BUSY.clone()),
        Box::new(DELIVERY_QUEUE_DEPTH.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::debug!(%error, "Metric already registered");
        }
    }

    tracing::info!("Metrics registry initialized");
}
