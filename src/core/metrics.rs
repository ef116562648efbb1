//! Metrics collection for the download scheduler using Prometheus
//!
//! Tracks:
//! - Queue health (depth, wait time, rejections)
//! - Worker pool load (active downloads)
//! - Download outcomes by strategy, fallbacks by platform

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramVec, TextEncoder,
};

// ======================
// QUEUE METRICS
// ======================

/// Pending items by priority
/// Labels: priority (low/normal/high)
pub static QUEUE_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!("boss_dl_queue_depth", "Pending items by priority", &["priority"]).unwrap()
});

/// Total pending items
pub static QUEUE_DEPTH_TOTAL: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("boss_dl_queue_depth_total", "Total pending items").unwrap());

/// Time items spend pending before dispatch
pub static QUEUE_WAIT_TIME_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "boss_dl_queue_wait_time_seconds",
        "Time items spend waiting in queue before dispatch",
        vec![1.0, 5.0, 30.0, 60.0, 300.0, 600.0, 1800.0]
    )
    .unwrap()
});

/// Rejected enqueue/submit calls
/// Labels: reason (queue_full/quota_exceeded/...)
pub static REJECTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("boss_dl_rejections_total", "Rejected requests by reason", &["reason"]).unwrap()
});

// ======================
// DOWNLOAD METRICS
// ======================

/// Downloads currently holding a worker slot
pub static ACTIVE_DOWNLOADS: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("boss_dl_active_downloads", "Downloads currently in flight").unwrap());

/// Download duration by strategy
pub static DOWNLOAD_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "boss_dl_download_duration_seconds",
        "Time spent downloading by strategy",
        &["strategy"],
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .unwrap()
});

/// Successful downloads
/// Labels: strategy
pub static DOWNLOAD_SUCCESS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "boss_dl_download_success_total",
        "Total number of successful downloads",
        &["strategy"]
    )
    .unwrap()
});

/// Failed downloads
/// Labels: strategy, error_type
pub static DOWNLOAD_FAILURE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "boss_dl_download_failure_total",
        "Total number of failed downloads",
        &["strategy", "error_type"]
    )
    .unwrap()
});

/// CLI fallbacks after an API failure
/// Labels: platform
pub static FALLBACK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "boss_dl_fallback_total",
        "API downloads retried through the CLI strategy",
        &["platform"]
    )
    .unwrap()
});

/// Forces registration so the exposition lists every series from startup.
pub fn init_metrics() {
    Lazy::force(&QUEUE_DEPTH);
    Lazy::force(&QUEUE_DEPTH_TOTAL);
    Lazy::force(&QUEUE_WAIT_TIME_SECONDS);
    Lazy::force(&REJECTIONS_TOTAL);
    Lazy::force(&ACTIVE_DOWNLOADS);
    Lazy::force(&DOWNLOAD_DURATION_SECONDS);
    Lazy::force(&DOWNLOAD_SUCCESS_TOTAL);
    Lazy::force(&DOWNLOAD_FAILURE_TOTAL);
    Lazy::force(&FALLBACK_TOTAL);
}

/// Helper function to update queue depth
pub fn update_queue_depth(priority: &str, depth: usize) {
    QUEUE_DEPTH.with_label_values(&[priority]).set(depth as f64);
}

/// Helper function to update total queue depth
pub fn update_queue_depth_total(depth: usize) {
    QUEUE_DEPTH_TOTAL.set(depth as f64);
}

pub fn record_queue_wait(seconds: f64) {
    QUEUE_WAIT_TIME_SECONDS.observe(seconds.max(0.0));
}

pub fn record_rejection(reason: &str) {
    REJECTIONS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_active_downloads(count: usize) {
    ACTIVE_DOWNLOADS.set(count as f64);
}

pub fn record_download_success(strategy: &str, seconds: f64) {
    DOWNLOAD_SUCCESS_TOTAL.with_label_values(&[strategy]).inc();
    DOWNLOAD_DURATION_SECONDS.with_label_values(&[strategy]).observe(seconds);
}

pub fn record_download_failure(strategy: &str, error_type: &str) {
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&[strategy, error_type]).inc();
}

pub fn record_fallback(platform: &str) {
    FALLBACK_TOTAL.with_label_values(&[platform]).inc();
}

/// Renders the default registry in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        log::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
    }

    #[test]
    fn test_record_download_success() {
        record_download_success("http", 1.5);
        let metric = DOWNLOAD_SUCCESS_TOTAL.with_label_values(&["http"]).get();
        assert!(metric >= 1.0);
    }

    #[test]
    fn test_record_rejection() {
        record_rejection("metrics_test_reason");
        let metric = REJECTIONS_TOTAL.with_label_values(&["metrics_test_reason"]).get();
        assert!(metric >= 1.0);
    }

    #[test]
    fn test_gather_text_contains_series() {
        init_metrics();
        record_fallback("metrics_test_platform");
        let text = gather_text();
        assert!(text.contains("boss_dl_fallback_total"));
    }
}
