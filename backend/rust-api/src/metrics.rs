use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    CounterVec, Encoder, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Attempt store calls
    pub static ref BACKEND_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempt_backend_operations_total",
        "Total number of attempt store calls",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref BACKEND_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "attempt_backend_operation_duration_seconds",
        "Attempt store call duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();

    // Read cache
    pub static ref CACHE_HIT_RATIO: CounterVec = register_counter_vec!(
        "attempt_read_cache_hit_ratio",
        "Attempt read cache hit/miss ratio",
        &["result"]
    )
    .unwrap();

    pub static ref CIRCUIT_BREAKER_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state transitions",
        &["operation", "state"]
    )
    .unwrap();

    // Sync core
    pub static ref SYNC_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sync_operations_total",
        "Total number of sync operations",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref SYNC_CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sync_conflicts_total",
        "Total number of resolved per-question conflicts",
        &["strategy"]
    )
    .unwrap();

    pub static ref INVALID_CHANGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sync_invalid_changes_total",
        "Change events dropped by validation",
        &["kind"]
    )
    .unwrap();

    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "sync_connections_active",
        "Number of registered client connections"
    )
    .unwrap();

    pub static ref SSE_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "sse_connections_active",
        "Number of active SSE connections"
    )
    .unwrap();

    pub static ref ACTIVITY_LOG_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "activity_log_failures_total",
        "Activity log appends that failed and were dropped",
        &["sink"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track an attempt store call with metrics
pub async fn track_backend_operation<F, T, E>(operation: &str, future: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    BACKEND_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();

    BACKEND_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(duration);

    result
}

/// Record cache hit
pub fn record_cache_hit() {
    CACHE_HIT_RATIO.with_label_values(&["hit"]).inc();
}

/// Record cache miss
pub fn record_cache_miss() {
    CACHE_HIT_RATIO.with_label_values(&["miss"]).inc();
}

pub fn record_sync_operation(operation: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    SYNC_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let _ = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/health", "200"])
            .get();
    }

    #[test]
    fn test_render_metrics() {
        SYNC_OPERATIONS_TOTAL
            .with_label_values(&["auto_save", "success"])
            .inc();

        let result = render_metrics();
        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.contains("sync_operations_total"));
    }

    #[tokio::test]
    async fn track_backend_operation_passes_result_through() {
        let res: Result<u8, &str> = track_backend_operation("read", async { Ok(3) }).await;
        assert_eq!(res, Ok(3));
    }
}
