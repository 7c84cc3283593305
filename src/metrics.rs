use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinHandle;
use tracing::info;

/// The Metrics Sink (§4.G): an opaque capability the Batch Buffer and Bulk
/// Dispatcher record latency and success/error counts against. The core
/// depends only on this trait; any concrete exporter lives outside it.
pub trait MetricsSink: Send + Sync {
    fn record_process_latency(&self, ms: i64);
    fn record_bulk_latency(&self, ms: i64);
    fn record_update_success(&self, collection: &str, count: i64);
    fn record_update_error(&self, collection: &str, count: i64);
    fn record_delete_success(&self, collection: &str, count: i64);
    fn record_delete_error(&self, collection: &str, count: i64);
}

/// Prometheus-backed [`MetricsSink`], grounded in the same
/// `metrics`/`metrics_exporter_prometheus` pairing the teacher crate uses.
pub struct PrometheusMetricsSink;

impl PrometheusMetricsSink {
    /// Installs the global Prometheus recorder and starts its HTTP listener.
    pub async fn install(port: u16) -> Result<JoinHandle<()>> {
        info!(port, "installing metrics recorder");

        let addr: SocketAddr = format!("0.0.0.0:{port}")
            .parse()
            .context("invalid metrics bind address")?;

        let builder = PrometheusBuilder::new().with_http_listener(addr);

        let handle = tokio::spawn(async move {
            if let Err(err) = builder.install() {
                tracing::error!(error = %err, "failed to start metrics exporter");
            }
        });

        info!("metrics available at http://0.0.0.0:{port}/metrics");
        Ok(handle)
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn record_process_latency(&self, ms: i64) {
        histogram!("sink_events_process_latency_ms").record(ms as f64);
    }

    fn record_bulk_latency(&self, ms: i64) {
        histogram!("sink_bulk_request_latency_ms").record(ms as f64);
    }

    fn record_update_success(&self, collection: &str, count: i64) {
        if count > 0 {
            counter!("sink_update_operations_total", "collection" => collection.to_string(), "status" => "success")
                .increment(count as u64);
        }
    }

    fn record_update_error(&self, collection: &str, count: i64) {
        if count > 0 {
            counter!("sink_update_operations_total", "collection" => collection.to_string(), "status" => "error")
                .increment(count as u64);
        }
    }

    fn record_delete_success(&self, collection: &str, count: i64) {
        if count > 0 {
            counter!("sink_delete_operations_total", "collection" => collection.to_string(), "status" => "success")
                .increment(count as u64);
        }
    }

    fn record_delete_error(&self, collection: &str, count: i64) {
        if count > 0 {
            counter!("sink_delete_operations_total", "collection" => collection.to_string(), "status" => "error")
                .increment(count as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_does_not_panic_without_an_installed_recorder() {
        let sink = PrometheusMetricsSink;
        sink.record_process_latency(5);
        sink.record_bulk_latency(10);
        sink.record_update_success("orders", 3);
        sink.record_update_error("orders", 0);
        sink.record_delete_success("orders", 1);
        sink.record_delete_error("orders", 1);
    }
}
