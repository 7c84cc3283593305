use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use dcp_mongodb_sink::config::Config;
use dcp_mongodb_sink::connector::Connector;
use dcp_mongodb_sink::metrics::{MetricsSink, PrometheusMetricsSink};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!(path = %config_path, "loading configuration");
    let config = Config::load(&config_path).context("failed to load configuration")?;

    let metrics_port = config.metrics_port;
    let metrics_handle = PrometheusMetricsSink::install(metrics_port)
        .await
        .context("failed to start metrics exporter")?;
    let metrics: Arc<dyn MetricsSink> = Arc::new(PrometheusMetricsSink);

    let connector = Arc::new(
        Connector::build(config, metrics)
            .await
            .context("failed to build connector")?,
    );

    info!("connector built, starting");
    let run_handle = {
        let connector = connector.clone();
        tokio::spawn(async move {
            if let Err(err) = connector.start().await {
                error!(error = %err, "connector stopped with error");
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = run_handle => {
            if let Err(err) = result {
                error!(error = %err, "connector task panicked");
            }
        }
    }

    info!("shutting down");
    connector.close().await;
    metrics_handle.abort();

    info!("stopped");
    Ok(())
}
