//! Relay newline-delimited JSON records read from stdin to a webhook.
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use relay_common::config_source::{ConfigSource, JsonFileConfigSource};
use relay_common::health::HealthRegistry;
use relay_common::metrics::{serve, setup_metrics_routes};
use relay_worker::config::Config;
use relay_worker::error::WorkerError;
use relay_worker::input::feed_records;
use relay_worker::pipeline::Pipeline;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("delivery_worker", config.liveness_deadline.0);
    tracing::info!(
        registry = liveness.name(),
        deadline_ms = config.liveness_deadline.0.as_millis() as u64,
        "registered delivery worker"
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(move || std::future::ready(liveness.get_status())));
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            tracing::error!("failed to serve metrics on {}: {}", bind, error);
        }
    });

    let mut builder = Pipeline::builder(config.record_schema.clone())
        .settings(config.pipeline_settings())
        .client_settings(config.client_settings())
        .liveness(worker_liveness);
    if let Some(path) = &config.config_file {
        let source: Arc<dyn ConfigSource> = Arc::new(JsonFileConfigSource::new(path));
        builder = builder.config_source(source, &config.config_name);
    }
    let pipeline = builder.start().await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let stdin = BufReader::new(tokio::io::stdin());
    let interrupted = tokio::select! {
        _ = &mut ctrl_c => true,
        summary = feed_records(stdin, &config.record_schema, &pipeline) => {
            let summary = summary?;
            tracing::info!(queued = summary.queued, skipped = summary.skipped, "input closed");
            false
        }
    };

    if !interrupted {
        tracing::info!(pending = pipeline.queue_len(), "flushing");
        tokio::select! {
            _ = &mut ctrl_c => {}
            _ = pipeline.flush() => {}
        }
    }

    let undelivered = pipeline.stop().await;
    if !undelivered.is_empty() {
        tracing::warn!(count = undelivered.len(), "exiting with undelivered records");
    }

    Ok(())
}

pub async fn index() -> &'static str {
    "webhook relay"
}
