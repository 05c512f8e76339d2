use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::{
    encoding::{EncodeLabelSet, text::encode},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::state::RegistryState;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct OutcomeLabels {
    pub outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct WebhookMetricLabels {
    pub status: String,
    pub url: String,
}

/// Every metric the registry core records.
#[derive(Clone, Debug, Default)]
pub struct RegistryMetrics {
    pub(crate) uploads: Family<OutcomeLabels, Counter>,
    pub(crate) gc_sweeps: Family<OutcomeLabels, Counter>,
    pub(crate) gc_blobs_deleted: Counter,
    pub(crate) gc_bytes_reclaimed: Counter,
    pub(crate) stored_blobs: Gauge,
    pub(crate) stored_bytes: Gauge,
    pub(crate) live_subscribers: Gauge,
    pub(crate) live_events_dropped: Counter,
    pub(crate) webhook_attempts: Family<WebhookMetricLabels, Counter>,
}

impl RegistryMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "uploads",
            "Blob upload sessions by outcome",
            metrics.uploads.clone(),
        );
        registry.register(
            "gc_sweeps",
            "Garbage collection sweeps by outcome",
            metrics.gc_sweeps.clone(),
        );
        registry.register(
            "gc_blobs_deleted",
            "Blobs reclaimed by garbage collection",
            metrics.gc_blobs_deleted.clone(),
        );
        registry.register(
            "gc_bytes_reclaimed",
            "Bytes reclaimed by garbage collection",
            metrics.gc_bytes_reclaimed.clone(),
        );
        registry.register(
            "stored_blobs",
            "Blob objects in the byte store after the last sweep",
            metrics.stored_blobs.clone(),
        );
        registry.register(
            "stored_bytes",
            "Bytes held by blob objects after the last sweep",
            metrics.stored_bytes.clone(),
        );
        registry.register(
            "live_subscribers",
            "Connected live event subscribers",
            metrics.live_subscribers.clone(),
        );
        registry.register(
            "live_events_dropped",
            "Events dropped for slow live subscribers",
            metrics.live_events_dropped.clone(),
        );
        registry.register(
            "webhooks_post",
            "Number of webhooks sent",
            metrics.webhook_attempts.clone(),
        );

        metrics
    }

    pub(crate) fn upload(&self, outcome: &'static str) {
        self.uploads.get_or_create(&OutcomeLabels { outcome }).inc();
    }
}

/// Axum handler that returns Prometheus metrics
async fn metrics_handler(State(registry): State<Arc<RegistryState>>) -> Response {
    let mut buffer = String::new();

    if let Err(err) = encode(&mut buffer, &registry.registry) {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", err),
        )
            .into_response();
    }

    (
        axum::http::StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

pub(crate) fn metrics_router(state: Arc<RegistryState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub(crate) fn start_metrics(
    tasks: &mut JoinSet<anyhow::Result<()>>,
    state: Arc<RegistryState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listen_addr = format!(
        "{}:{}",
        state.config.prometheus.address, state.config.prometheus.port
    );
    let app = metrics_router(state);

    tasks.spawn(async move {
        let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
        info!(address = listen_addr, "Serving metrics");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    });

    Ok(())
}
