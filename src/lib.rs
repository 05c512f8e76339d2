use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower::{Layer, ServiceBuilder};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{config::Configuration, registry::RewriteUriLayer, state::RegistryState};

mod api;
pub mod blobs;
pub mod config;
pub mod context;
mod db;
pub mod digest;
pub mod error;
pub mod events;
pub mod extractor;
pub mod garbage;
mod hasher;
pub mod manifests;
mod metrics;
pub mod names;
pub mod quota;
mod registry;
pub mod state;
pub mod storage;
pub mod uploads;
pub mod webhook;


/// The full HTTP surface: the distribution API plus the management API.
///
/// Repository names in `/v2/` paths are squashed into one segment before
/// routing, so the rewrite has to wrap the registry router rather than be
/// one of its layers.
pub fn router(state: Arc<RegistryState>) -> Router {
    let registry = RewriteUriLayer.layer(registry::router(state.clone()));

    Router::new()
        .merge(api::router(state))
        .fallback_service(registry)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

/// Open storage, start the background tasks and serve the registry and its
/// metrics until `shutdown` is cancelled.
pub async fn start(
    config: Configuration,
    tasks: &mut JoinSet<Result<()>>,
    shutdown: CancellationToken,
) -> Result<Arc<RegistryState>> {
    let state = RegistryState::open(config).await?;

    state.spawn_background(tasks, &shutdown);
    metrics::start_metrics(tasks, state.clone(), shutdown.clone())?;

    let listener = TcpListener::bind(&state.config.listen)
        .await
        .with_context(|| format!("Unable to listen on {}", state.config.listen))?;
    info!(address = state.config.listen, "Serving registry");

    let app = router(state.clone());
    tasks.spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
        Ok(())
    });

    Ok(state)
}
