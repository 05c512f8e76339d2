//! Management endpoints that sit next to the distribution API.

use std::sync::Arc;

use axum::{Router, routing::get};

use crate::state::RegistryState;

mod deliveries;
mod events;
mod quota;

pub fn router(state: Arc<RegistryState>) -> Router {
    Router::new()
        .route(
            "/api/v1/projects/{project}/quota",
            get(quota::get).put(quota::put),
        )
        .route("/api/v1/webhooks/deliveries", get(deliveries::get))
        .route("/api/v1/events", get(events::get))
        .with_state(state)
}
