use std::sync::Arc;

use axum::{
    Router,
    routing::{get, head, post},
};

use crate::state::RegistryState;

pub(crate) use middleware::RewriteUriLayer;

mod blobs;
mod content_range;
mod manifests;
mod middleware;
mod root;
mod tags;
mod utils;

/// The distribution API under `/v2/`. Repository names must already be
/// squashed into one path segment by [`RewriteUriLayer`].
pub fn router(state: Arc<RegistryState>) -> Router {
    Router::new()
        .route("/v2/", get(root::get).head(root::get))
        .route(
            "/v2/{repository}/blobs/uploads/{upload_id}",
            get(blobs::uploads::get::get)
                .patch(blobs::uploads::patch::patch)
                .put(blobs::uploads::put::put)
                .delete(blobs::uploads::delete::delete),
        )
        .route(
            "/v2/{repository}/blobs/uploads/",
            post(blobs::uploads::post::post),
        )
        .route(
            "/v2/{repository}/blobs/{digest}",
            head(blobs::head::head).get(blobs::get::get),
        )
        .route(
            "/v2/{repository}/manifests/{reference}",
            head(manifests::head::head)
                .get(manifests::get::get)
                .put(manifests::put::put)
                .delete(manifests::delete::delete),
        )
        .route("/v2/{repository}/tags/list", get(tags::get::get))
        .with_state(state)
}
