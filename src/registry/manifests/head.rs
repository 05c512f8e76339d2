use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use crate::{error::RegistryError, state::RegistryState};

#[derive(Debug, Deserialize)]
pub struct ManifestHeadRequest {
    repository: String,
    reference: String,
}

pub(crate) async fn head(
    Path(ManifestHeadRequest {
        repository,
        reference,
    }): Path<ManifestHeadRequest>,
    State(registry): State<Arc<RegistryState>>,
) -> Result<Response, RegistryError> {
    let manifest = registry.manifests.stat(&repository, &reference).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Docker-Content-Digest", manifest.digest.to_string())
        .header("Content-Type", manifest.media_type)
        .header("Content-Length", manifest.size)
        .body(Body::empty())?)
}
