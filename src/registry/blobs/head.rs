use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use tracing::debug;

use crate::{
    digest::Digest,
    error::{RegistryError, Unknown},
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct BlobRequest {
    repository: String,
    digest: String,
}

pub(crate) async fn head(
    Path(BlobRequest { repository, digest }): Path<BlobRequest>,
    State(registry): State<Arc<RegistryState>>,
) -> Result<Response, RegistryError> {
    let unknown = || RegistryError::NotFound(Unknown::Blob(digest.clone()));

    let parsed: Digest = digest.parse().map_err(|_| unknown())?;
    let blob = registry.blobs.get(&parsed).await?.ok_or_else(unknown)?;

    debug!(repository, digest, "Blob exists");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Docker-Content-Digest", blob.digest.to_string())
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, blob.size)
        .body(Body::empty())?)
}
