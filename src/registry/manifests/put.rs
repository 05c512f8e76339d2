use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::Response,
};
use serde::Deserialize;
use tracing::info;

use crate::{
    context::RequestContext,
    error::{ManifestProblem, RegistryError},
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct ManifestPutRequest {
    repository: String,
    reference: String,
}

pub(crate) async fn put(
    Path(ManifestPutRequest {
        repository,
        reference,
    }): Path<ManifestPutRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, RegistryError> {
    let limit = registry.config.manifests.max_size.saturating_add(1);
    let body = to_bytes(body, usize::try_from(limit).unwrap_or(usize::MAX))
        .await
        .map_err(|_| RegistryError::ManifestInvalid(ManifestProblem::TooLarge(limit)))?;

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let pushed = registry
        .manifests
        .push(&repository, &reference, content_type, body, &context)
        .await?;

    info!(
        repository,
        reference,
        digest = %pushed.digest,
        created = pushed.created,
        "Stored manifest"
    );

    /*
    201 Created
    Location: <url>
    Content-Length: 0
    Docker-Content-Digest: <digest>
    */
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(
            "Location",
            format!("/v2/{repository}/manifests/{}", pushed.digest),
        )
        .header("Content-Length", "0")
        .header("Docker-Content-Digest", pushed.digest.to_string())
        .body(Body::empty())?)
}
