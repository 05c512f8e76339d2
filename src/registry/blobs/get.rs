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
    context::RequestContext,
    digest::Digest,
    error::{RegistryError, Unknown},
    events::{Action, Target},
    state::RegistryState,
};

/*
200 OK
Docker-Content-Digest: <digest>
Content-Type: <media type of blob>

...
*/

#[derive(Debug, Deserialize)]
pub struct BlobRequest {
    repository: String,
    digest: String,
}

pub(crate) async fn get(
    Path(BlobRequest { repository, digest }): Path<BlobRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    let digest: Digest = digest
        .parse()
        .map_err(|_| RegistryError::NotFound(Unknown::Blob(digest.clone())))?;

    let (stream, size) = registry.blobs.open(&digest).await?;

    debug!(repository, %digest, size, "Streaming blob");
    registry
        .notifier
        .notify(
            Action::Pull,
            &context,
            Target::new(&repository).blob(&digest, size),
        )
        .await;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Docker-Content-Digest", digest.to_string())
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(stream))?)
}
