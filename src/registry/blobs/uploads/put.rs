use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
};
use axum_extra::TypedHeader;
use serde::Deserialize;

use crate::{
    context::RequestContext,
    error::RegistryError,
    events::{Action, Target},
    registry::{content_range::ContentRange, utils::byte_stream},
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
    upload_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BlobUploadPutQuery {
    #[serde(default)]
    digest: String,
}

pub(crate) async fn put(
    Path(BlobUploadRequest {
        repository,
        upload_id,
    }): Path<BlobUploadRequest>,
    Query(BlobUploadPutQuery { digest }): Query<BlobUploadPutQuery>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    content_range: Option<TypedHeader<ContentRange>>,
    body: Body,
) -> Result<Response, RegistryError> {
    let tail = match content_range {
        Some(TypedHeader(range)) => {
            registry
                .uploads
                .append(
                    &upload_id,
                    &repository,
                    Some(range.first_byte),
                    Some(range.len()),
                    byte_stream(body),
                )
                .await?;
            None
        }
        None => Some(byte_stream(body)),
    };

    let completed = registry
        .uploads
        .complete(&upload_id, &repository, &digest, tail)
        .await?;

    registry
        .notifier
        .notify(
            Action::Push,
            &context,
            Target::new(&repository).blob(&completed.digest, completed.size),
        )
        .await;

    created(&repository, &completed.digest.to_string())
}

/*
201 Created
Location: /v2/<name>/blobs/<digest>
Content-Length: 0
Docker-Content-Digest: <digest>
*/
fn created(repository: &str, digest: &str) -> Result<Response, RegistryError> {
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("Location", format!("/v2/{repository}/blobs/{digest}"))
        .header("Content-Length", "0")
        .header("Docker-Content-Digest", digest)
        .body(Body::empty())?)
}
