use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use axum_extra::TypedHeader;
use serde::Deserialize;

use crate::{
    error::RegistryError,
    registry::{
        content_range::ContentRange,
        utils::{byte_stream, upload_headers},
    },
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
    upload_id: String,
}

pub(crate) async fn patch(
    Path(BlobUploadRequest {
        repository,
        upload_id,
    }): Path<BlobUploadRequest>,
    State(registry): State<Arc<RegistryState>>,
    content_range: Option<TypedHeader<ContentRange>>,
    body: Body,
) -> Result<Response, RegistryError> {
    let (start, length) = match content_range {
        Some(TypedHeader(range)) => (Some(range.first_byte), Some(range.len())),
        None => (None, None),
    };

    let session = registry
        .uploads
        .append(&upload_id, &repository, start, length, byte_stream(body))
        .await?;

    /*
    202 Accepted
    Location: /v2/<name>/blobs/uploads/<uuid>
    Range: 0-<offset>
    Content-Length: 0
    Docker-Upload-UUID: <uuid>
    */

    Ok(
        upload_headers(Response::builder(), &repository, &upload_id, session.offset)
            .status(StatusCode::ACCEPTED)
            .body(Body::empty())?,
    )
}
