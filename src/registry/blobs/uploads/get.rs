use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use crate::{error::RegistryError, registry::utils::upload_headers, state::RegistryState};

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
    upload_id: String,
}

pub(crate) async fn get(
    Path(BlobUploadRequest {
        repository,
        upload_id,
    }): Path<BlobUploadRequest>,
    State(registry): State<Arc<RegistryState>>,
) -> Result<Response, RegistryError> {
    let session = registry.uploads.status(&upload_id, &repository).await?;

    Ok(
        upload_headers(Response::builder(), &repository, &upload_id, session.offset)
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())?,
    )
}
