use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use tracing::debug;

use crate::{
    context::RequestContext,
    digest::Digest,
    error::RegistryError,
    events::{Action, Target},
    names::validate_repository,
    registry::utils::{byte_stream, upload_headers},
    state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
}

#[derive(Debug, Deserialize)]
pub struct BlobUploadPostQuery {
    mount: Option<String>,
    from: Option<String>,
    digest: Option<String>,
}

/*
201 Created
Location: <blob location>
Content-Length: 0
Docker-Content-Digest: <digest>
*/
fn created(repository: &str, digest: &Digest) -> Result<Response, RegistryError> {
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("Location", format!("/v2/{repository}/blobs/{digest}"))
        .header("Content-Length", "0")
        .header("Docker-Content-Digest", digest.to_string())
        .body(Body::empty())?)
}

pub(crate) async fn post(
    Path(BlobUploadRequest { repository }): Path<BlobUploadRequest>,
    Query(BlobUploadPostQuery {
        mount,
        from,
        digest,
    }): Query<BlobUploadPostQuery>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    body: Body,
) -> Result<Response, RegistryError> {
    validate_repository(&repository)?;

    if let Some(mount) = mount
        && let Ok(mount) = mount.parse::<Digest>()
    {
        if let Some(size) = registry.uploads.mount(&repository, &mount).await? {
            debug!(repository, from = from.as_deref(), %mount, "Mounted blob across repositories");
            registry
                .notifier
                .notify(Action::Push, &context, Target::new(&repository).blob(&mount, size))
                .await;
            return created(&repository, &mount);
        }

        debug!(repository, %mount, "Mount source unknown, starting an upload instead");
    }

    let session = registry.uploads.start(&repository).await?;

    if let Some(digest) = digest {
        let completed = registry
            .uploads
            .complete(&session.id, &repository, &digest, Some(byte_stream(body)))
            .await?;
        registry
            .notifier
            .notify(
                Action::Push,
                &context,
                Target::new(&repository).blob(&completed.digest, completed.size),
            )
            .await;

        return created(&repository, &completed.digest);
    }

    /*
    202 Accepted
    Location: /v2/<name>/blobs/uploads/<uuid>
    Range: bytes=0-<offset>
    Content-Length: 0
    Docker-Upload-UUID: <uuid>
    */
    Ok(
        upload_headers(Response::builder(), &repository, &session.id, session.offset)
            .status(StatusCode::ACCEPTED)
            .body(Body::empty())?,
    )
}
