use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use tracing::info;

use crate::{context::RequestContext, error::RegistryError, state::RegistryState};

#[derive(Debug, Deserialize)]
pub struct ManifestDeleteRequest {
    repository: String,
    reference: String,
}

pub(crate) async fn delete(
    Path(ManifestDeleteRequest {
        repository,
        reference,
    }): Path<ManifestDeleteRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    let deleted = registry
        .manifests
        .delete(&repository, &reference, &context)
        .await?;

    info!(
        repository,
        reference,
        digest = %deleted.digest,
        removed = deleted.removed,
        "Deleted manifest reference"
    );

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Body::empty())?)
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use axum::http::Request;
    use test_log::test;

    use crate::{digest::Digest, extractor::OCI_MANIFEST, tests::RegistryFixture};

    use super::*;

    #[test(tokio::test)]
    pub async fn delete_by_tag_then_digest() -> Result<()> {
        let fixture = RegistryFixture::new().await?;
        let (body, _) = fixture.image("library/alpine", "alpine").await?;
        let digest = Digest::of(&body);

        for tag in ["latest", "3.20"] {
            fixture
                .manifests
                .push(
                    "library/alpine",
                    tag,
                    Some(OCI_MANIFEST),
                    body.clone(),
                    &fixture.context(),
                )
                .await?;
        }

        let res = fixture
            .request(
                Request::builder()
                    .method("DELETE")
                    .uri("/v2/library/alpine/manifests/latest")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        // Still reachable through the other tag.
        let stored = fixture.manifests.stat("library/alpine", "3.20").await?;
        assert_eq!(stored.digest, digest);

        let res = fixture
            .request(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/v2/library/alpine/manifests/{digest}"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        assert!(
            fixture
                .manifests
                .stat("library/alpine", "3.20")
                .await
                .is_err()
        );

        let res = fixture
            .request(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/v2/library/alpine/manifests/{digest}"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        fixture.teardown().await
    }
}
