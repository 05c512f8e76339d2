use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use crate::{context::RequestContext, error::RegistryError, state::RegistryState};

#[derive(Debug, Deserialize)]
pub struct ManifestGetRequest {
    repository: String,
    reference: String,
}

pub(crate) async fn get(
    Path(ManifestGetRequest {
        repository,
        reference,
    }): Path<ManifestGetRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    let manifest = registry
        .manifests
        .get(&repository, &reference, &context)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Docker-Content-Digest", manifest.digest.to_string())
        .header("Content-Type", manifest.media_type)
        .header("Content-Length", manifest.size)
        .body(Body::from(manifest.body))?)
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use test_log::test;

    use crate::{digest::Digest, events::Action, extractor::OCI_MANIFEST, tests::RegistryFixture};

    use super::*;

    #[test(tokio::test)]
    pub async fn get_manifest() -> Result<()> {
        let fixture = RegistryFixture::new().await?;
        let (body, _) = fixture.image("library/alpine", "alpine").await?;
        let digest = Digest::of(&body);
        fixture
            .manifests
            .push(
                "library/alpine",
                "3.20",
                Some(OCI_MANIFEST),
                body.clone(),
                &fixture.context(),
            )
            .await?;

        let mut events = fixture.notifier.subscribe(Some("library/alpine".into()));

        for reference in ["3.20".to_string(), digest.to_string()] {
            let res = fixture
                .request(
                    Request::builder()
                        .uri(format!("/v2/library/alpine/manifests/{reference}"))
                        .body(Body::empty())?,
                )
                .await?;

            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(res.headers()["Content-Type"], OCI_MANIFEST);
            assert_eq!(res.headers()["Docker-Content-Digest"], digest.to_string());

            let bytes = res.into_body().collect().await?.to_bytes();
            assert_eq!(bytes, body);

            let event = events.recv().await.expect("pull event");
            assert_eq!(event.action, Action::Pull);
        }

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn get_missing_manifest() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(
                Request::builder()
                    .uri("/v2/library/alpine/manifests/latest")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        fixture.teardown().await
    }
}
