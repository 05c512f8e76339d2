use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
};

use crate::{
    error::RegistryError,
    state::RegistryState,
    webhook::{Delivery, DeliveryFilter},
};

pub(crate) async fn get(
    Query(filter): Query<DeliveryFilter>,
    State(registry): State<Arc<RegistryState>>,
) -> Result<Json<Vec<Delivery>>, RegistryError> {
    Ok(Json(registry.webhooks.deliveries(&filter).await?))
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use axum::{body::Body, http::Request, http::StatusCode};
    use http_body_util::BodyExt;
    use regex::Regex;
    use serde_json::Value;
    use test_log::test;

    use crate::{
        config::WebhookConfig,
        events::Action,
        extractor::OCI_MANIFEST,
        tests::{RegistryFixture, StateFixture},
    };

    #[test(tokio::test)]
    pub async fn lists_queued_deliveries() -> Result<()> {
        let state = StateFixture::with_config(|c| {
            c.webhooks = vec![WebhookConfig {
                matcher: Regex::new("^library/").unwrap(),
                url: "http://127.0.0.1:9/hook".into(),
                secret: None,
                events: vec![Action::Push],
            }]
        })
        .await?;
        let fixture = RegistryFixture::with_state(state)?;

        for repository in ["library/alpine", "team/app"] {
            let (body, _) = fixture.image(repository, "img").await?;
            fixture
                .manifests
                .push(
                    repository,
                    "latest",
                    Some(OCI_MANIFEST),
                    body,
                    &fixture.context(),
                )
                .await?;
        }

        let res = fixture
            .request(
                Request::builder()
                    .uri("/api/v1/webhooks/deliveries?status=pending&event=push")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);

        let bytes = res.into_body().collect().await?.to_bytes();
        let value: Value = serde_json::from_slice(&bytes)?;
        let deliveries = value.as_array().expect("a list of deliveries");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0]["repository"], "library/alpine");
        assert_eq!(deliveries[0]["url"], "http://127.0.0.1:9/hook");
        assert_eq!(deliveries[0]["attempts"], 0);

        let res = fixture
            .request(
                Request::builder()
                    .uri("/api/v1/webhooks/deliveries?status=delivered")
                    .body(Body::empty())?,
            )
            .await?;
        let bytes = res.into_body().collect().await?.to_bytes();
        let value: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(value, Value::Array(vec![]));

        fixture.teardown().await
    }
}
