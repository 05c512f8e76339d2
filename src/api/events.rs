use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::state::RegistryState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    repository: Option<String>,
}

/// Follow registry events as server-sent events until the client goes away.
pub(crate) async fn get(
    Query(EventsQuery { repository }): Query<EventsQuery>,
    State(registry): State<Arc<RegistryState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!(?repository, "Live event subscriber connected");

    let rx = registry.notifier.subscribe(repository);
    let stream = ReceiverStream::new(rx).filter_map(|event| async move {
        match SseEvent::default()
            .id(event.id.to_string())
            .event(event.action.as_ref())
            .json_data(&*event)
        {
            Ok(sse) => Some(Ok(sse)),
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "Unable to encode live event");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use anyhow::{Context, Result};
    use axum::{body::Body, http::Request, http::StatusCode};
    use http_body_util::BodyExt;
    use test_log::test;

    use crate::{extractor::OCI_MANIFEST, tests::RegistryFixture};

    #[test(tokio::test)]
    pub async fn streams_matching_events() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(
                Request::builder()
                    .uri("/api/v1/events?repository=library/alpine")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["Content-Type"], "text/event-stream");
        let mut body = res.into_body();

        for repository in ["team/app", "library/alpine"] {
            let (manifest, _) = fixture.image(repository, "img").await?;
            fixture
                .manifests
                .push(
                    repository,
                    "latest",
                    Some(OCI_MANIFEST),
                    manifest,
                    &fixture.context(),
                )
                .await?;
        }

        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await?
            .context("stream ended")??;
        let data = frame.into_data().map_err(|_| anyhow::anyhow!("not data"))?;
        let text = std::str::from_utf8(&data)?;

        assert!(text.contains("event: push\n"), "{text}");
        assert!(text.contains("\"repository\":\"library/alpine\""), "{text}");
        assert!(!text.contains("team/app"), "{text}");

        drop(body);
        fixture.teardown().await
    }
}
