use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use crate::{error::RegistryError, state::RegistryState};

#[derive(Debug, Deserialize)]
pub struct TagList {
    repository: String,
}

#[derive(Debug, Deserialize)]
pub struct TagQuery {
    last: Option<String>,
    n: Option<usize>,
}

pub(crate) async fn get(
    Path(TagList { repository }): Path<TagList>,
    Query(TagQuery { last, n }): Query<TagQuery>,
    State(registry): State<Arc<RegistryState>>,
) -> Result<Response, RegistryError> {
    // One extra row tells us whether there is another page.
    let mut tags = registry
        .manifests
        .list_tags(&repository, last.as_deref(), n.map(|n| n.saturating_add(1)))
        .await?;

    let more = match n {
        Some(n) if tags.len() > n => {
            tags.truncate(n);
            true
        }
        _ => false,
    };

    let body = json!(
        {
            "name": repository,
            "tags": tags,
        }
    )
    .to_string();

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json");

    let builder = match (more, tags.last(), n) {
        (true, Some(tag), Some(n)) => builder.header(
            "Link",
            format!("</v2/{repository}/tags/list?last={tag}&n={n}>; rel=\"next\""),
        ),
        _ => builder,
    };

    Ok(builder.body(Body::from(body))?)
}
