use std::io;

use axum::{body::Body, http::response::Builder};
use futures::TryStreamExt;

use crate::storage::ByteStream;

/// Stream a request body into the byte store without buffering it.
pub(crate) fn byte_stream(body: Body) -> ByteStream {
    Box::pin(body.into_data_stream().map_err(io::Error::other))
}

pub(crate) fn upload_location(repository: &str, upload_id: &str) -> String {
    format!("/v2/{repository}/blobs/uploads/{upload_id}")
}

/// Headers describing where an in-progress upload stands.
pub(crate) fn upload_headers(
    builder: Builder,
    repository: &str,
    upload_id: &str,
    offset: u64,
) -> Builder {
    let range_end = offset.saturating_sub(1);

    builder
        .header("Location", upload_location(repository, upload_id))
        .header("Range", format!("0-{range_end}"))
        .header("Content-Length", "0")
        .header("Blob-Upload-Session-ID", upload_id)
        .header("Docker-Upload-UUID", upload_id)
}
