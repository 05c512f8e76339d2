use std::{
    sync::LazyLock,
    task::{Context, Poll},
};

use axum::http::{Request, Response, Uri};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use regex::{Captures, Regex};
use tower::Service;
use tracing::warn;

static REPOSITORY_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(/v2/)(.+)(/(?:manifests/[^/]+|blobs/uploads/[^/]*|blobs/[^/]+|tags/list))$")
        .expect("repository path pattern is valid")
});

/// Percent-encodes the repository part of `/v2/` paths so that names with
/// slashes in them route as a single path segment.
#[derive(Clone)]
pub(crate) struct RewriteUriLayer;

impl<S> tower::Layer<S> for RewriteUriLayer {
    type Service = RewriteUriService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RewriteUriService { inner }
    }
}

#[derive(Clone)]
pub(crate) struct RewriteUriService<S> {
    inner: S,
}

fn rewrite(path: &str) -> String {
    REPOSITORY_PATH
        .replace(path, |caps: &Captures| {
            let prefix = &caps[1];
            let encoded = utf8_percent_encode(&caps[2], NON_ALPHANUMERIC).to_string();
            let suffix = &caps[3];

            format!("{prefix}{encoded}{suffix}")
        })
        .into_owned()
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RewriteUriService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let uri = req.uri();
        let path = rewrite(uri.path());

        if path != uri.path() {
            let rewritten = match uri.query() {
                Some(query) => format!("{path}?{query}"),
                None => path,
            };

            match rewritten.parse::<Uri>() {
                Ok(new_uri) => *req.uri_mut() = new_uri,
                Err(err) => warn!(error = %err, "Unable to rewrite request path"),
            }
        }

        self.inner.call(req)
    }
}
