use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use tower_http::request_id::RequestId;
use tracing::debug;

use crate::state::RegistryState;

/// Who asked for something, as far as events and logs are concerned.
///
/// Authentication happens in front of the registry; the identity it
/// settled on arrives in a request header and is trusted as is.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub actor: String,
    pub request_id: Option<String>,
    pub method: String,
    pub user_agent: Option<String>,
    pub peer: Option<SocketAddr>,
}

impl RequestContext {
    /// Context for work the registry starts on its own.
    pub fn internal(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            request_id: None,
            method: String::new(),
            user_agent: None,
            peer: None,
        }
    }
}

impl FromRequestParts<Arc<RegistryState>> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<RegistryState>,
    ) -> Result<Self, Self::Rejection> {
        let method = parts.method.to_string().to_uppercase();

        let request_id = parts
            .extensions
            .get::<RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .map(|id| id.to_string());

        let user_agent = parts
            .headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|connect_info| connect_info.0);

        let actor = parts
            .headers
            .get(state.config.identity_header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or("anonymous")
            .to_string();

        debug!(actor, method, "Handling request");

        Ok(RequestContext {
            actor,
            request_id,
            method,
            user_agent,
            peer,
        })
    }
}
