//! Push, pull and delete events.
//!
//! Every event goes to two independent sinks: the durable webhook queue and
//! the live stream. Neither can fail the request that caused the event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{context::RequestContext, digest::Digest, webhook::WebhookQueue};

pub use live::LiveStream;

mod live;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Push,
    Pull,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Blob targets link to `/blobs/`, everything else to `/manifests/`.
    #[serde(skip)]
    blob: bool,
}

impl Target {
    pub fn new(repository: &str) -> Self {
        Self {
            media_type: None,
            size: None,
            digest: None,
            length: None,
            repository: repository.to_string(),
            url: None,
            tag: None,
            blob: false,
        }
    }

    pub fn blob(mut self, digest: &Digest, size: u64) -> Self {
        self.digest = Some(digest.clone());
        self.media_type = Some(BLOB_MEDIA_TYPE.to_string());
        self.size = Some(size);
        self.length = Some(size);
        self.blob = true;
        self
    }

    pub fn manifest(mut self, digest: &Digest, media_type: &str, size: u64) -> Self {
        self.digest = Some(digest.clone());
        self.media_type = Some(media_type.to_string());
        self.size = Some(size);
        self.length = Some(size);
        self
    }

    pub fn tag(mut self, tag: Option<&str>) -> Self {
        self.tag = tag.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub useragent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub addr: String,
    #[serde(rename = "instanceID")]
    pub instance_id: String,
}

/// One event, shaped like a docker distribution notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub target: Target,
    pub request: RequestRecord,
    pub actor: Actor,
    pub source: Source,
}

/// The body POSTed to webhooks.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub events: Vec<Event>,
}

/// Media type reported for blob targets.
pub const BLOB_MEDIA_TYPE: &str = "application/octet-stream";

pub const ENVELOPE_MEDIA_TYPE: &str = "application/vnd.docker.distribution.events.v2+json";

#[derive(Debug)]
pub struct EventNotifier {
    url: String,
    source: Source,
    live: LiveStream,
    webhooks: Option<Arc<WebhookQueue>>,
}

impl EventNotifier {
    pub fn new(url: &str, live: LiveStream, webhooks: Option<Arc<WebhookQueue>>) -> Self {
        let addr = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            url: url.trim_end_matches('/').to_string(),
            source: Source {
                addr,
                instance_id: Uuid::new_v4().to_string(),
            },
            live,
            webhooks,
        }
    }

    pub fn event(&self, action: Action, context: &RequestContext, mut target: Target) -> Event {
        if let Some(digest) = &target.digest {
            let kind = if target.blob { "blobs" } else { "manifests" };
            target.url = Some(format!(
                "{}/v2/{}/{kind}/{digest}",
                self.url, target.repository
            ));
        }

        Event {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            target,
            request: RequestRecord {
                id: context.request_id.clone(),
                addr: context.peer.map(|peer| peer.to_string()),
                method: context.method.clone(),
                useragent: context.user_agent.clone(),
            },
            actor: Actor {
                name: context.actor.clone(),
            },
            source: self.source.clone(),
        }
    }

    /// Hand an event to both sinks. Failures are logged and go no further.
    pub async fn emit(&self, event: Event) {
        debug!(
            action = %event.action,
            repository = event.target.repository,
            "Emitting event"
        );

        self.live.publish(&event);

        if let Some(webhooks) = &self.webhooks
            && let Err(err) = webhooks.enqueue(&event).await
        {
            error!(event_id = %event.id, error = %err, "Failed to queue webhook deliveries");
        }
    }

    pub async fn notify(&self, action: Action, context: &RequestContext, target: Target) {
        self.emit(self.event(action, context, target)).await;
    }

    pub fn subscribe(&self, repository: Option<String>) -> mpsc::Receiver<Arc<Event>> {
        self.live.subscribe(repository)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RegistryMetrics;

    #[tokio::test]
    async fn events_look_like_docker_notifications() {
        let notifier = EventNotifier::new(
            "https://registry.example/",
            LiveStream::new(4, RegistryMetrics::default()),
            None,
        );
        let context = RequestContext {
            actor: "alice".into(),
            request_id: Some("req-1".into()),
            method: "PUT".into(),
            user_agent: Some("docker/27".into()),
            peer: Some("10.0.0.1:5000".parse().unwrap()),
        };
        let digest = Digest::of(b"{}");

        let event = notifier.event(
            Action::Push,
            &context,
            Target::new("library/alpine")
                .manifest(&digest, "application/vnd.oci.image.manifest.v1+json", 2)
                .tag(Some("latest")),
        );

        let json = serde_json::to_value(Envelope {
            events: vec![event],
        })
        .unwrap();
        let event = &json["events"][0];

        assert_eq!(event["action"], "push");
        assert_eq!(event["target"]["repository"], "library/alpine");
        assert_eq!(event["target"]["tag"], "latest");
        assert_eq!(event["target"]["length"], 2);
        assert_eq!(
            event["target"]["url"],
            format!("https://registry.example/v2/library/alpine/manifests/{digest}")
        );
        assert_eq!(event["request"]["addr"], "10.0.0.1:5000");
        assert_eq!(event["actor"]["name"], "alice");
        assert!(event["source"]["instanceID"].is_string());
    }

    #[tokio::test]
    async fn blob_events_link_to_the_blob() {
        let notifier = EventNotifier::new(
            "https://registry.example",
            LiveStream::new(4, RegistryMetrics::default()),
            None,
        );
        let digest = Digest::of(b"layer");

        let event = notifier.event(
            Action::Pull,
            &RequestContext::internal("test"),
            Target::new("library/alpine").blob(&digest, 5),
        );

        assert_eq!(
            event.target.url.as_deref(),
            Some(format!("https://registry.example/v2/library/alpine/blobs/{digest}").as_str())
        );
        assert_eq!(event.target.media_type.as_deref(), Some(BLOB_MEDIA_TYPE));
        assert_eq!(event.target.length, Some(5));
        assert!(event.target.tag.is_none());
    }

    #[tokio::test]
    async fn emit_reaches_live_subscribers() {
        let notifier = EventNotifier::new(
            "http://localhost",
            LiveStream::new(4, RegistryMetrics::default()),
            None,
        );
        let mut rx = notifier.subscribe(None);

        notifier
            .notify(
                Action::Delete,
                &RequestContext::internal("test"),
                Target::new("alpine").tag(Some("old")),
            )
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, Action::Delete);
        assert_eq!(event.target.tag.as_deref(), Some("old"));
        assert!(event.target.url.is_none());
    }
}
