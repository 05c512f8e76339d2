//! Durable webhook delivery.
//!
//! Each event becomes one delivery row per interested subscriber. A fixed
//! pool of workers claims due rows, POSTs them, and either marks them
//! delivered or schedules a retry with exponential backoff. After
//! `max_attempts` a delivery is failed for good and only shows up in the
//! delivery history.

use std::{fmt, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use data_encoding::HEXLOWER;
use ring::hmac;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::{sync::Notify, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::{NotificationsConfig, WebhookConfig},
    db::{millis, now_millis, to_u64},
    events::{Action, ENVELOPE_MEDIA_TYPE, Envelope, Event},
    metrics::{RegistryMetrics, WebhookMetricLabels},
};

pub const SIGNATURE_HEADER: &str = "X-Dockyard-Signature";

#[derive(Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub url: String,
    pub secret: Option<String>,
    pub events: Vec<Action>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("url", &self.url)
            .field("events", &self.events)
            .finish()
    }
}

/// Who wants to hear about a repository.
#[async_trait::async_trait]
pub trait SubscriberRegistry: fmt::Debug + Send + Sync {
    async fn list_subscribers(&self, repository: &str) -> Result<Vec<Subscriber>>;
}

/// Subscribers from the `webhooks` configuration section.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredSubscribers {
    webhooks: Vec<WebhookConfig>,
}

impl ConfiguredSubscribers {
    pub fn new(webhooks: Vec<WebhookConfig>) -> Self {
        Self { webhooks }
    }
}

#[async_trait::async_trait]
impl SubscriberRegistry for ConfiguredSubscribers {
    async fn list_subscribers(&self, repository: &str) -> Result<Vec<Subscriber>> {
        Ok(self
            .webhooks
            .iter()
            .filter(|webhook| webhook.matcher.is_match(repository))
            .map(|webhook| Subscriber {
                url: webhook.url.clone(),
                secret: webhook.secret.clone(),
                events: webhook.events.clone(),
            })
            .collect())
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    /// Wait before the next attempt; absent after the last one.
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub id: String,
    pub event_id: String,
    pub action: Action,
    pub repository: String,
    pub url: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<Attempt>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveryFilter {
    pub status: Option<DeliveryStatus>,
    pub event: Option<Action>,
    pub repository: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: String,
    event_id: String,
    action: String,
    repository: String,
    url: String,
    status: String,
    attempts: i64,
    next_attempt_at: i64,
    last_status: Option<i64>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    attempt: i64,
    started_at: i64,
    duration_ms: i64,
    status_code: Option<i64>,
    error: Option<String>,
    backoff_ms: Option<i64>,
}

/// A delivery a worker holds the lease on.
#[derive(Debug, sqlx::FromRow)]
struct Claimed {
    id: String,
    url: String,
    payload: String,
    signature: Option<String>,
    attempts: i64,
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub fn sign(secret: &str, payload: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    format!("sha256={}", HEXLOWER.encode(hmac::sign(&key, payload).as_ref()))
}

/// Delay after the `attempt`th failed attempt.
pub fn backoff(config: &NotificationsConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    config
        .retry_base
        .saturating_mul(1u32 << exponent)
        .min(config.max_backoff)
}

#[derive(Debug)]
pub struct WebhookQueue {
    pool: SqlitePool,
    subscribers: Arc<dyn SubscriberRegistry>,
    client: reqwest::Client,
    config: NotificationsConfig,
    metrics: RegistryMetrics,
    wake: Notify,
}

impl WebhookQueue {
    pub fn new(
        pool: SqlitePool,
        subscribers: Arc<dyn SubscriberRegistry>,
        config: NotificationsConfig,
        metrics: RegistryMetrics,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dockyard/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            pool,
            subscribers,
            client,
            config,
            metrics,
            wake: Notify::new(),
        })
    }

    /// Record one delivery per subscriber interested in this event.
    pub async fn enqueue(&self, event: &Event) -> Result<usize> {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .list_subscribers(&event.target.repository)
            .await?
            .into_iter()
            .filter(|subscriber| subscriber.events.contains(&event.action))
            .collect();

        if subscribers.is_empty() {
            return Ok(0);
        }

        let payload = serde_json::to_string(&Envelope {
            events: vec![event.clone()],
        })?;
        let now = now_millis();

        let mut tx = self.pool.begin().await?;
        for subscriber in &subscribers {
            let signature = subscriber
                .secret
                .as_deref()
                .map(|secret| sign(secret, payload.as_bytes()));

            sqlx::query(
                "INSERT INTO webhook_deliveries
                (id, event_id, action, repository, url, payload, signature, status, attempts, next_attempt_at, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9, ?9)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(event.id.to_string())
            .bind(event.action.as_ref())
            .bind(&event.target.repository)
            .bind(&subscriber.url)
            .bind(&payload)
            .bind(signature)
            .bind(DeliveryStatus::Pending.as_ref())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        for _ in &subscribers {
            self.wake.notify_one();
        }

        debug!(event_id = %event.id, deliveries = subscribers.len(), "Queued webhook deliveries");
        Ok(subscribers.len())
    }

    /// Take the lease on the next due delivery. A lease outlives a single
    /// attempt, so a delivery whose worker died is picked up again once its
    /// lease runs out.
    async fn claim(&self, now: i64) -> Result<Option<Claimed>> {
        let lease = now + millis(self.config.timeout) * 2 + 1000;

        let claimed = sqlx::query_as(
            "UPDATE webhook_deliveries
            SET status = 'in_flight', lease_expires_at = ?1, updated_at = ?2
            WHERE id = (
                SELECT id FROM webhook_deliveries
                WHERE (status = 'pending' AND next_attempt_at <= ?2)
                OR (status = 'in_flight' AND lease_expires_at <= ?2)
                ORDER BY next_attempt_at
                LIMIT 1
            )
            RETURNING id, url, payload, signature, attempts",
        )
        .bind(lease)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed)
    }

    /// Claim and attempt one due delivery. Returns false when nothing was due.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(claimed) = self.claim(now.timestamp_millis()).await? else {
            return Ok(false);
        };

        self.attempt(claimed, now).await?;
        Ok(true)
    }

    async fn attempt(&self, claimed: Claimed, now: DateTime<Utc>) -> Result<()> {
        let attempt = u32::try_from(claimed.attempts).unwrap_or(0) + 1;
        let started = Instant::now();

        let mut request = self
            .client
            .post(&claimed.url)
            .header(reqwest::header::CONTENT_TYPE, ENVELOPE_MEDIA_TYPE)
            .timeout(self.config.timeout)
            .body(claimed.payload.clone());
        if let Some(signature) = &claimed.signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let (status_code, failure) = match request.send().await {
            Ok(response) if response.status().is_success() => {
                (Some(response.status().as_u16()), None)
            }
            Ok(response) => (
                Some(response.status().as_u16()),
                Some(format!("subscriber answered {}", response.status())),
            ),
            Err(err) if err.is_timeout() => (None, Some("attempt timed out".to_string())),
            Err(err) => (None, Some(err.to_string())),
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        self.metrics
            .webhook_attempts
            .get_or_create(&WebhookMetricLabels {
                status: status_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "000".to_string()),
                url: claimed.url.clone(),
            })
            .inc();

        let finished = now.timestamp_millis() + duration_ms;
        let (status, retry_in) = match &failure {
            None => (DeliveryStatus::Delivered, None),
            Some(_) if attempt >= self.config.max_attempts => (DeliveryStatus::Failed, None),
            Some(_) => (
                DeliveryStatus::Pending,
                Some(millis(backoff(&self.config, attempt))),
            ),
        };

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE webhook_deliveries
            SET status = ?1, attempts = ?2, next_attempt_at = ?3, lease_expires_at = NULL,
                last_status = ?4, last_error = ?5, updated_at = ?6
            WHERE id = ?7 AND status = 'in_flight' AND attempts = ?8",
        )
        .bind(status.as_ref())
        .bind(i64::from(attempt))
        .bind(finished + retry_in.unwrap_or(0))
        .bind(status_code.map(i64::from))
        .bind(&failure)
        .bind(finished)
        .bind(&claimed.id)
        .bind(claimed.attempts)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            // Our lease ran out and another worker took over.
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO webhook_attempts (delivery_id, attempt, started_at, duration_ms, status_code, error, backoff_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&claimed.id)
        .bind(i64::from(attempt))
        .bind(now.timestamp_millis())
        .bind(duration_ms)
        .bind(status_code.map(i64::from))
        .bind(&failure)
        .bind(retry_in)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        match status {
            DeliveryStatus::Delivered => {
                debug!(delivery = claimed.id, url = claimed.url, attempt, "Delivered webhook");
            }
            DeliveryStatus::Failed => {
                error!(
                    delivery = claimed.id,
                    url = claimed.url,
                    attempt,
                    error = failure,
                    "Giving up on webhook delivery"
                );
            }
            _ => {
                warn!(
                    delivery = claimed.id,
                    url = claimed.url,
                    attempt,
                    retry_in_ms = retry_in,
                    error = failure,
                    "Webhook delivery failed, will retry"
                );
            }
        }

        Ok(())
    }

    pub fn spawn_workers(
        self: Arc<Self>,
        tasks: &mut JoinSet<anyhow::Result<()>>,
        shutdown: CancellationToken,
    ) {
        for worker in 0..self.config.workers {
            let queue = self.clone();
            let shutdown = shutdown.clone();

            tasks.spawn(async move {
                debug!(worker, "Webhook worker started");

                loop {
                    let worked = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = queue.run_once(Utc::now()) => match result {
                            Ok(worked) => worked,
                            Err(err) => {
                                error!(worker, error = %err, "Webhook worker failed to run a delivery");
                                false
                            }
                        },
                    };

                    if !worked {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = queue.wake.notified() => {}
                            _ = tokio::time::sleep(queue.config.poll_interval) => {}
                        }
                    }
                }

                debug!(worker, "Webhook worker stopped");
                Ok(())
            });
        }

        info!(workers = self.config.workers, "Started webhook workers");
    }

    /// The delivery history, newest first.
    pub async fn deliveries(&self, filter: &DeliveryFilter) -> Result<Vec<Delivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            "SELECT id, event_id, action, repository, url, status, attempts, next_attempt_at,
                last_status, last_error, created_at, updated_at
            FROM webhook_deliveries
            WHERE (?1 IS NULL OR status = ?1)
            AND (?2 IS NULL OR action = ?2)
            AND (?3 IS NULL OR repository = ?3)
            ORDER BY created_at DESC, id
            LIMIT ?4",
        )
        .bind(filter.status.map(|status| status.to_string()))
        .bind(filter.event.map(|action| action.to_string()))
        .bind(&filter.repository)
        .bind(i64::from(filter.limit.unwrap_or(100).min(1000)))
        .fetch_all(&self.pool)
        .await?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            let history: Vec<AttemptRow> = sqlx::query_as(
                "SELECT attempt, started_at, duration_ms, status_code, error, backoff_ms
                FROM webhook_attempts WHERE delivery_id = ? ORDER BY attempt",
            )
            .bind(&row.id)
            .fetch_all(&self.pool)
            .await?;

            let status: DeliveryStatus = row.status.parse()?;
            deliveries.push(Delivery {
                action: row.action.parse()?,
                next_attempt_at: (status == DeliveryStatus::Pending)
                    .then(|| timestamp(row.next_attempt_at)),
                status,
                attempts: u32::try_from(row.attempts).unwrap_or(0),
                last_status: row.last_status.and_then(|code| u16::try_from(code).ok()),
                last_error: row.last_error,
                created_at: timestamp(row.created_at),
                updated_at: timestamp(row.updated_at),
                history: history
                    .into_iter()
                    .map(|attempt| Attempt {
                        attempt: u32::try_from(attempt.attempt).unwrap_or(0),
                        started_at: timestamp(attempt.started_at),
                        duration_ms: to_u64(attempt.duration_ms),
                        status_code: attempt.status_code.and_then(|c| u16::try_from(c).ok()),
                        error: attempt.error,
                        backoff_ms: attempt.backoff_ms.map(to_u64),
                    })
                    .collect(),
                id: row.id,
                event_id: row.event_id,
                repository: row.repository,
                url: row.url,
            });
        }

        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use regex::Regex;
    use test_log::test;
    use tokio::time::timeout;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers::*};

    use super::*;
    use crate::{
        context::RequestContext,
        db,
        events::{EventNotifier, LiveStream, Target},
    };

    fn config() -> NotificationsConfig {
        NotificationsConfig {
            workers: 2,
            timeout: Duration::from_secs(2),
            retry_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: 3,
            poll_interval: Duration::from_millis(10),
            live_buffer: 4,
        }
    }

    fn webhook(url: String, secret: Option<&str>, events: Vec<Action>) -> WebhookConfig {
        WebhookConfig {
            matcher: Regex::new("^library/").unwrap(),
            url,
            secret: secret.map(str::to_string),
            events,
        }
    }

    async fn queue(webhooks: Vec<WebhookConfig>) -> WebhookQueue {
        WebhookQueue::new(
            db::memory().await.unwrap(),
            Arc::new(ConfiguredSubscribers::new(webhooks)),
            config(),
            RegistryMetrics::default(),
        )
        .unwrap()
    }

    fn event(repository: &str, action: Action) -> Event {
        EventNotifier::new("http://localhost", LiveStream::new(1, Default::default()), None)
            .event(
                action,
                &RequestContext::internal("tester"),
                Target::new(repository).tag(Some("latest")),
            )
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let config = config();
        let delays: Vec<u64> = (1..=8)
            .map(|attempt| backoff(&config, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn signatures_are_hmac_sha256() {
        // RFC 4231 test case 2
        assert_eq!(
            sign("Jefe", b"what do ya want for nothing?"),
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test(tokio::test)]
    async fn enqueue_respects_matchers_and_events() -> Result<()> {
        let queue = queue(vec![
            webhook("http://a/hook".into(), None, vec![Action::Push]),
            webhook("http://b/hook".into(), None, vec![Action::Push, Action::Pull]),
        ])
        .await;

        assert_eq!(queue.enqueue(&event("library/alpine", Action::Push)).await?, 2);
        assert_eq!(queue.enqueue(&event("library/alpine", Action::Pull)).await?, 1);
        assert_eq!(queue.enqueue(&event("other/alpine", Action::Push)).await?, 0);

        let pending = queue
            .deliveries(&DeliveryFilter {
                event: Some(Action::Push),
                ..Default::default()
            })
            .await?;
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|d| d.status == DeliveryStatus::Pending));

        Ok(())
    }

    #[test(tokio::test)]
    async fn delivers_signed_envelope() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", ENVELOPE_MEDIA_TYPE))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let queue = queue(vec![webhook(
            format!("{}/hook", server.uri()),
            Some("topsecret"),
            vec![Action::Push],
        )])
        .await;
        queue.enqueue(&event("library/alpine", Action::Push)).await?;

        assert!(queue.run_once(Utc::now()).await?);
        assert!(!queue.run_once(Utc::now()).await?);

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str()?;
        assert_eq!(signature, sign("topsecret", &request.body));
        let envelope: serde_json::Value = serde_json::from_slice(&request.body)?;
        assert_eq!(envelope["events"][0]["target"]["repository"], "library/alpine");

        let deliveries = queue.deliveries(&DeliveryFilter::default()).await?;
        assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);
        assert_eq!(deliveries[0].attempts, 1);
        assert_eq!(deliveries[0].last_status, Some(200));

        Ok(())
    }

    #[test(tokio::test)]
    async fn failing_subscriber_backs_off_then_gives_up() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let queue = queue(vec![webhook(
            format!("{}/hook", server.uri()),
            None,
            vec![Action::Push],
        )])
        .await;
        queue.enqueue(&event("library/alpine", Action::Push)).await?;

        let mut now = Utc::now();
        for _ in 0..3 {
            assert!(queue.run_once(now).await?);
            // Not due again until the backoff has passed.
            assert!(!queue.run_once(now).await?);
            now += chrono::Duration::minutes(5);
        }
        assert!(!queue.run_once(now + chrono::Duration::days(1)).await?);

        let deliveries = queue
            .deliveries(&DeliveryFilter {
                status: Some(DeliveryStatus::Failed),
                ..Default::default()
            })
            .await?;
        assert_eq!(deliveries.len(), 1);

        let delivery = &deliveries[0];
        assert_eq!(delivery.attempts, 3);
        assert_eq!(delivery.last_status, Some(500));
        assert!(delivery.next_attempt_at.is_none());

        let backoffs: Vec<Option<u64>> = delivery.history.iter().map(|a| a.backoff_ms).collect();
        assert_eq!(backoffs, vec![Some(1000), Some(2000), None]);
        assert!(
            delivery
                .history
                .iter()
                .all(|attempt| attempt.status_code == Some(500))
        );

        Ok(())
    }

    #[test(tokio::test)]
    async fn unreachable_subscriber_is_retried() -> Result<()> {
        // Nothing listens on the discard port.
        let queue = queue(vec![webhook(
            "http://127.0.0.1:9/hook".into(),
            None,
            vec![Action::Delete],
        )])
        .await;
        queue.enqueue(&event("library/alpine", Action::Delete)).await?;

        assert!(queue.run_once(Utc::now()).await?);

        let deliveries = queue.deliveries(&DeliveryFilter::default()).await?;
        assert_eq!(deliveries[0].status, DeliveryStatus::Pending);
        assert_eq!(deliveries[0].last_status, None);
        assert!(deliveries[0].last_error.is_some());

        Ok(())
    }

    #[test(tokio::test)]
    async fn workers_drain_the_queue() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(5)
            .mount(&server)
            .await;

        let queue = Arc::new(
            queue(vec![webhook(
                format!("{}/hook", server.uri()),
                None,
                vec![Action::Push],
            )])
            .await,
        );

        let mut tasks = JoinSet::new();
        let shutdown = CancellationToken::new();
        queue.clone().spawn_workers(&mut tasks, shutdown.clone());

        for _ in 0..5 {
            queue.enqueue(&event("library/alpine", Action::Push)).await?;
        }

        timeout(Duration::from_secs(10), async {
            loop {
                let delivered = queue
                    .deliveries(&DeliveryFilter {
                        status: Some(DeliveryStatus::Delivered),
                        ..Default::default()
                    })
                    .await
                    .unwrap();
                if delivered.len() == 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await?;

        shutdown.cancel();
        while let Some(result) = tasks.join_next().await {
            result??;
        }

        Ok(())
    }
}
