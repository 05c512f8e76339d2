use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use sqlx::SqlitePool;
use tokio::{sync::Notify, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    blobs::BlobRepository,
    config::Configuration,
    db,
    events::{EventNotifier, LiveStream},
    garbage::GarbageCollector,
    manifests::ManifestRepository,
    metrics::RegistryMetrics,
    quota::QuotaAccountant,
    storage::{ByteStore, LocalStore},
    uploads::UploadManager,
    webhook::{ConfiguredSubscribers, SubscriberRegistry, WebhookQueue},
};

/// Everything a request handler or background task needs.
#[derive(Debug)]
pub struct RegistryState {
    pub config: Configuration,
    pub pool: SqlitePool,
    pub store: Arc<dyn ByteStore>,
    pub blobs: Arc<BlobRepository>,
    pub uploads: Arc<UploadManager>,
    pub manifests: Arc<ManifestRepository>,
    pub quota: Arc<QuotaAccountant>,
    pub gc: Arc<GarbageCollector>,
    pub notifier: Arc<EventNotifier>,
    pub webhooks: Arc<WebhookQueue>,
    pub metrics: RegistryMetrics,
    pub registry: Registry,
}

impl RegistryState {
    /// Open the configured storage and metadata database.
    pub async fn open(config: Configuration) -> Result<Arc<Self>> {
        let objects = config.objects_dir();
        tokio::fs::create_dir_all(&objects)
            .await
            .with_context(|| format!("Unable to create storage directory {objects:?}"))?;

        let pool = db::connect(&config.database_url()).await?;
        let store: Arc<dyn ByteStore> = Arc::new(LocalStore::new(objects));
        let subscribers: Arc<dyn SubscriberRegistry> =
            Arc::new(ConfiguredSubscribers::new(config.webhooks.clone()));

        Self::with_parts(config, pool, store, subscribers)
    }

    /// Wire the components together over an existing pool and byte store.
    pub fn with_parts(
        config: Configuration,
        pool: SqlitePool,
        store: Arc<dyn ByteStore>,
        subscribers: Arc<dyn SubscriberRegistry>,
    ) -> Result<Arc<Self>> {
        let mut registry = Registry::with_prefix("dockyard");
        let metrics = RegistryMetrics::register(&mut registry);

        let blobs = Arc::new(BlobRepository::new(pool.clone(), store.clone()));
        let quota = Arc::new(QuotaAccountant::new(
            pool.clone(),
            config.quota.default_limit,
        ));

        let webhooks = Arc::new(WebhookQueue::new(
            pool.clone(),
            subscribers,
            config.notifications.clone(),
            metrics.clone(),
        )?);
        let notifier = Arc::new(EventNotifier::new(
            &config.url,
            LiveStream::new(config.notifications.live_buffer, metrics.clone()),
            Some(webhooks.clone()),
        ));

        let uploads = Arc::new(UploadManager::new(
            pool.clone(),
            blobs.clone(),
            quota.clone(),
            metrics.clone(),
            config.uploads.session_timeout,
        ));

        let trigger = Arc::new(Notify::new());
        let manifests = Arc::new(ManifestRepository::new(
            pool.clone(),
            blobs.clone(),
            quota.clone(),
            notifier.clone(),
            trigger.clone(),
            config.manifests.max_size,
        ));
        let gc = Arc::new(GarbageCollector::new(
            pool.clone(),
            blobs.clone(),
            manifests.clone(),
            quota.clone(),
            metrics.clone(),
            config.garbage.clone(),
            config.retention.clone(),
            trigger,
        ));

        Ok(Arc::new(RegistryState {
            config,
            pool,
            store,
            blobs,
            uploads,
            manifests,
            quota,
            gc,
            notifier,
            webhooks,
            metrics,
            registry,
        }))
    }

    /// Start the upload sweeper, the garbage collector and the webhook
    /// workers. They all stop when `shutdown` is cancelled.
    pub fn spawn_background(
        &self,
        tasks: &mut JoinSet<Result<()>>,
        shutdown: &CancellationToken,
    ) {
        self.uploads.clone().spawn_sweeper(
            tasks,
            self.config.uploads.sweep_interval,
            shutdown.clone(),
        );
        self.gc.clone().spawn(tasks, shutdown.clone());
        self.webhooks.clone().spawn_workers(tasks, shutdown.clone());

        info!("Background tasks started");
    }
}
