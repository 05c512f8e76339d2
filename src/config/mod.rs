use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
    value::magic::RelativePathBuf,
};
use platform_dirs::AppDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    config::{files::RecursiveFileProvider, lifecycle::RetentionRule},
    events::Action,
};

pub(crate) mod duration;
pub(crate) mod files;
pub(crate) mod lifecycle;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PrometheusConfig {
    pub address: String,
    pub port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9080,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadsConfig {
    /// Sessions idle for longer than this are expired.
    #[serde(with = "crate::config::duration")]
    pub session_timeout: Duration,
    #[serde(with = "crate::config::duration")]
    pub sweep_interval: Duration,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ManifestsConfig {
    pub max_size: u64,
}

impl Default for ManifestsConfig {
    fn default() -> Self {
        Self {
            max_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct QuotaConfig {
    /// Limit given to a project the first time it is seen. Unlimited when
    /// absent.
    pub default_limit: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GarbageConfig {
    pub enabled: bool,
    #[serde(with = "crate::config::duration")]
    pub interval: Duration,
    /// How long a blob must stay unreferenced before it is reclaimed.
    #[serde(with = "crate::config::duration")]
    pub grace_period: Duration,
    pub delete_untagged: bool,
}

impl Default for GarbageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60 * 60),
            grace_period: Duration::from_secs(12 * 60 * 60),
            delete_untagged: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub workers: usize,
    /// Limit on a single delivery attempt.
    #[serde(with = "crate::config::duration")]
    pub timeout: Duration,
    #[serde(with = "crate::config::duration")]
    pub retry_base: Duration,
    #[serde(with = "crate::config::duration")]
    pub max_backoff: Duration,
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration")]
    pub poll_interval: Duration,
    /// Events buffered per live subscriber before events are dropped for it.
    pub live_buffer: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout: Duration::from_secs(5),
            retry_base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(10 * 60),
            max_attempts: 5,
            poll_interval: Duration::from_secs(1),
            live_buffer: 64,
        }
    }
}

fn all_actions() -> Vec<Action> {
    vec![Action::Push, Action::Pull, Action::Delete]
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Matched against the repository name.
    #[serde(with = "serde_regex")]
    pub matcher: Regex,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "all_actions")]
    pub events: Vec<Action>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Configuration {
    /// How clients reach this registry.
    pub url: String,
    pub listen: String,
    pub prometheus: PrometheusConfig,
    #[serde(serialize_with = "RelativePathBuf::serialize_original")]
    pub storage: RelativePathBuf,
    /// Header carrying the identity established by the authenticating proxy.
    pub identity_header: String,
    pub uploads: UploadsConfig,
    pub manifests: ManifestsConfig,
    pub quota: QuotaConfig,
    pub garbage: GarbageConfig,
    pub notifications: NotificationsConfig,
    pub webhooks: Vec<WebhookConfig>,
    pub retention: Vec<RetentionRule>,
}

impl Configuration {
    pub fn figment(configs: Vec<PathBuf>) -> Figment {
        let fig = Figment::from(Serialized::defaults(Configuration::default()));

        let fig = match AppDirs::new(Some("dockyard"), true) {
            Some(dirs) if dirs.config_dir.join("config.yaml").exists() => fig.admerge(
                RecursiveFileProvider::new(Yaml::file(dirs.config_dir.join("config.yaml"))),
            ),
            _ => fig,
        };

        let fig = configs.into_iter().fold(fig, |fig, config_path| {
            fig.admerge(RecursiveFileProvider::new(Yaml::file(config_path)))
        });

        fig.admerge(RecursiveFileProvider::new(
            Env::prefixed("DOCKYARD_").split("__"),
        ))
    }

    pub fn config(figment: Figment) -> Result<Configuration> {
        let config: Configuration = figment.extract().context("Failed to load configuration")?;

        if config.notifications.workers < 1 {
            bail!("notifications.workers must be at least 1");
        }

        if config.notifications.max_attempts < 1 {
            bail!("notifications.max_attempts must be at least 1");
        }

        if config.notifications.live_buffer < 1 {
            bail!("notifications.live_buffer must be at least 1");
        }

        if config.identity_header.parse::<http::HeaderName>().is_err() {
            bail!("identity_header {:?} is not a header name", config.identity_header);
        }

        Ok(config)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.storage.relative().join("objects")
    }

    pub fn database_url(&self) -> String {
        format!(
            "sqlite://{}",
            self.storage.relative().join("dockyard.sqlite").display()
        )
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".into(),
            listen: "0.0.0.0:8080".into(),
            prometheus: PrometheusConfig::default(),
            storage: "var".to_string().into(),
            identity_header: "x-authenticated-user".into(),
            uploads: UploadsConfig::default(),
            manifests: ManifestsConfig::default(),
            quota: QuotaConfig::default(),
            garbage: GarbageConfig::default(),
            notifications: NotificationsConfig::default(),
            webhooks: vec![],
            retention: vec![],
        }
    }
}
