use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::inference::InferenceConfigs;
use crate::report::ReportFormat;
use crate::storage::backends::BackendConfigs;

static CONFIG: OnceCell<Arc<RuntimeConfig>> = OnceCell::new();

pub fn config() -> &'static Arc<RuntimeConfig> {
    CONFIG.get().expect("config init")
}

pub async fn init(config_file: &Path) -> anyhow::Result<()> {
    let file = tokio::fs::read(config_file).await?;
    let cfg = if config_file.extension().map(|v| v == "json").unwrap_or(false) {
        let cfg: RuntimeConfig = serde_json::from_slice(&file)?;
        cfg.validate()?;
        cfg
    } else {
        RuntimeConfig::from_yaml(std::str::from_utf8(&file)?)?
    };

    let _ = CONFIG.set(Arc::new(cfg));

    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    /// The ephemeral store backend configuration.
    ///
    /// Defaults to the in-memory backend.
    pub backend: BackendConfigs,

    /// The inference service used to analyse images.
    pub inference: InferenceConfigs,

    /// The known caller categories keyed by category name.
    pub categories: BTreeMap<String, CategoryConfig>,

    #[serde(default = "default_session_ttl")]
    /// How long uploads and job records live for, in seconds.
    ///
    /// Defaults to 15 minutes.
    pub session_ttl_secs: u64,

    #[serde(default = "default_max_encoded_size")]
    /// The largest accepted encoded payload in characters.
    ///
    /// Defaults to `13_600_000` which is roughly 10MB once decoded.
    pub max_encoded_size: usize,

    #[serde(default = "default_purge_interval")]
    /// How often the sweeper runs, in seconds.
    pub purge_interval_secs: u64,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    /// An optional request limiter applied in front of the API.
    pub rate_limit: Option<RateLimitConfig>,
}

impl RuntimeConfig {
    pub fn from_yaml(data: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.session_ttl_secs == 0 {
            return Err(anyhow::anyhow!("session_ttl_secs must be greater than zero"));
        }

        if self.inference.timeout() >= self.session_ttl().to_std()? {
            return Err(anyhow::anyhow!(
                "inference timeout_secs must be less than session_ttl_secs, otherwise a slow analysis outlives its upload"
            ));
        }

        if self.queue.max_concurrency == 0 {
            return Err(anyhow::anyhow!("queue.max_concurrency must be greater than zero"));
        }

        Ok(())
    }

    #[inline]
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }

    #[inline]
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryConfig {
    /// The public domain of the product this category belongs to.
    pub domain: String,

    #[serde(default)]
    /// The environment variable holding this category's API key.
    ///
    /// This is read every time a request is checked so keys can be
    /// rotated without a restart.
    pub api_key_env: Option<String>,

    #[serde(default)]
    /// A literal API key, used when `api_key_env` is unset or empty.
    pub api_key: Option<String>,

    #[serde(default)]
    /// Other names a caller may use to refer to this category.
    /// E.g. a product name like "vehiclevibe".
    pub aliases: Vec<String>,

    #[serde(default = "default_report_prefix")]
    /// The prefix of generated report identifiers.
    pub report_prefix: String,

    #[serde(default)]
    /// The artifact the inference service is asked to produce.
    pub format: ReportFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_size")]
    /// The number of analysis jobs which may wait for a worker.
    pub queue_size: usize,

    #[serde(default = "default_max_concurrency")]
    /// The number of analysis jobs which may run at once.
    pub max_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_requests")]
    /// The number of requests allowed per caller per window.
    pub requests: u32,

    #[serde(default = "default_rate_limit_window")]
    /// The window length in seconds.
    pub window_secs: u64,

    /// The request paths the limiter applies to.
    pub paths: Vec<String>,
}

const fn default_session_ttl() -> u64 {
    15 * 60
}

const fn default_max_encoded_size() -> usize {
    13_600_000
}

const fn default_purge_interval() -> u64 {
    5 * 60
}

const fn default_queue_size() -> usize {
    1000
}

const fn default_max_concurrency() -> usize {
    4
}

const fn default_rate_limit_requests() -> u32 {
    20
}

const fn default_rate_limit_window() -> u64 {
    10 * 60
}

fn default_report_prefix() -> String {
    "UPD8".to_string()
}
