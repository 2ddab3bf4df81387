//! Service configuration: YAML file plus env var overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Known provider presets
const PROVIDER_PRESETS: &[(&str, Option<&str>)] = &[
    ("openai", Some("https://api.openai.com/v1")),
    ("openrouter", Some("https://openrouter.ai/api/v1")),
];

/// Provider-specific API key env vars (checked before OPENAI_API_KEY fallback)
const PROVIDER_KEY_ENV_VARS: &[(&str, &str)] = &[("openrouter", "OPENROUTER_API_KEY")];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// "openai" | "openrouter" | "custom"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Fallback model when no config tier names one
    #[serde(default = "default_model")]
    pub model: String,

    /// API key (set here or via env var)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Base URL for Chat Completions API (auto-set for known providers)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Embedding model name
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Directory holding the shared job-result database
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Pending dedup entries older than this are swept
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_secs: u64,

    /// How long a failed signature is rejected
    #[serde(default = "default_blackout")]
    pub blackout_secs: u64,

    /// Period of the dedup sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Upper bound on waiting for a job result
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_job_poll_interval")]
    pub job_poll_interval_ms: u64,

    /// Bound on a single vector query
    #[serde(default = "default_memory_query_timeout")]
    pub memory_query_timeout_ms: u64,

    /// Backstop TTL for cached effective configs
    #[serde(default = "default_config_cache_ttl")]
    pub config_cache_ttl_secs: u64,

    /// Bulk writes touching more entities than this publish one "all" event
    #[serde(default = "default_invalidate_all_threshold")]
    pub invalidate_all_threshold: usize,

    /// Broadcast buffer per subscriber
    #[serde(default = "default_invalidation_capacity")]
    pub invalidation_capacity: usize,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Delivered job results older than this are cleaned up
    #[serde(default = "default_job_retention")]
    pub job_retention_secs: u64,

    /// Resolved project root (set at load time, not serialized from YAML)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4.1-mini".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_dedup_ttl() -> u64 {
    30
}
fn default_blackout() -> u64 {
    60
}
fn default_sweep_interval() -> u64 {
    10
}
fn default_job_timeout() -> u64 {
    120
}
fn default_job_poll_interval() -> u64 {
    250
}
fn default_memory_query_timeout() -> u64 {
    2000
}
fn default_config_cache_ttl() -> u64 {
    300
}
fn default_invalidate_all_threshold() -> usize {
    25
}
fn default_invalidation_capacity() -> usize {
    256
}
fn default_worker_count() -> usize {
    4
}
fn default_job_retention() -> u64 {
    86_400
}

impl Config {
    /// Load config from a YAML file with env var overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config: {}", config_path.display()))?;

        let mut config: Config =
            serde_yaml::from_str(&content).context("Failed to parse config.yaml")?;

        // Resolve project root from config file location
        let parent = config_path.parent().unwrap_or(Path::new("."));
        config.project_root = parent
            .canonicalize()
            .unwrap_or_else(|_| parent.to_path_buf());

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load config from the default location (project_root/config.yaml)
    pub fn load_from_dir(project_root: &Path) -> Result<Self> {
        Self::load(&project_root.join("config.yaml"))
    }

    fn apply_env(&mut self) {
        if let Ok(p) = std::env::var("CHORUS_PROVIDER") {
            self.provider = p;
        }

        // Base URL: env var > config > provider preset
        if let Ok(url) = std::env::var("CHORUS_BASE_URL") {
            self.base_url = Some(url);
        } else if self.base_url.is_none() {
            self.base_url = PROVIDER_PRESETS
                .iter()
                .find(|(p, _)| *p == self.provider)
                .and_then(|(_, url)| url.map(String::from));
        }

        // API key: provider-specific env var > OPENAI_API_KEY > config
        let provider_key_var = PROVIDER_KEY_ENV_VARS
            .iter()
            .find(|(p, _)| *p == self.provider)
            .map(|(_, var)| *var);
        if let Some(var) = provider_key_var {
            if let Ok(key) = std::env::var(var) {
                self.api_key = Some(key);
            }
        }
        if self.api_key.is_none() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.api_key = Some(key);
            }
        }

        if let Ok(m) = std::env::var("CHORUS_MODEL") {
            self.model = m;
        }
        if let Ok(dir) = std::env::var("CHORUS_DATA_DIR") {
            self.data_dir = Some(dir);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.provider == "custom" && self.base_url.is_none() {
            anyhow::bail!(
                "Provider 'custom' requires base_url in config.yaml or CHORUS_BASE_URL env var"
            );
        }
        let durations = [
            ("dedup_ttl_secs", self.dedup_ttl_secs),
            ("blackout_secs", self.blackout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("job_timeout_secs", self.job_timeout_secs),
            ("job_poll_interval_ms", self.job_poll_interval_ms),
            ("memory_query_timeout_ms", self.memory_query_timeout_ms),
            ("config_cache_ttl_secs", self.config_cache_ttl_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v == 0) {
            anyhow::bail!("{} must be greater than zero", name);
        }
        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than zero");
        }
        if self.invalidation_capacity == 0 {
            anyhow::bail!("invalidation_capacity must be greater than zero");
        }
        Ok(())
    }

    /// Where the job-result database lives.
    pub fn data_path(&self) -> PathBuf {
        match self.data_dir.as_deref().map(Path::new) {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => self.project_root.join(p),
            None => self.project_root.join("data"),
        }
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn blackout(&self) -> Duration {
        Duration::from_secs(self.blackout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }

    pub fn memory_query_timeout(&self) -> Duration {
        Duration::from_millis(self.memory_query_timeout_ms)
    }

    pub fn config_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.config_cache_ttl_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            embedding_model: default_embedding_model(),
            data_dir: None,
            dedup_ttl_secs: default_dedup_ttl(),
            blackout_secs: default_blackout(),
            sweep_interval_secs: default_sweep_interval(),
            job_timeout_secs: default_job_timeout(),
            job_poll_interval_ms: default_job_poll_interval(),
            memory_query_timeout_ms: default_memory_query_timeout(),
            config_cache_ttl_secs: default_config_cache_ttl(),
            invalidate_all_threshold: default_invalidate_all_threshold(),
            invalidation_capacity: default_invalidation_capacity(),
            worker_count: default_worker_count(),
            job_retention_secs: default_job_retention(),
            project_root: PathBuf::new(),
        }
    }
}
