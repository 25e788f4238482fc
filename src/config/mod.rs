use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{FlowError, Result};

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub schedules: ScheduleConfig,

    /// Optional local LLM used for `ai_classification` nodes
    pub ollama: Option<OllamaConfig>,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to the platform data directory
    pub path: Option<PathBuf>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

/// Job lease and polling behaviour shared by every queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a claimed job stays leased without renewal
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,

    /// How often expired leases are checked
    #[serde(default = "default_stalled_interval_secs")]
    pub stalled_interval_secs: u64,

    /// Times a job may stall before it is failed
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_poll_jitter_ms")]
    pub poll_jitter_ms: u64,
}

/// Per-queue worker concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_five")]
    pub thread_sync: usize,
    #[serde(default = "default_two")]
    pub sync_coordinator: usize,
    #[serde(default = "default_three")]
    pub send_email: usize,
    #[serde(default = "default_one")]
    pub subscription_renewal: usize,
    #[serde(default = "default_one")]
    pub scheduled_emails: usize,
    #[serde(default = "default_one")]
    pub maintenance: usize,
    #[serde(default = "default_five")]
    pub workflow_execution: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// TTL of the per-cursor coordinator lock
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// How many new threads are fetched at once during incremental sync
    #[serde(default = "default_five")]
    pub thread_concurrency: usize,

    /// Threads per page during full sync
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_folder")]
    pub default_folder: String,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

/// Repeatable maintenance jobs registered at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_poll_cron")]
    pub poll_cron: String,

    #[serde(default = "default_cleanup_cron")]
    pub cleanup_cron: String,

    #[serde(default = "default_scheduled_emails_cron")]
    pub scheduled_emails_cron: String,

    pub timezone: Option<String>,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_window_hours")]
    pub window_hours: u32,

    /// Renew push subscriptions this long before they expire
    #[serde(default = "default_renewal_margin_secs")]
    pub renewal_margin_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,

    #[serde(default = "default_ollama_model")]
    pub model: String,

    #[serde(default = "default_ollama_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// POST target for `send_notification`; log only when unset
    pub webhook_url: Option<String>,
}

fn default_pool_size() -> u32 {
    8
}

fn default_lock_duration_secs() -> u64 {
    30
}

fn default_stalled_interval_secs() -> u64 {
    30
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_jitter_ms() -> u64 {
    250
}

fn default_one() -> usize {
    1
}

fn default_two() -> usize {
    2
}

fn default_three() -> usize {
    3
}

fn default_five() -> usize {
    5
}

fn default_lock_ttl_secs() -> u64 {
    300
}

fn default_page_size() -> u32 {
    100
}

fn default_folder() -> String {
    crate::types::mail::INBOX.to_string()
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_poll_cron() -> String {
    "*/5 * * * *".to_string()
}

fn default_cleanup_cron() -> String {
    "0 3 * * *".to_string()
}

fn default_scheduled_emails_cron() -> String {
    "* * * * *".to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_batch_size() -> u32 {
    50
}

fn default_window_hours() -> u32 {
    1
}

fn default_renewal_margin_secs() -> u64 {
    3600
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.2".to_string()
}

fn default_ollama_timeout_secs() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: default_pool_size(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_duration_secs: default_lock_duration_secs(),
            stalled_interval_secs: default_stalled_interval_secs(),
            max_stalled_count: default_max_stalled_count(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_jitter_ms: default_poll_jitter_ms(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_sync: default_five(),
            sync_coordinator: default_two(),
            send_email: default_three(),
            subscription_renewal: default_one(),
            scheduled_emails: default_one(),
            maintenance: default_one(),
            workflow_execution: default_five(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            thread_concurrency: default_five(),
            page_size: default_page_size(),
            default_folder: default_folder(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_cron: default_poll_cron(),
            cleanup_cron: default_cleanup_cron(),
            scheduled_emails_cron: default_scheduled_emails_cron(),
            timezone: None,
            retention_days: default_retention_days(),
            batch_size: default_batch_size(),
            window_hours: default_window_hours(),
            renewal_margin_secs: default_renewal_margin_secs(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_ollama_model(),
            timeout_secs: default_ollama_timeout_secs(),
        }
    }
}

impl QueueConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_secs(self.stalled_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SyncConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl AppConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| FlowError::Config(format!("Failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Resolved database path
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(default_database_path)
    }

    fn check(&self) -> Result<()> {
        if let Some(tz) = &self.schedules.timezone {
            tz.parse::<chrono_tz::Tz>()
                .map_err(|_| FlowError::Config(format!("Unknown timezone: {}", tz)))?;
        }
        if self.sync.thread_concurrency == 0 {
            return Err(FlowError::Config(
                "sync.thread_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("mailflow").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".config").join("mailflow").join("config.toml"));
        paths.push(home_dir.join(".mailflow.toml"));
    }

    paths
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailflow")
        .join("mailflow.db")
}

/// Load configuration from the first default path that exists
pub fn load_config() -> Result<AppConfig> {
    info!("Loading configuration from default paths");

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return load_config_from_path(&path);
        }
    }

    info!("No config file found, using defaults");
    Ok(AppConfig::default())
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<AppConfig> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| FlowError::Config(format!("Failed to read config: {}", e)))?;

    AppConfig::from_toml(&content)
}
