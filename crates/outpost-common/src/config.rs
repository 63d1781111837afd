//! Configuration for Outpost

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "OUTPOST_CONFIG";

/// Prefix for environment overrides, e.g. `OUTPOST__RETRY__MAX_ATTEMPTS=5`
pub const ENV_PREFIX: &str = "OUTPOST";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry and backoff configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Suppression list configuration
    #[serde(default)]
    pub suppression: SuppressionConfig,

    /// Per-domain throttling configuration
    #[serde(default)]
    pub deliverability: DeliverabilityConfig,

    /// Inbound provider webhook configuration
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Outbound provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Periodic maintenance configuration
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Daily sending window, in UTC hours. `start_hour > end_hour` wraps midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum concurrent sends
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Jobs fetched per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Interval between polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on a single provider call
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    /// Claims older than this are considered abandoned
    #[serde(default = "default_processing_lease_secs")]
    pub processing_lease_secs: i64,

    /// Optional daily sending window
    #[serde(default)]
    pub send_window: Option<SendWindow>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            provider_timeout_ms: default_provider_timeout_ms(),
            processing_lease_secs: default_processing_lease_secs(),
            send_window: None,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

fn default_workers() -> usize {
    10
}

fn default_batch_size() -> i64 {
    50
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_processing_lease_secs() -> i64 {
    600
}

/// Retry and backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before a job is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Base delay for exponential backoff
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum backoff before jitter
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Jitter is drawn from `[0, jitter_max_ms)`
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

fn default_max_attempts() -> i32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    300_000
}

fn default_jitter_max_ms() -> u64 {
    1000
}

/// Suppression list configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionConfig {
    /// Lifetime of a soft-bounce entry
    #[serde(default = "default_soft_bounce_ttl_days")]
    pub soft_bounce_ttl_days: i64,
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            soft_bounce_ttl_days: default_soft_bounce_ttl_days(),
        }
    }
}

fn default_soft_bounce_ttl_days() -> i64 {
    7
}

/// Per-domain throttling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverabilityConfig {
    /// Bounce rate at which sends to a domain slow down
    #[serde(default = "default_bounce_threshold")]
    pub bounce_threshold: f64,

    /// Complaint rate at which sends to a domain slow down
    #[serde(default = "default_complaint_threshold")]
    pub complaint_threshold: f64,

    /// Rate at which an operator alert fires
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    /// Unit of throttling delay
    #[serde(default = "default_slowdown_base_ms")]
    pub slowdown_base_ms: u64,

    /// Number of recent latencies kept per domain
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,

    /// Domains idle longer than this are evicted
    #[serde(default = "default_inactivity_eviction_hours")]
    pub inactivity_eviction_hours: i64,

    /// Sends required before rates are evaluated
    #[serde(default = "default_min_sample")]
    pub min_sample: u64,
}

impl Default for DeliverabilityConfig {
    fn default() -> Self {
        Self {
            bounce_threshold: default_bounce_threshold(),
            complaint_threshold: default_complaint_threshold(),
            alert_threshold: default_alert_threshold(),
            slowdown_base_ms: default_slowdown_base_ms(),
            latency_window: default_latency_window(),
            inactivity_eviction_hours: default_inactivity_eviction_hours(),
            min_sample: default_min_sample(),
        }
    }
}

fn default_bounce_threshold() -> f64 {
    0.05
}

fn default_complaint_threshold() -> f64 {
    0.005
}

fn default_alert_threshold() -> f64 {
    0.10
}

fn default_slowdown_base_ms() -> u64 {
    1000
}

fn default_latency_window() -> usize {
    100
}

fn default_inactivity_eviction_hours() -> i64 {
    24
}

fn default_min_sample() -> u64 {
    1
}

/// Inbound provider webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// HMAC signing key shared with the provider
    #[serde(default)]
    pub signing_key: Option<String>,

    /// Maximum age of a signed timestamp
    #[serde(default = "default_replay_window_secs")]
    pub replay_window_secs: i64,

    /// How long a (timestamp, token) pair is remembered
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,

    /// Pause a campaign when one of its recipients complains
    #[serde(default)]
    pub auto_pause_on_complaint: bool,

    /// Upper bound on a single event subscriber
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            signing_key: None,
            replay_window_secs: default_replay_window_secs(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            auto_pause_on_complaint: false,
            handler_timeout_ms: default_handler_timeout_ms(),
        }
    }
}

impl WebhookConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

fn default_replay_window_secs() -> i64 {
    900
}

fn default_dedup_ttl_secs() -> u64 {
    600
}

fn default_handler_timeout_ms() -> u64 {
    5000
}

/// Outbound provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API base URL
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,

    /// API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// Sending domain registered with the provider
    #[serde(default)]
    pub domain: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_key: None,
            domain: String::new(),
        }
    }
}

fn default_provider_base_url() -> String {
    "https://api.mailgun.net/v3".to_string()
}

/// Periodic maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_maintenance_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_maintenance_interval_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file, with environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(crate::Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        Self::build(Some(path.to_path_buf()))
    }

    /// Load configuration from the default locations and the environment
    ///
    /// Every field has a default, so a missing file is not an error.
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(Path::new(&path));
        }

        let candidates = [
            PathBuf::from("./outpost.toml"),
            PathBuf::from("/etc/outpost/outpost.toml"),
        ];
        let file = candidates.into_iter().find(|p| p.exists());

        Self::build(file)
    }

    fn build(file: Option<PathBuf>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            tracing::debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }
}
