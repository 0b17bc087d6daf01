use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the batch gate service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Notification API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Blob storage configuration
    #[serde(default)]
    pub blob: BlobConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Batch completion and relocation configuration
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP listener for inbound blob-created notifications
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Batch completion and relocation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// File types required before a batch is considered complete
    #[serde(default = "default_expected_file_types")]
    pub expected_file_types: Vec<String>,
    /// Take a short exclusive lease on each source blob before moving it
    #[serde(default = "default_true")]
    pub lease_enabled: bool,
    /// Lease duration in seconds
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Initial copy-status poll interval in milliseconds (doubles per poll)
    #[serde(default = "default_copy_poll_initial_ms")]
    pub copy_poll_initial_ms: u64,
    /// Maximum total wait for one copy to complete, in seconds
    #[serde(default = "default_copy_wait_max_secs")]
    pub copy_wait_max_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "batchgate".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_expected_file_types() -> Vec<String> {
    crate::expected::DEFAULT_EXPECTED_FILE_TYPES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_lease_secs() -> u64 {
    60
}

fn default_copy_poll_initial_ms() -> u64 {
    250
}

fn default_copy_wait_max_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "batchgate")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/batchgate").required(false))
            .add_source(config::File::with_name("/etc/batchgate/batchgate").required(false))
            // Override with environment variables
            // BATCHGATE__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("BATCHGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.database.idle_timeout_secs)
    }

    /// Get blob lease duration as Duration
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.batch.lease_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            expected_file_types: default_expected_file_types(),
            lease_enabled: true,
            lease_secs: default_lease_secs(),
            copy_poll_initial_ms: default_copy_poll_initial_ms(),
            copy_wait_max_secs: default_copy_wait_max_secs(),
        }
    }
}
