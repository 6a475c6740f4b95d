use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the frame queue service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Queue tunables
    #[serde(default)]
    pub queue: QueueConfig,
    /// File-backed state location
    #[serde(default)]
    pub state: StateConfig,
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

/// API configuration for the agent/consumer endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Shared secret agents send in `x-agent-key`; unset leaves agent routes open
    #[serde(default)]
    pub agent_key: Option<String>,
}

/// Frame queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum pending frames
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Dedup window when a push does not specify one
    #[serde(default = "default_recent_ttl_ms")]
    pub default_recent_ttl_ms: u64,
    /// Lease length when a claim does not specify one
    #[serde(default = "default_claim_ms")]
    pub default_claim_ms: u64,
    /// Claim batch size when a claim does not specify one
    #[serde(default = "default_claim_limit")]
    pub default_claim_limit: usize,
    /// Consumer name used when neither the body nor the peer address gives one
    #[serde(default = "default_consumer")]
    pub default_consumer: String,
}

/// Location of the active-table and refresh-command documents
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

// Default value functions
fn default_service_name() -> String {
    "frame-queue".to_string()
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

fn default_true() -> bool {
    true
}

fn default_capacity() -> usize {
    200_000
}

fn default_recent_ttl_ms() -> u64 {
    10 * 60 * 1000 // 10 minutes
}

fn default_claim_ms() -> u64 {
    60 * 1000
}

fn default_claim_limit() -> usize {
    100
}

fn default_consumer() -> String {
    "be".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(
                config::File::with_name("config/frame-queue")
                    .required(false)
            )
            .add_source(
                config::File::with_name("/etc/tablespy/frame-queue")
                    .required(false)
            )
            // Override with environment variables
            // FRAME_QUEUE__API__PORT -> api.port
            .add_source(
                config::Environment::with_prefix("FRAME_QUEUE")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;

        // Agents share the key with the rest of the deployment
        if config.api.agent_key.is_none() {
            config.api.agent_key = std::env::var("TABLESPY_AGENT_KEY").ok();
        }
        config.api.agent_key = config.api.agent_key.take().filter(|k| !k.trim().is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Reject values the queue cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue.capacity == 0 {
            anyhow::bail!("queue.capacity must be greater than zero");
        }
        if !(1_000..=3_600_000).contains(&self.queue.default_recent_ttl_ms) {
            anyhow::bail!("queue.default_recent_ttl_ms must be between 1000 and 3600000");
        }
        if !(5_000..=600_000).contains(&self.queue.default_claim_ms) {
            anyhow::bail!("queue.default_claim_ms must be between 5000 and 600000");
        }
        if !(1..=500).contains(&self.queue.default_claim_limit) {
            anyhow::bail!("queue.default_claim_limit must be between 1 and 500");
        }
        Ok(())
    }

    /// Listen address for the API server
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }

    pub fn active_tables_path(&self) -> PathBuf {
        self.state.dir.join("active_tables.json")
    }

    pub fn refresh_command_path(&self) -> PathBuf {
        self.state.dir.join("refresh_command.json")
    }
}

impl QueueConfig {
    /// Get default dedup window as Duration
    pub fn default_recent_ttl(&self) -> Duration {
        Duration::from_millis(self.default_recent_ttl_ms)
    }

    /// Get default lease length as Duration
    pub fn default_lease(&self) -> Duration {
        Duration::from_millis(self.default_claim_ms)
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

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            agent_key: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            default_recent_ttl_ms: default_recent_ttl_ms(),
            default_claim_ms: default_claim_ms(),
            default_claim_limit: default_claim_limit(),
            default_consumer: default_consumer(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}
