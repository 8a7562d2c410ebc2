use super::{ConfigError, LogFormat, LogLevel};
use crate::reliability::{RetryConfig, RetryStrategy};
use crate::sender::{DEFAULT_INDEX_TEMPLATE, DEFAULT_PUSH_PATH, DEFAULT_TOPOLOGY_INDEX, StoreKind};
use crate::server::ProtocolVersion;
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Address the batch listener binds to
    #[arg(long, env = "RASK_SHIPPER_LISTEN", default_value = "0.0.0.0:5044")]
    pub listen: String,

    /// Protocol versions accepted on the listener
    #[arg(
        long,
        env = "RASK_SHIPPER_PROTOCOLS",
        value_delimiter = ',',
        default_value = "v1,v2"
    )]
    pub protocols: Vec<ProtocolVersion>,

    /// Read deadline inside an open batch, in seconds
    #[arg(long, env = "RASK_SHIPPER_READ_TIMEOUT_SECS", default_value = "30")]
    pub read_timeout_secs: u64,

    /// Keepalive ack interval while a batch is outstanding, in seconds (0 disables)
    #[arg(long, env = "RASK_SHIPPER_KEEPALIVE_SECS", default_value = "3")]
    pub keepalive_secs: u64,

    /// How long a new connection may take to announce its protocol version, in seconds
    #[arg(long, env = "RASK_SHIPPER_SNIFF_TIMEOUT_SECS", default_value = "5")]
    pub sniff_timeout_secs: u64,

    /// Batches that may be outstanding between listener and publishers
    #[arg(long, env = "RASK_SHIPPER_HANDOFF_CAPACITY", default_value = "16")]
    pub handoff_capacity: usize,

    /// Store endpoint URL; `user:password@` is moved into the credentials
    #[arg(long, env = "RASK_SHIPPER_ENDPOINT", default_value = "http://localhost:9200")]
    pub endpoint: String,

    /// Wire format of the store
    #[arg(long, env = "RASK_SHIPPER_STORE", default_value = "elasticsearch")]
    pub store: StoreKind,

    /// Request path for the ndjson store
    #[arg(long, env = "RASK_SHIPPER_PUSH_PATH", default_value = DEFAULT_PUSH_PATH)]
    pub push_path: String,

    #[arg(long, env = "RASK_SHIPPER_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "RASK_SHIPPER_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// `id:key` for ApiKey authentication
    #[arg(long, env = "RASK_SHIPPER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Index name template: `{type}` plus strftime specifiers
    #[arg(long, env = "RASK_SHIPPER_INDEX", default_value = DEFAULT_INDEX_TEMPLATE)]
    pub index_template: String,

    /// gzip level for request bodies (0-9, 0 disables)
    #[arg(long, env = "RASK_SHIPPER_COMPRESSION_LEVEL", default_value = "0")]
    pub compression_level: u32,

    /// Store request timeout in seconds
    #[arg(long, env = "RASK_SHIPPER_REQUEST_TIMEOUT_SECS", default_value = "90")]
    pub request_timeout_secs: u64,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long, env = "RASK_SHIPPER_RECONNECT_INTERVAL_MS", default_value = "1000")]
    pub reconnect_interval_ms: u64,

    /// Concurrent publishers, each with its own store connection
    #[arg(long, env = "RASK_SHIPPER_WORKERS", default_value = "2")]
    pub workers: usize,

    /// Publish attempts per batch before it is abandoned upstream (0 = unlimited)
    #[arg(long, env = "RASK_SHIPPER_RETRY_MAX_ATTEMPTS", default_value = "5")]
    pub retry_max_attempts: u32,

    #[arg(long, env = "RASK_SHIPPER_RETRY_BASE_DELAY_MS", default_value = "500")]
    pub retry_base_delay_ms: u64,

    #[arg(long, env = "RASK_SHIPPER_RETRY_MAX_DELAY_MS", default_value = "60000")]
    pub retry_max_delay_ms: u64,

    #[arg(long, env = "RASK_SHIPPER_RETRY_STRATEGY", default_value = "exponential-backoff")]
    pub retry_strategy: RetryStrategy,

    #[arg(
        long,
        env = "RASK_SHIPPER_RETRY_JITTER",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub retry_jitter: bool,

    /// Publish this shipper's addresses and tag events with upstream shipper names
    #[arg(long, env = "RASK_SHIPPER_TOPOLOGY")]
    pub topology: bool,

    #[arg(long, env = "RASK_SHIPPER_TOPOLOGY_INDEX", default_value = DEFAULT_TOPOLOGY_INDEX)]
    pub topology_index: String,

    /// Topology publish/refresh interval in seconds
    #[arg(long, env = "RASK_SHIPPER_TOPOLOGY_REFRESH_SECS", default_value = "60")]
    pub topology_refresh_secs: u64,

    /// Logical name published in the topology (defaults to the hostname)
    #[arg(long, env = "RASK_SHIPPER_NAME")]
    pub shipper_name: Option<String>,

    #[arg(long, env = "RASK_SHIPPER_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    #[arg(long, env = "RASK_SHIPPER_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// TOML configuration file; replaces command-line and environment settings
    #[arg(long, env = "RASK_SHIPPER_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub read_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub request_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5044".to_string(),
            protocols: ProtocolVersion::ALL.to_vec(),
            read_timeout_secs: 30,
            keepalive_secs: 3,
            sniff_timeout_secs: 5,
            handoff_capacity: 16,
            endpoint: "http://localhost:9200".to_string(),
            store: StoreKind::Elasticsearch,
            push_path: DEFAULT_PUSH_PATH.to_string(),
            username: None,
            password: None,
            api_key: None,
            index_template: DEFAULT_INDEX_TEMPLATE.to_string(),
            compression_level: 0,
            request_timeout_secs: 90,
            reconnect_interval_ms: 1000,
            workers: 2,
            retry_max_attempts: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 60_000,
            retry_strategy: RetryStrategy::ExponentialBackoff,
            retry_jitter: true,
            topology: false,
            topology_index: DEFAULT_TOPOLOGY_INDEX.to_string(),
            topology_refresh_secs: 60,
            shipper_name: None,
            log_level: LogLevel::Info,
            log_format: LogFormat::Json,
            config_file: None,
            read_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(90),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Command line and environment, or the `--config-file` when one is given.
    pub fn load<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::parse_from(args);
        match &config.config_file {
            Some(path) => Self::from_file(path),
            None => config.finish(),
        }
    }

    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Config::parse_from(args).finish()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.config_file = Some(path.as_ref().to_path_buf());
        config.finish()
    }

    fn finish(mut self) -> Result<Self, ConfigError> {
        self.post_process();
        self.validate()?;
        Ok(self)
    }

    pub fn post_process(&mut self) {
        self.read_timeout = Duration::from_secs(self.read_timeout_secs);
        self.request_timeout = Duration::from_secs(self.request_timeout_secs);
        self.retry = RetryConfig {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            strategy: self.retry_strategy,
            jitter: self.retry_jitter,
        };
    }

    /// Configured name, else the hostname, else `"unknown"`.
    pub fn resolve_shipper_name(&self) -> String {
        if let Some(name) = &self.shipper_name {
            return name.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
