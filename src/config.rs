use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// Smallest accepted per-host ring buffer capacity
pub const MIN_BUFFER_SIZE_PER_HOST: usize = 1;
/// Largest accepted per-host ring buffer capacity
pub const MAX_BUFFER_SIZE_PER_HOST: usize = 65_536;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub origins: HashMap<String, OriginConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of delivery run loops
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Ring buffer capacity for every host, fixed for the lifetime of the cache
    #[serde(default = "default_buffer_size_per_host")]
    pub buffer_size_per_host: usize,

    /// Merge concurrent identical misses into one upstream fetch
    #[serde(default = "default_true")]
    pub coalescing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    pub url: String,

    #[serde(default = "default_origin_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,
}

// Default value functions
fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
        workers: default_workers(),
        request_timeout_secs: default_request_timeout(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_request_timeout() -> u64 {
    30
}

fn default_buffer_size_per_host() -> usize {
    128
}

fn default_true() -> bool {
    true
}

fn default_origin_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            cache: CacheConfig::default(),
            origins: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_size_per_host: default_buffer_size_per_host(),
            coalescing: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CacheError::ConfigError(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> CacheResult<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| CacheError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail once traffic arrives.
    pub fn validate(&self) -> CacheResult<()> {
        self.cache.validate()?;

        if self.server.workers == 0 {
            return Err(CacheError::ConfigError(
                "server.workers must be at least 1".to_string(),
            ));
        }

        for (host, origin) in &self.origins {
            let parsed = url::Url::parse(&origin.url).map_err(|e| {
                CacheError::ConfigError(format!("Invalid url for origin {}: {}", host, e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(CacheError::ConfigError(format!(
                    "Origin {} must use http or https, got {}",
                    host,
                    parsed.scheme()
                )));
            }
        }

        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

impl CacheConfig {
    pub fn validate(&self) -> CacheResult<()> {
        if !(MIN_BUFFER_SIZE_PER_HOST..=MAX_BUFFER_SIZE_PER_HOST)
            .contains(&self.buffer_size_per_host)
        {
            return Err(CacheError::ConfigError(format!(
                "cache.buffer_size_per_host must be between {} and {}, got {}",
                MIN_BUFFER_SIZE_PER_HOST, MAX_BUFFER_SIZE_PER_HOST, self.buffer_size_per_host
            )));
        }
        Ok(())
    }
}

impl OriginConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
