//! Configuration management for Ratewarden.
//!
//! Settings are layered: an optional YAML file first, then environment
//! variables prefixed with `RATEWARDEN__` (for example
//! `RATEWARDEN__LIMITS__IP_LIMIT=20`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use duration_str::deserialize_duration;
use http::HeaderName;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::error::{RatewardenError, Result};
use crate::ratelimit::LimitsConfig;

const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewardenConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limits and cooldown
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Counter store backend
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Request header carrying the client credential
    #[serde(default = "default_credential_header")]
    pub credential_header: String,

    /// Prefer `X-Forwarded-For` / `X-Real-IP` over the peer address
    #[serde(default = "default_trust_forwarded_headers")]
    pub trust_forwarded_headers: bool,

    /// Upper bound on the store calls made for one request
    #[serde(
        default = "default_decision_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub decision_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            credential_header: default_credential_header(),
            trust_forwarded_headers: default_trust_forwarded_headers(),
            decision_timeout: default_decision_timeout(),
        }
    }
}

impl ServerConfig {
    /// The credential header as a validated header name.
    pub fn credential_header_name(&self) -> Result<HeaderName> {
        HeaderName::from_bytes(self.credential_header.as_bytes()).map_err(|e| {
            RatewardenError::Config(format!(
                "invalid credential header {:?}: {}",
                self.credential_header, e
            ))
        })
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_credential_header() -> String {
    "API_KEY".to_string()
}

fn default_trust_forwarded_headers() -> bool {
    true
}

fn default_decision_timeout() -> Duration {
    Duration::from_secs(1)
}

/// Counter store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-process store (default).
    Memory(MemoryStoreConfig),
    /// Shared Redis store.
    Redis(RedisStoreConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(MemoryStoreConfig::default())
    }
}

/// In-memory store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// How often expired entries are swept. `null` disables the sweeper.
    #[serde(
        default = "default_sweep_interval",
        deserialize_with = "deserialize_sweep_interval"
    )]
    pub sweep_interval: Option<Duration>,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

/// Accepts a duration string, or `null` to turn the sweeper off.
fn deserialize_sweep_interval<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => duration_str::parse(raw.trim())
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Redis store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis connection URL (redis:// or rediss://)
    pub url: String,

    /// Prefix for every key written by this service
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for each Redis command
    #[serde(
        default = "default_response_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub response_timeout: Duration,
}

fn default_key_prefix() -> String {
    "ratewarden:".to_string()
}

fn default_response_timeout() -> Duration {
    Duration::from_millis(500)
}

impl RatewardenConfig {
    /// Load configuration from an optional file, overridden by the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).required(true));
        }
        Self::build(builder.add_source(environment()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)))
    }

    fn build(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: RatewardenConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.server.credential_header_name()?;
        ensure_non_zero("server.decision_timeout", self.server.decision_timeout)?;

        match &self.storage {
            StorageConfig::Memory(memory) => {
                if let Some(period) = memory.sweep_interval {
                    ensure_non_zero("storage.sweep_interval", period)?;
                }
            }
            StorageConfig::Redis(redis) => {
                ensure_non_zero("storage.response_timeout", redis.response_timeout)?;
            }
        }

        Ok(())
    }
}

fn ensure_non_zero(field: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(RatewardenError::Config(format!("{field} must be greater than zero")));
    }
    Ok(())
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
