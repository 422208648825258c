//! Limit configuration and effective-limit resolution.
//!
//! [`LimitsConfig`] is the serde shape read from configuration files and the
//! environment. It is turned into an immutable [`LimitPolicy`] once at
//! startup, and the policy is what the rate limiter consults per request.

use std::collections::HashMap;
use std::time::Duration;

use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How a credential without an override entry is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownCredentialPolicy {
    /// Count it against the default credential limit.
    #[default]
    Fallback,
    /// Deny it outright without counting.
    Deny,
}

/// A per-credential limit override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialLimit {
    /// The credential value as presented by clients
    pub token: String,
    /// Requests per second allowed for this credential
    pub limit: u64,
}

/// Limit settings as they appear in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests per second allowed per source address
    #[serde(default = "default_ip_limit")]
    pub ip_limit: u64,

    /// Requests per second allowed per credential without an override
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,

    /// How long an identity stays blocked after exceeding its limit
    #[serde(
        default = "default_block_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub block_duration: Duration,

    /// Per-credential overrides
    #[serde(default)]
    pub credentials: Vec<CredentialLimit>,

    /// Treatment of credentials with no override
    #[serde(default)]
    pub unknown_credential: UnknownCredentialPolicy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ip_limit: default_ip_limit(),
            token_limit: default_token_limit(),
            block_duration: default_block_duration(),
            credentials: Vec::new(),
            unknown_credential: UnknownCredentialPolicy::default(),
        }
    }
}

fn default_ip_limit() -> u64 {
    10
}

fn default_token_limit() -> u64 {
    100
}

fn default_block_duration() -> Duration {
    Duration::from_secs(300)
}

/// Immutable limits applied by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitPolicy {
    ip_limit: u64,
    token_limit: u64,
    block_duration: Duration,
    token_limits: HashMap<String, u64>,
    unknown_credential: UnknownCredentialPolicy,
}

impl LimitPolicy {
    /// Create a policy with no credential overrides and the fallback
    /// treatment for unknown credentials.
    pub fn new(ip_limit: u64, token_limit: u64, block_duration: Duration) -> Self {
        Self {
            ip_limit,
            token_limit,
            block_duration,
            token_limits: HashMap::new(),
            unknown_credential: UnknownCredentialPolicy::default(),
        }
    }

    /// Add or replace the override for `token`.
    pub fn with_credential(mut self, token: impl Into<String>, limit: u64) -> Self {
        self.token_limits.insert(token.into(), limit);
        self
    }

    pub fn with_unknown_credential(mut self, policy: UnknownCredentialPolicy) -> Self {
        self.unknown_credential = policy;
        self
    }

    pub fn ip_limit(&self) -> u64 {
        self.ip_limit
    }

    pub fn token_limit(&self) -> u64 {
        self.token_limit
    }

    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    pub fn unknown_credential(&self) -> UnknownCredentialPolicy {
        self.unknown_credential
    }

    /// Whether `credential` has an override entry.
    pub fn is_registered(&self, credential: &str) -> bool {
        self.token_limits.contains_key(credential)
    }

    /// The effective limit for `credential`.
    ///
    /// Returns `None` when the credential has no override and unknown
    /// credentials are denied.
    pub fn credential_limit(&self, credential: &str) -> Option<u64> {
        match self.token_limits.get(credential) {
            Some(limit) => Some(*limit),
            None => match self.unknown_credential {
                UnknownCredentialPolicy::Fallback => Some(self.token_limit),
                UnknownCredentialPolicy::Deny => None,
            },
        }
    }
}

impl From<LimitsConfig> for LimitPolicy {
    fn from(config: LimitsConfig) -> Self {
        let mut token_limits = HashMap::with_capacity(config.credentials.len());
        for CredentialLimit { token, limit } in config.credentials {
            if token_limits.insert(token, limit).is_some() {
                warn!("Duplicate credential override in configuration, last entry wins");
            }
        }

        Self {
            ip_limit: config.ip_limit,
            token_limit: config.token_limit,
            block_duration: config.block_duration,
            token_limits,
            unknown_credential: config.unknown_credential,
        }
    }
}
