//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use super::key::IdentityKey;
use super::policy::LimitPolicy;
use crate::error::DecisionError;
use crate::store::{CallContext, CounterStore};

/// Length of the counting window. Limits are requests per second.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Decides whether a request may proceed, by credential or source address.
///
/// The limiter itself holds no mutable state. Counters and blocks live in the
/// store, which serializes updates per key, so one limiter can be shared
/// across any number of concurrent requests.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policy: LimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: LimitPolicy) -> Self {
        Self { store, policy }
    }

    /// Whether `credential` has a configured override.
    pub fn is_credential_registered(&self, credential: &str) -> bool {
        self.policy.is_registered(credential)
    }

    /// Check and count one request.
    ///
    /// A non-empty `credential` is limited on its own and `address` is not
    /// looked at. Otherwise the request is limited by `address`. Store
    /// failures are returned as errors and are neither an allow nor a deny.
    pub async fn allow(
        &self,
        ctx: &CallContext,
        address: &str,
        credential: &str,
    ) -> Result<Decision, DecisionError> {
        if !credential.is_empty() {
            let key = IdentityKey::credential(credential);
            let Some(limit) = self.policy.credential_limit(credential) else {
                debug!(key = %key, "Unregistered credential denied");
                return Ok(Decision::Deny);
            };
            return self.check(ctx, &key, limit).await;
        }

        let key = IdentityKey::address(address);
        self.check(ctx, &key, self.policy.ip_limit()).await
    }

    async fn check(
        &self,
        ctx: &CallContext,
        key: &IdentityKey,
        limit: u64,
    ) -> Result<Decision, DecisionError> {
        let key = key.to_string_key();

        trace!(key = %key, limit, "Checking rate limit");

        let blocked = self
            .store
            .is_blocked(ctx, &key)
            .await
            .map_err(|source| DecisionError::BlockCheck {
                key: key.clone(),
                source,
            })?;
        if blocked {
            debug!(key = %key, "Identity is blocked");
            return Ok(Decision::Deny);
        }

        let count = self
            .store
            .increment(ctx, &key, WINDOW)
            .await
            .map_err(|source| DecisionError::Increment {
                key: key.clone(),
                source,
            })?;

        if count > limit {
            let cooldown = self.policy.block_duration();
            self.store
                .set_block(ctx, &key, cooldown)
                .await
                .map_err(|source| DecisionError::SetBlock {
                    key: key.clone(),
                    source,
                })?;

            info!(
                key = %key,
                count,
                limit,
                cooldown = ?cooldown,
                "Rate limit exceeded, blocking identity"
            );
            return Ok(Decision::Deny);
        }

        trace!(key = %key, count, limit, "Request allowed");
        Ok(Decision::Allow)
    }
}
