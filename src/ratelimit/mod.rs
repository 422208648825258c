//! Rate limit decisions and limit policy.

mod key;
mod limiter;
mod policy;

pub use key::IdentityKey;
pub use limiter::{Decision, RateLimiter, WINDOW};
pub use policy::{CredentialLimit, LimitPolicy, LimitsConfig, UnknownCredentialPolicy};
