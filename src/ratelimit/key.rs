//! Identity key generation.

use std::fmt;

/// The subject a counter or block belongs to.
///
/// Address and credential identities are namespaced so that an address and
/// a credential with the same literal text never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    /// A client source address
    Address(String),
    /// A caller-supplied credential
    Credential(String),
}

impl IdentityKey {
    pub fn address(address: &str) -> Self {
        IdentityKey::Address(address.to_string())
    }

    pub fn credential(credential: &str) -> Self {
        IdentityKey::Credential(credential.to_string())
    }

    /// The namespace prefix for this identity class.
    pub fn class(&self) -> &'static str {
        match self {
            IdentityKey::Address(_) => "ip",
            IdentityKey::Credential(_) => "token",
        }
    }

    /// The store key, e.g. `ip:10.0.0.1` or `token:abc`.
    pub fn to_string_key(&self) -> String {
        let value = match self {
            IdentityKey::Address(value) | IdentityKey::Credential(value) => value,
        };
        format!("{}:{}", self.class(), value)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
