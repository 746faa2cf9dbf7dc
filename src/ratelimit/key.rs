//! Identity key generation.

/// A key that uniquely identifies one throttled subject within one limiter.
///
/// The key is composed of the limiter's prefix and the caller-supplied
/// identity, so two limiters never share counters for the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    /// Prefix owned by the limiter (e.g. `chat:min`)
    pub prefix: String,
    /// Raw identity supplied by the caller (e.g. `user:42`)
    pub identity: String,
}

impl IdentityKey {
    /// Create a new identity key.
    pub fn new(prefix: &str, identity: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Render the key as stored in the backing store.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.prefix, self.identity)
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.prefix, self.identity)
    }
}
