//! Composite limiter enforcing several limiters as one unit.
//!
//! Members are consulted in order and the first rejection short-circuits the
//! rest. Members consulted before the rejecting one have already counted the
//! request; there is no rollback, so put the cheapest and most restrictive
//! limiter first.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, trace};

use super::decision::Decision;
use super::limiter::Limiter;
use crate::error::{QuotaGuardError, Result};

/// A named member of a composite.
struct Member {
    name: String,
    limiter: Arc<dyn Limiter>,
}

/// Requires every member limiter to allow.
pub struct CompositeLimiter {
    members: Vec<Member>,
}

impl CompositeLimiter {
    /// Start building a composite.
    pub fn builder() -> CompositeBuilder {
        CompositeBuilder::default()
    }

    /// Create a composite from ordered `(name, limiter)` pairs.
    pub fn new(members: Vec<(String, Arc<dyn Limiter>)>) -> Result<Self> {
        if members.is_empty() {
            return Err(QuotaGuardError::Config(
                "a composite limiter needs at least one member".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (name, _) in &members {
            if name.is_empty() {
                return Err(QuotaGuardError::Config(
                    "composite member names must not be empty".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(QuotaGuardError::Config(format!(
                    "duplicate composite member: {}",
                    name
                )));
            }
        }

        Ok(Self {
            members: members
                .into_iter()
                .map(|(name, limiter)| Member { name, limiter })
                .collect(),
        })
    }

    /// Member names in evaluation order.
    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }

    /// Check every member in order, stopping at the first rejection.
    pub async fn check(&self, identity: &str) -> Decision {
        let mut remaining = u64::MAX;
        let mut reset_time = 0;

        for member in &self.members {
            let decision = member.limiter.check(identity).await;
            trace!(
                limiter = %member.name,
                identity = %identity,
                allowed = decision.allowed,
                remaining = decision.remaining,
                "Composite member checked"
            );

            if !decision.allowed {
                debug!(
                    limiter = %member.name,
                    identity = %identity,
                    "Composite member rejected"
                );
                let failed = match &decision.failed_limiter {
                    // Nested composites report the full path.
                    Some(inner) => format!("{}/{}", member.name, inner),
                    None => member.name.clone(),
                };
                return decision.with_failed_limiter(&failed);
            }

            remaining = remaining.min(decision.remaining);
            reset_time = reset_time.max(decision.reset_time);
        }

        Decision::allowed(remaining, reset_time)
    }

    /// Reset `identity` on every member, returning the first failure.
    pub async fn reset(&self, identity: &str) -> Result<()> {
        let results = join_all(self.members.iter().map(|m| m.limiter.reset(identity))).await;
        results.into_iter().collect()
    }
}

#[async_trait]
impl Limiter for CompositeLimiter {
    async fn check(&self, identity: &str) -> Decision {
        self.check(identity).await
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        self.reset(identity).await
    }
}

/// Builder for [`CompositeLimiter`].
#[derive(Default)]
pub struct CompositeBuilder {
    members: Vec<(String, Arc<dyn Limiter>)>,
}

impl CompositeBuilder {
    /// Append a member; members are checked in the order they are added.
    pub fn with(mut self, name: &str, limiter: Arc<dyn Limiter>) -> Self {
        self.members.push((name.to_string(), limiter));
        self
    }

    /// Validate and build the composite.
    pub fn build(self) -> Result<CompositeLimiter> {
        CompositeLimiter::new(self.members)
    }
}
