//! QuotaGuard - Multi-strategy rate limiting engine
//!
//! This crate decides whether a unit of work for an identity may proceed.
//! It offers fixed window, sliding window and token bucket limiters, a
//! cost-metered token quota for AI workloads, and composites that enforce
//! several limits as one. Counters live in an in-process store or, for
//! multi-instance deployments, in Redis.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
