//! Rate limiting algorithms, the composite limiter and rule loading.

mod composite;
mod decision;
mod fixed_window;
mod key;
mod limiter;
mod rules;
mod sliding_window;
mod token_bucket;
mod token_quota;

pub use composite::{CompositeBuilder, CompositeLimiter};
pub use decision::{retry_after_secs, Decision};
pub use fixed_window::FixedWindowLimiter;
pub use key::IdentityKey;
pub use limiter::{
    FailurePolicy, Limiter, LimiterOptions, SkipPredicate, WindowConfig, DEFAULT_STORE_TIMEOUT,
    MAX_WINDOW,
};
pub use rules::{Algorithm, CompositeRule, LimiterRegistry, LimiterRule, RuleSet};
pub use sliding_window::{SlidingWindowLimiter, MAX_SLIDING_REQUESTS};
pub use token_bucket::{TokenBucketConfig, TokenBucketLimiter};
pub use token_quota::{QuotaUsage, TokenQuotaConfig, TokenQuotaLimiter};
