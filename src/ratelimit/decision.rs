//! The value every limiter check returns.

use serde::{Deserialize, Serialize};

/// Outcome of a limiter check.
///
/// A rejection is a normal value (`allowed == false`), never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the unit of work may proceed
    pub allowed: bool,
    /// Units left before the limiter rejects
    pub remaining: u64,
    /// When the limiter's state resets (ms since epoch)
    pub reset_time: u64,
    /// Seconds to wait before retrying, set on rejection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Name of the composite member that rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_limiter: Option<String>,
    /// Operator-configured message, set on rejection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Decision {
    /// An allowed decision.
    pub fn allowed(remaining: u64, reset_time: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_time,
            retry_after: None,
            failed_limiter: None,
            message: None,
        }
    }

    /// A rejection that may be retried after `retry_after` seconds.
    pub fn rejected(remaining: u64, reset_time: u64, retry_after: Option<u64>) -> Self {
        Self {
            allowed: false,
            remaining,
            reset_time,
            retry_after,
            failed_limiter: None,
            message: None,
        }
    }

    /// Attach the operator message, if the decision is a rejection.
    pub fn with_message(mut self, message: Option<&str>) -> Self {
        if !self.allowed {
            self.message = message.map(str::to_string);
        }
        self
    }

    /// Tag the decision with the name of the limiter that produced it.
    pub fn with_failed_limiter(mut self, name: &str) -> Self {
        self.failed_limiter = Some(name.to_string());
        self
    }

    /// Header pairs a decision consumer would attach to a response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            // Seconds since epoch, rounded up.
            ("X-RateLimit-Reset", self.reset_time.div_ceil(1000).to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers
    }
}

/// Whole seconds until `reset_time`, rounded up.
pub fn retry_after_secs(reset_time: u64, now: u64) -> u64 {
    reset_time.saturating_sub(now).div_ceil(1000)
}
