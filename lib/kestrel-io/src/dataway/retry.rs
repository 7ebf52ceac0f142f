use std::time::Duration;

use http::StatusCode;
use rand::Rng as _;

/// Exponential backoff between delivery attempts.
///
/// The duration for `n` consecutive failures is `base * 2^n`, jittered down to as little as half of that, and then
/// clamped to `[base, max]`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Creates a jittered backoff bounded by `base` and `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: true,
        }
    }

    /// Creates a backoff without jitter.
    pub fn without_jitter(base: Duration, max: Duration) -> Self {
        Self {
            jitter: false,
            ..Self::new(base, max)
        }
    }

    /// Returns how long to wait after `failures` consecutive failed attempts.
    pub fn duration_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.base;
        }

        let mut backoff = self.base.saturating_mul(2u32.saturating_pow(failures));
        if self.jitter {
            let lower = backoff / 2;
            backoff = rand::rng().random_range(lower..=backoff);
        }

        backoff.clamp(self.base, self.max)
    }
}

/// How a delivery attempt ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum AttemptOutcome {
    /// The endpoint accepted the body.
    Delivered,

    /// The attempt failed in a way another attempt might fix.
    Transient(String),

    /// The endpoint rejected the body; retrying cannot succeed.
    Permanent(String),
}

/// Classifies a response status.
///
/// Success statuses are delivered. Request timeouts, rate limiting and server errors are transient. Every other status
/// is permanent.
pub(crate) fn classify_status(status: StatusCode) -> AttemptOutcome {
    if status.is_success() {
        AttemptOutcome::Delivered
    } else if matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS) || status.is_server_error() {
        AttemptOutcome::Transient(format!("HTTP {}", status))
    } else {
        AttemptOutcome::Permanent(format!("HTTP {}", status))
    }
}
