use std::sync::atomic::{AtomicU64, Ordering};

use crate::auth::FailureKind;

/// Lifetime counters for token refresh activity
#[derive(Debug, Default)]
pub struct RefreshMetrics {
    /// Upstream token requests sent
    requests: AtomicU64,

    /// Cycles that ended with a new token
    successes: AtomicU64,

    network_failures: AtomicU64,
    rate_limited: AtomicU64,
    timeouts: AtomicU64,
    invalid_credentials: AtomicU64,
    unknown_failures: AtomicU64,

    /// Callers that awaited a refresh started by someone else
    joined: AtomicU64,
}

/// Point-in-time copy of [`RefreshMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub network_failures: u64,
    pub rate_limited: u64,
    pub timeouts: u64,
    pub invalid_credentials: u64,
    pub unknown_failures: u64,
    pub joined: u64,
}

impl MetricsSnapshot {
    pub fn total_failures(&self) -> u64 {
        self.network_failures
            + self.rate_limited
            + self.timeouts
            + self.invalid_credentials
            + self.unknown_failures
    }
}

impl RefreshMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed request by kind. Cancellations are not failures.
    pub fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Network => &self.network_failures,
            FailureKind::RateLimited => &self.rate_limited,
            FailureKind::Timeout => &self.timeouts,
            FailureKind::InvalidCredential => &self.invalid_credentials,
            FailureKind::Unknown => &self.unknown_failures,
            FailureKind::Cancelled => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_joined(&self) {
        self.joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            invalid_credentials: self.invalid_credentials.load(Ordering::Relaxed),
            unknown_failures: self.unknown_failures.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }
}
