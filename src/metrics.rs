use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running counters for the throttling filter. Monotonic, relaxed ordering;
/// visibility matters, strict ordering does not.
#[derive(Debug, Default)]
pub struct FilterMetrics {
    throttled_requests: AtomicU64,
    banned_requests: AtomicU64,
}

impl FilterMetrics {
    pub fn record_throttled(&self) {
        self.throttled_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_banned(&self) {
        self.banned_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn throttled_requests(&self) -> u64 {
        self.throttled_requests.load(Ordering::Relaxed)
    }

    pub fn banned_requests(&self) -> u64 {
        self.banned_requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, state_size: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            state_size,
            throttled_requests: self.throttled_requests(),
            banned_requests: self.banned_requests(),
        }
    }
}

/// Point-in-time view of the filter, served on the management endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Number of buckets currently tracked in the state store
    pub state_size: usize,
    /// Total requests answered with 429 since startup
    pub throttled_requests: u64,
    /// Total requests answered with 403 since startup
    pub banned_requests: u64,
}
