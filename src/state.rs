//! Per-bucket throttling state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::clock::Clock;
use crate::config::ThrottlingConfig;
use crate::token_bucket::TokenBucket;

/// The record tracked for one bucket key: a time budget in milliseconds, an
/// error budget, a throttling-incident budget, and the ban deadline. The
/// three token buckets are created together and never replaced; only the
/// throttler and banner mutate them.
#[derive(Debug)]
pub struct ThrottlingState {
    time_bucket: TokenBucket,
    error_bucket: TokenBucket,
    throttle_bucket: TokenBucket,
    /// Ban deadline in milliseconds since the Unix epoch; 0 means not banned.
    banned_until_ms: AtomicU64,
}

impl ThrottlingState {
    pub fn new(
        time_bucket: TokenBucket,
        error_bucket: TokenBucket,
        throttle_bucket: TokenBucket,
    ) -> Self {
        Self {
            time_bucket,
            error_bucket,
            throttle_bucket,
            banned_until_ms: AtomicU64::new(0),
        }
    }

    pub fn time_bucket(&self) -> &TokenBucket {
        &self.time_bucket
    }

    pub fn error_bucket(&self) -> &TokenBucket {
        &self.error_bucket
    }

    pub fn throttle_bucket(&self) -> &TokenBucket {
        &self.throttle_bucket
    }

    /// The ban deadline, if one was ever set.
    pub fn banned_until(&self) -> Option<SystemTime> {
        let ms = self.banned_until_ms.load(Ordering::Relaxed);
        (ms != 0).then(|| UNIX_EPOCH + Duration::from_millis(ms))
    }

    /// Renews the ban deadline. The deadline only ever moves forward: a
    /// renewal earlier than the current deadline is ignored.
    pub fn ban_until(&self, deadline: SystemTime) {
        let ms = deadline
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.banned_until_ms.fetch_max(ms, Ordering::Relaxed);
    }
}

/// Builds the state record for a new bucket from the configured bucket
/// parameters. One factory is shared by the throttler and the banner so both
/// lazily create identical state.
#[derive(Debug)]
pub struct ThrottlingStateFactory {
    time_capacity_ms: u64,
    time_refill_ms: u64,
    time_refill_period: Duration,
    error_capacity: u64,
    error_refill: u64,
    error_refill_period: Duration,
    throttle_capacity: u64,
    throttle_refill: u64,
    throttle_refill_period: Duration,
    clock: Arc<dyn Clock>,
}

impl ThrottlingStateFactory {
    pub fn from_config(config: &ThrottlingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            time_capacity_ms: config.time_bucket_capacity.as_millis() as u64,
            time_refill_ms: config.time_bucket_refill_amount.as_millis() as u64,
            time_refill_period: config.time_bucket_refill_period,
            error_capacity: config.error_bucket_capacity,
            error_refill: config.error_bucket_refill_amount,
            error_refill_period: config.error_bucket_refill_period,
            throttle_capacity: config.throttle_bucket_capacity,
            throttle_refill: config.throttle_bucket_refill_amount,
            throttle_refill_period: config.throttle_bucket_refill_period,
            clock,
        }
    }

    pub fn create(&self) -> Arc<ThrottlingState> {
        Arc::new(ThrottlingState::new(
            TokenBucket::new(
                self.time_capacity_ms,
                self.time_refill_ms,
                self.time_refill_period,
                self.clock.clone(),
            ),
            TokenBucket::new(
                self.error_capacity,
                self.error_refill,
                self.error_refill_period,
                self.clock.clone(),
            ),
            TokenBucket::new(
                self.throttle_capacity,
                self.throttle_refill,
                self.throttle_refill_period,
                self.clock.clone(),
            ),
        ))
    }
}
