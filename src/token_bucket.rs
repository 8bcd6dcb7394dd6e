use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;

/// A rate-limited counter with fixed-interval refill.
///
/// A bucket is defined by its capacity, a refill amount, and a refill period:
/// every whole period that elapses adds the refill amount, clamped to the
/// capacity. Refill happens lazily on each operation, there is no background
/// task. The token unit is up to the caller (the time bucket counts
/// milliseconds, the error and throttle buckets count events).
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_amount: u64,
    refill_period: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: std::time::Instant,
}

impl TokenBucket {
    /// Creates a full bucket. Capacity, refill amount and refill period must
    /// all be positive; the configuration layer rejects zeroes at startup.
    pub fn new(
        capacity: u64,
        refill_amount: u64,
        refill_period: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        debug_assert!(capacity > 0 && refill_amount > 0 && !refill_period.is_zero());
        let last_refill = clock.now();
        Self {
            capacity,
            refill_amount,
            refill_period,
            clock,
            inner: Mutex::new(BucketState {
                tokens: capacity,
                last_refill,
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current token count after a lazy refill.
    pub fn available(&self) -> u64 {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        inner.tokens
    }

    /// Consumes `tokens` iff the bucket holds at least that many.
    /// Fails without side effect otherwise.
    pub fn try_consume(&self, tokens: u64) -> bool {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        if inner.tokens >= tokens {
            inner.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Consumes `tokens`, clamping the count at zero. Returns the shortfall,
    /// i.e. how many tokens were owed beyond what the bucket held.
    pub fn consume_or_overdraw(&self, tokens: u64) -> u64 {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        let shortfall = tokens.saturating_sub(inner.tokens);
        inner.tokens = inner.tokens.saturating_sub(tokens);
        shortfall
    }

    /// How long until `try_consume(tokens)` would succeed, assuming no
    /// further consumption. Zero if the tokens are already available,
    /// `Duration::MAX` if the request exceeds the capacity outright.
    pub fn time_until_available(&self, tokens: u64) -> Duration {
        if tokens > self.capacity {
            return Duration::MAX;
        }
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        if inner.tokens >= tokens {
            return Duration::ZERO;
        }
        let deficit = tokens - inner.tokens;
        let periods = deficit.div_ceil(self.refill_amount);
        let Ok(periods) = u32::try_from(periods) else {
            return Duration::MAX;
        };
        let ready_at = inner.last_refill + self.refill_period * periods;
        ready_at.saturating_duration_since(self.clock.now())
    }

    fn refill(&self, inner: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(inner.last_refill);
        let periods = elapsed.as_nanos() / self.refill_period.as_nanos();
        if periods == 0 {
            return;
        }
        // Enough whole periods to fill from empty: snap to full and realign
        // the schedule, so the arithmetic below stays in small integers.
        if periods >= u128::from(self.capacity / self.refill_amount + 1) {
            inner.tokens = self.capacity;
            inner.last_refill = now;
            return;
        }
        let added = periods as u64 * self.refill_amount;
        inner.tokens = inner.tokens.saturating_add(added).min(self.capacity);
        // Advance by whole periods only, keeping partial progress toward the
        // next refill.
        inner.last_refill += self.refill_period * periods as u32;
    }
}
