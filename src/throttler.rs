//! Throttling decisions from resource time and error accounting.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use crate::bucketing::BucketKey;
use crate::request::ClientRequest;
use crate::state::{ThrottlingState, ThrottlingStateFactory};
use crate::store::StateStore;

/// Tracks how much compute time a bucket has consumed and how often it has
/// failed, and decides when to start pushing back.
///
/// Cost is only known after the downstream handler returns, so the check and
/// the accounting are split: [`throttled_duration`] is asked before the
/// handler runs, [`success`]/[`failure`] charge the buckets afterwards. A
/// client therefore overruns its budget once before throttling kicks in.
///
/// State is created lazily: well-behaved clients whose requests stay below
/// the duration threshold and never fail are not tracked at all.
///
/// [`throttled_duration`]: TimeAndErrorsThrottler::throttled_duration
/// [`success`]: TimeAndErrorsThrottler::success
/// [`failure`]: TimeAndErrorsThrottler::failure
pub struct TimeAndErrorsThrottler {
    request_duration_threshold: Duration,
    factory: Arc<ThrottlingStateFactory>,
    store: Arc<StateStore>,
    enable_if_header: Option<String>,
    always_throttle_param: Option<String>,
}

impl TimeAndErrorsThrottler {
    pub fn new(
        request_duration_threshold: Duration,
        factory: Arc<ThrottlingStateFactory>,
        store: Arc<StateStore>,
        enable_if_header: Option<String>,
        always_throttle_param: Option<String>,
    ) -> Self {
        Self {
            request_duration_threshold,
            factory,
            store,
            enable_if_header,
            always_throttle_param,
        }
    }

    /// How long the client should back off, or `None` if the request may
    /// proceed. Throttled when either the time bucket or the error bucket
    /// cannot serve a token; the backoff is whichever bucket takes longer to
    /// recover.
    pub fn throttled_duration(
        &self,
        key: &BucketKey,
        request: &ClientRequest,
    ) -> Option<Duration> {
        if !self.active_for(request) {
            return None;
        }
        let state = self.store.get(key);
        if self.forced(request) {
            return Some(state.map(|s| Self::backoff(&s)).unwrap_or(Duration::ZERO));
        }
        let state = state?;
        let wait = Self::backoff(&state);
        (wait > Duration::ZERO).then_some(wait)
    }

    /// Accounts a completed, successful request. Requests cheaper than the
    /// duration threshold are ignored entirely, which is what keeps idle
    /// clients out of the state store.
    pub fn success(&self, key: &BucketKey, request: &ClientRequest, elapsed: Duration) {
        if !self.active_for(request) || elapsed < self.request_duration_threshold {
            return;
        }
        let state = self.state_for(key);
        state
            .time_bucket()
            .consume_or_overdraw(elapsed.as_millis() as u64);
    }

    /// Accounts a completed, failed request. Failures always create state
    /// and always charge, whatever the elapsed time: both the time spent and
    /// one error token are taken.
    pub fn failure(&self, key: &BucketKey, request: &ClientRequest, elapsed: Duration) {
        if !self.active_for(request) {
            return;
        }
        let state = self.state_for(key);
        state
            .time_bucket()
            .consume_or_overdraw(elapsed.as_millis() as u64);
        state.error_bucket().consume_or_overdraw(1);
    }

    fn state_for(&self, key: &BucketKey) -> Arc<ThrottlingState> {
        self.store.get_or_create(key, || self.factory.create())
    }

    fn backoff(state: &ThrottlingState) -> Duration {
        cmp::max(
            state.time_bucket().time_until_available(1),
            state.error_bucket().time_until_available(1),
        )
    }

    fn active_for(&self, request: &ClientRequest) -> bool {
        match &self.enable_if_header {
            None => true,
            Some(header) => request.has_header(header),
        }
    }

    fn forced(&self, request: &ClientRequest) -> bool {
        self.always_throttle_param
            .as_deref()
            .is_some_and(|param| request.param(param).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ThrottlingConfig;
    use axum::http::{HeaderMap, HeaderValue};

    fn config() -> ThrottlingConfig {
        ThrottlingConfig {
            request_duration_threshold: Duration::from_millis(500),
            time_bucket_capacity: Duration::from_secs(60),
            time_bucket_refill_amount: Duration::from_secs(60),
            time_bucket_refill_period: Duration::from_secs(60),
            error_bucket_capacity: 5,
            error_bucket_refill_amount: 5,
            error_bucket_refill_period: Duration::from_secs(60),
            ..ThrottlingConfig::default()
        }
    }

    fn throttler_with(
        config: &ThrottlingConfig,
        enable_if_header: Option<&str>,
        always_param: Option<&str>,
    ) -> (TimeAndErrorsThrottler, Arc<StateStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(StateStore::new(
            config.max_state_size,
            config.state_expiration,
            clock.clone(),
        ));
        let factory = Arc::new(ThrottlingStateFactory::from_config(config, clock.clone()));
        let throttler = TimeAndErrorsThrottler::new(
            config.request_duration_threshold,
            factory,
            store.clone(),
            enable_if_header.map(String::from),
            always_param.map(String::from),
        );
        (throttler, store, clock)
    }

    fn throttler() -> (TimeAndErrorsThrottler, Arc<StateStore>, Arc<ManualClock>) {
        throttler_with(&config(), None, None)
    }

    fn key() -> BucketKey {
        BucketKey::Client {
            ip: [192, 0, 2, 1].into(),
            agent: "test-agent".to_string(),
        }
    }

    fn request() -> ClientRequest {
        ClientRequest::from_http([192, 0, 2, 1].into(), &HeaderMap::new(), None)
    }

    #[test]
    fn test_untracked_bucket_is_not_throttled() {
        let (throttler, store, _clock) = throttler();
        assert_eq!(throttler.throttled_duration(&key(), &request()), None);
        // Asking must not have allocated state.
        assert!(store.is_empty());
    }

    #[test]
    fn test_success_below_threshold_creates_no_state() {
        let (throttler, store, _clock) = throttler();
        throttler.success(&key(), &request(), Duration::from_millis(10));
        assert!(store.is_empty());
        assert_eq!(throttler.throttled_duration(&key(), &request()), None);
    }

    #[test]
    fn test_fresh_state_with_full_buckets_is_not_throttled() {
        let (throttler, store, _clock) = throttler();
        throttler.success(&key(), &request(), Duration::from_millis(600));
        assert_eq!(store.len(), 1);
        assert_eq!(throttler.throttled_duration(&key(), &request()), None);
    }

    #[test]
    fn test_time_budget_exhaustion_throttles() {
        let (throttler, _store, _clock) = throttler();
        // 60s budget, charged in 10s slices.
        for _ in 0..6 {
            throttler.success(&key(), &request(), Duration::from_secs(10));
        }
        let wait = throttler.throttled_duration(&key(), &request());
        assert!(wait.is_some());
        assert!(wait.unwrap() <= Duration::from_secs(60));
    }

    #[test]
    fn test_time_budget_recovers_after_refill() {
        let (throttler, _store, clock) = throttler();
        for _ in 0..6 {
            throttler.success(&key(), &request(), Duration::from_secs(10));
        }
        assert!(throttler.throttled_duration(&key(), &request()).is_some());

        clock.advance(Duration::from_secs(60));
        assert_eq!(throttler.throttled_duration(&key(), &request()), None);
    }

    #[test]
    fn test_error_budget_exhaustion_throttles() {
        let (throttler, _store, _clock) = throttler();
        for _ in 0..5 {
            throttler.failure(&key(), &request(), Duration::from_millis(20));
        }
        assert!(throttler.throttled_duration(&key(), &request()).is_some());
    }

    #[test]
    fn test_failure_below_threshold_still_creates_and_charges() {
        let (throttler, store, _clock) = throttler();
        throttler.failure(&key(), &request(), Duration::from_millis(10));
        assert_eq!(store.len(), 1);

        let state = store.get(&key()).unwrap();
        assert_eq!(state.error_bucket().available(), 4);
    }

    #[test]
    fn test_failure_charges_both_buckets() {
        let (throttler, store, _clock) = throttler();
        throttler.failure(&key(), &request(), Duration::from_secs(2));

        let state = store.get(&key()).unwrap();
        assert_eq!(state.error_bucket().available(), 4);
        assert_eq!(state.time_bucket().available(), 58_000);
    }

    #[test]
    fn test_backoff_is_the_slower_of_the_two_buckets() {
        let cfg = ThrottlingConfig {
            error_bucket_refill_period: Duration::from_secs(300),
            ..config()
        };
        let (throttler, _store, _clock) = throttler_with(&cfg, None, None);

        // Drain both budgets; the error bucket refills much later.
        for _ in 0..5 {
            throttler.failure(&key(), &request(), Duration::from_secs(12));
        }
        let wait = throttler.throttled_duration(&key(), &request()).unwrap();
        assert_eq!(wait, Duration::from_secs(300));
    }

    #[test]
    fn test_enable_header_gates_decisions_and_accounting() {
        let (throttler, store, _clock) = throttler_with(&config(), Some("X-Throttle-Me"), None);
        let plain = request();

        // Without the header nothing is tracked or throttled.
        for _ in 0..10 {
            throttler.failure(&key(), &plain, Duration::from_secs(20));
        }
        assert!(store.is_empty());
        assert_eq!(throttler.throttled_duration(&key(), &plain), None);

        let mut headers = HeaderMap::new();
        headers.insert("X-Throttle-Me", HeaderValue::from_static("1"));
        let gated = ClientRequest::from_http([192, 0, 2, 1].into(), &headers, None);

        for _ in 0..5 {
            throttler.failure(&key(), &gated, Duration::from_secs(20));
        }
        assert!(throttler.throttled_duration(&key(), &gated).is_some());
    }

    #[test]
    fn test_always_throttle_param_forces_throttling() {
        let (throttler, store, _clock) = throttler_with(&config(), None, Some("forceThrottle"));

        let forced = ClientRequest::from_http(
            [192, 0, 2, 1].into(),
            &HeaderMap::new(),
            Some("forceThrottle=1"),
        );
        // Forced even with no state; no state is created by the check.
        assert_eq!(
            throttler.throttled_duration(&key(), &forced),
            Some(Duration::ZERO)
        );
        assert!(store.is_empty());

        // A request without the parameter is unaffected.
        assert_eq!(throttler.throttled_duration(&key(), &request()), None);
    }
}
