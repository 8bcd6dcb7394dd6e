//! Escalation from repeated throttling to outright bans.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::bucketing::BucketKey;
use crate::clock::Clock;
use crate::request::ClientRequest;
use crate::state::ThrottlingStateFactory;
use crate::store::StateStore;

/// Turns throttling incidents into bans. Every throttled request charges the
/// bucket's throttle budget; when that budget runs dry the client clearly is
/// not backing off, and a hard ban deadline is set.
pub struct BanThrottler {
    ban_duration: Duration,
    factory: Arc<ThrottlingStateFactory>,
    store: Arc<StateStore>,
    enable_if_header: Option<String>,
    always_ban_param: Option<String>,
    clock: Arc<dyn Clock>,
}

impl BanThrottler {
    pub fn new(
        ban_duration: Duration,
        factory: Arc<ThrottlingStateFactory>,
        store: Arc<StateStore>,
        enable_if_header: Option<String>,
        always_ban_param: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ban_duration,
            factory,
            store,
            enable_if_header,
            always_ban_param,
            clock,
        }
    }

    /// The deadline a banned client is refused until, or `None` if the
    /// client is not currently banned.
    pub fn throttled_until(
        &self,
        key: &BucketKey,
        request: &ClientRequest,
    ) -> Option<SystemTime> {
        if !self.active_for(request) {
            return None;
        }
        if self.forced(request) {
            return Some(self.clock.wall() + self.ban_duration);
        }
        let until = self.store.get(key)?.banned_until()?;
        (until > self.clock.wall()).then_some(until)
    }

    /// Records that a request for this bucket was throttled. Called by the
    /// filter after it has decided on a 429. Once the throttle budget is
    /// empty the ban deadline is set; renewals only ever push it further
    /// out.
    pub fn throttled(&self, key: &BucketKey, request: &ClientRequest) {
        if !self.active_for(request) {
            return;
        }
        let state = self.store.get_or_create(key, || self.factory.create());
        state.throttle_bucket().consume_or_overdraw(1);
        if state.throttle_bucket().available() == 0 {
            state.ban_until(self.clock.wall() + self.ban_duration);
        }
    }

    fn active_for(&self, request: &ClientRequest) -> bool {
        match &self.enable_if_header {
            None => true,
            Some(header) => request.has_header(header),
        }
    }

    fn forced(&self, request: &ClientRequest) -> bool {
        self.always_ban_param
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
            throttle_bucket_capacity: 10,
            throttle_bucket_refill_amount: 10,
            throttle_bucket_refill_period: Duration::from_secs(20 * 60),
            ban_duration: Duration::from_secs(60),
            ..ThrottlingConfig::default()
        }
    }

    fn banner_with(
        config: &ThrottlingConfig,
        enable_if_header: Option<&str>,
        always_param: Option<&str>,
    ) -> (BanThrottler, Arc<StateStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(StateStore::new(
            config.max_state_size,
            config.state_expiration,
            clock.clone(),
        ));
        let factory = Arc::new(ThrottlingStateFactory::from_config(config, clock.clone()));
        let banner = BanThrottler::new(
            config.ban_duration,
            factory,
            store.clone(),
            enable_if_header.map(String::from),
            always_param.map(String::from),
            clock.clone(),
        );
        (banner, store, clock)
    }

    fn banner() -> (BanThrottler, Arc<StateStore>, Arc<ManualClock>) {
        banner_with(&config(), None, None)
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
    fn test_untracked_bucket_is_not_banned() {
        let (banner, store, _clock) = banner();
        assert_eq!(banner.throttled_until(&key(), &request()), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_ban_triggers_when_throttle_budget_empties() {
        let (banner, _store, clock) = banner();

        // Budget of 10: the first nine incidents only consume.
        for _ in 0..9 {
            banner.throttled(&key(), &request());
            assert_eq!(banner.throttled_until(&key(), &request()), None);
        }

        // The tenth empties the bucket and sets the deadline.
        banner.throttled(&key(), &request());
        let until = banner.throttled_until(&key(), &request()).unwrap();
        assert_eq!(until, clock.wall() + Duration::from_secs(60));
    }

    #[test]
    fn test_ban_expires() {
        let (banner, _store, clock) = banner();
        for _ in 0..10 {
            banner.throttled(&key(), &request());
        }
        assert!(banner.throttled_until(&key(), &request()).is_some());

        clock.advance(Duration::from_secs(61));
        assert_eq!(banner.throttled_until(&key(), &request()), None);
    }

    #[test]
    fn test_continued_abuse_extends_the_ban() {
        let (banner, _store, clock) = banner();
        for _ in 0..10 {
            banner.throttled(&key(), &request());
        }
        let first = banner.throttled_until(&key(), &request()).unwrap();

        // More throttling while the bucket is still dry renews the deadline.
        clock.advance(Duration::from_secs(30));
        banner.throttled(&key(), &request());
        let renewed = banner.throttled_until(&key(), &request()).unwrap();
        assert_eq!(renewed, first + Duration::from_secs(30));
    }

    #[test]
    fn test_each_incident_in_a_burst_counts() {
        let (banner, store, _clock) = banner();
        for _ in 0..4 {
            banner.throttled(&key(), &request());
        }
        let state = store.get(&key()).unwrap();
        assert_eq!(state.throttle_bucket().available(), 6);
    }

    #[test]
    fn test_enable_header_gates_banning() {
        let (banner, store, _clock) = banner_with(&config(), Some("X-Ban-Me"), None);

        for _ in 0..20 {
            banner.throttled(&key(), &request());
        }
        assert!(store.is_empty());
        assert_eq!(banner.throttled_until(&key(), &request()), None);

        let mut headers = HeaderMap::new();
        headers.insert("X-Ban-Me", HeaderValue::from_static("1"));
        let gated = ClientRequest::from_http([192, 0, 2, 1].into(), &headers, None);
        for _ in 0..10 {
            banner.throttled(&key(), &gated);
        }
        assert!(banner.throttled_until(&key(), &gated).is_some());
    }

    #[test]
    fn test_always_ban_param_forces_a_ban() {
        let (banner, _store, clock) = banner_with(&config(), None, Some("forceBan"));

        let forced = ClientRequest::from_http(
            [192, 0, 2, 1].into(),
            &HeaderMap::new(),
            Some("forceBan=1"),
        );
        assert_eq!(
            banner.throttled_until(&key(), &forced),
            Some(clock.wall() + Duration::from_secs(60))
        );
        assert_eq!(banner.throttled_until(&key(), &request()), None);
    }
}
