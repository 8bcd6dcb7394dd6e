//! The throttling filter in front of the query endpoint.
//!
//! Control flow per request:
//!
//! ```text
//!   request
//!     │ classify: query patterns → agent patterns → (IP, User-Agent)
//!     ▼
//!   banned?  ──yes──▶ 403, body names the ban deadline
//!     │no
//!     ▼
//!   throttled? ──yes──▶ 429 + Retry-After, charge the throttle budget
//!     │no
//!     ▼
//!   downstream handler, stopwatch running
//!     │
//!     ▼
//!   status < 400 ? success(elapsed) : failure(elapsed)
//! ```
//!
//! The throttling decision is taken before the handler runs, but the cost of
//! a request is only known afterwards; accounting is therefore late, and a
//! bucket can overrun its budget once before it starts seeing 429s.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;

use crate::ban::BanThrottler;
use crate::bucketing::{
    load_patterns, BucketKey, Bucketing, RegexBucketing, UserAgentIpBucketing,
};
use crate::clock::{Clock, SystemClock};
use crate::config::ThrottlingConfig;
use crate::metrics::{FilterMetrics, MetricsSnapshot};
use crate::request::ClientRequest;
use crate::state::ThrottlingStateFactory;
use crate::store::StateStore;
use crate::throttler::TimeAndErrorsThrottler;

/// Orchestrates classification, ban and throttle checks, and late
/// accounting. One instance is shared by all request-handling tasks.
pub struct ThrottlingFilter {
    enabled: bool,
    chain: Vec<Box<dyn Bucketing>>,
    fallback: UserAgentIpBucketing,
    throttler: TimeAndErrorsThrottler,
    banner: BanThrottler,
    store: Arc<StateStore>,
    metrics: FilterMetrics,
    clock: Arc<dyn Clock>,
}

impl ThrottlingFilter {
    pub fn new(config: &ThrottlingConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds the filter on an explicit clock. Tests drive a [`ManualClock`]
    /// through here.
    ///
    /// [`ManualClock`]: crate::clock::ManualClock
    pub fn with_clock(config: &ThrottlingConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(StateStore::new(
            config.max_state_size,
            config.state_expiration,
            clock.clone(),
        ));
        let factory = Arc::new(ThrottlingStateFactory::from_config(config, clock.clone()));

        let chain: Vec<Box<dyn Bucketing>> = vec![
            Box::new(RegexBucketing::over_query(load_patterns(
                config.query_patterns_file.as_deref(),
            ))),
            Box::new(RegexBucketing::over_user_agent(load_patterns(
                config.agent_patterns_file.as_deref(),
            ))),
        ];

        let throttler = TimeAndErrorsThrottler::new(
            config.request_duration_threshold,
            factory.clone(),
            store.clone(),
            config.enable_throttling_if_header.clone(),
            config.always_throttle_param.clone(),
        );
        let banner = BanThrottler::new(
            config.ban_duration,
            factory,
            store.clone(),
            config.enable_ban_if_header.clone(),
            config.always_ban_param.clone(),
            clock.clone(),
        );

        Self {
            enabled: config.enabled,
            chain,
            fallback: UserAgentIpBucketing,
            throttler,
            banner,
            store,
            metrics: FilterMetrics::default(),
            clock,
        }
    }

    /// Maps a request to its bucket: the first strategy with an opinion
    /// wins, and the (IP, User-Agent) fallback guarantees there always is
    /// one.
    pub fn classify(&self, request: &ClientRequest) -> BucketKey {
        self.chain
            .iter()
            .find_map(|strategy| strategy.bucket(request))
            .unwrap_or_else(|| self.fallback.key(request))
    }

    pub async fn handle(&self, ip: IpAddr, request: Request, next: Next) -> Response {
        if !self.enabled {
            return next.run(request).await;
        }

        let client = ClientRequest::from_http(ip, request.headers(), request.uri().query());
        let key = self.classify(&client);

        if let Some(banned_until) = self.banner.throttled_until(&key, &client) {
            info!("A request is being banned.");
            self.metrics.record_banned();
            return ban_response(banned_until);
        }

        if let Some(backoff) = self.throttler.throttled_duration(&key, &client) {
            info!("A request is being throttled.");
            self.metrics.record_throttled();
            let response = throttle_response(backoff);
            self.banner.throttled(&key, &client);
            return response;
        }

        let started = self.clock.now();
        let response = next.run(request).await;
        let elapsed = self.clock.now().saturating_duration_since(started);

        // For throttling purposes all 1xx/2xx/3xx status codes count as
        // success, 4xx and 5xx as failure.
        if response.status().as_u16() < 400 {
            self.throttler.success(&key, &client, elapsed);
        } else {
            self.throttler.failure(&key, &client, elapsed);
        }
        response
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.store.len())
    }
}

/// The axum middleware entry point; layer it with
/// `middleware::from_fn_with_state(filter, throttling_middleware)`.
pub async fn throttling_middleware(
    State(filter): State<Arc<ThrottlingFilter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    filter.handle(addr.ip(), request, next).await
}

fn ban_response(banned_until: SystemTime) -> Response {
    (
        StatusCode::FORBIDDEN,
        format!(
            "You have been banned until {}, please respect throttling and retry-after headers.",
            iso_instant(banned_until)
        ),
    )
        .into_response()
}

fn iso_instant(instant: SystemTime) -> String {
    DateTime::<Utc>::from(instant).to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn throttle_response(backoff: Duration) -> Response {
    let seconds = backoff.as_secs();
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, seconds.to_string())],
        format!("Too Many Requests - Please retry in {} seconds.", seconds),
    )
        .into_response()
}
