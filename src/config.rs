use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ThrottlerError;

/// Engine configuration, read once at startup. All durations are stored
/// normalized; the environment speaks the units the variable names carry
/// (millis, seconds or minutes).
#[derive(Debug, Clone)]
pub struct ThrottlingConfig {
    pub bind_address: String,
    pub log_level: String,
    /// Master switch; a disabled filter passes every request through
    /// untouched.
    pub enabled: bool,
    /// Successful requests cheaper than this are not accounted at all.
    pub request_duration_threshold: Duration,
    pub time_bucket_capacity: Duration,
    pub time_bucket_refill_amount: Duration,
    pub time_bucket_refill_period: Duration,
    pub error_bucket_capacity: u64,
    pub error_bucket_refill_amount: u64,
    pub error_bucket_refill_period: Duration,
    pub throttle_bucket_capacity: u64,
    pub throttle_bucket_refill_amount: u64,
    pub throttle_bucket_refill_period: Duration,
    pub ban_duration: Duration,
    pub max_state_size: usize,
    pub state_expiration: Duration,
    /// When set, throttling only applies to requests carrying this header.
    pub enable_throttling_if_header: Option<String>,
    /// When set, banning only applies to requests carrying this header.
    pub enable_ban_if_header: Option<String>,
    /// Requests carrying this query parameter are always throttled.
    pub always_throttle_param: Option<String>,
    /// Requests carrying this query parameter are always banned.
    pub always_ban_param: Option<String>,
    pub query_patterns_file: Option<PathBuf>,
    pub agent_patterns_file: Option<PathBuf>,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            log_level: "info".to_string(),
            enabled: true,
            request_duration_threshold: Duration::from_millis(10_000),
            time_bucket_capacity: Duration::from_secs(120),
            time_bucket_refill_amount: Duration::from_secs(60),
            time_bucket_refill_period: Duration::from_secs(60),
            error_bucket_capacity: 60,
            error_bucket_refill_amount: 30,
            error_bucket_refill_period: Duration::from_secs(60),
            throttle_bucket_capacity: 200,
            throttle_bucket_refill_amount: 200,
            throttle_bucket_refill_period: Duration::from_secs(20 * 60),
            ban_duration: Duration::from_secs(60 * 60),
            max_state_size: 10_000,
            state_expiration: Duration::from_secs(15 * 60),
            enable_throttling_if_header: None,
            enable_ban_if_header: None,
            always_throttle_param: None,
            always_ban_param: None,
            query_patterns_file: None,
            agent_patterns_file: None,
        }
    }
}

impl ThrottlingConfig {
    pub fn from_env() -> Result<Self, ThrottlerError> {
        let mut config = Self::default();

        if let Ok(addr) = env::var("BIND_ADDRESS") {
            config.bind_address = addr;
        }

        if let Ok(level) = env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        if let Ok(enabled) = env::var("THROTTLING_ENABLED") {
            config.enabled = enabled.parse().map_err(|_| {
                ThrottlerError::Config(format!("Invalid THROTTLING_ENABLED: {}", enabled))
            })?;
        }

        if let Some(ms) = read_u64("REQUEST_DURATION_THRESHOLD_MS")? {
            config.request_duration_threshold = Duration::from_millis(ms);
        }

        if let Some(secs) = read_u64("TIME_BUCKET_CAPACITY_SECS")? {
            config.time_bucket_capacity = Duration::from_secs(secs);
        }
        if let Some(secs) = read_u64("TIME_BUCKET_REFILL_AMOUNT_SECS")? {
            config.time_bucket_refill_amount = Duration::from_secs(secs);
        }
        if let Some(mins) = read_u64("TIME_BUCKET_REFILL_PERIOD_MINS")? {
            config.time_bucket_refill_period = Duration::from_secs(mins * 60);
        }

        if let Some(count) = read_u64("ERROR_BUCKET_CAPACITY")? {
            config.error_bucket_capacity = count;
        }
        if let Some(count) = read_u64("ERROR_BUCKET_REFILL_AMOUNT")? {
            config.error_bucket_refill_amount = count;
        }
        if let Some(mins) = read_u64("ERROR_BUCKET_REFILL_PERIOD_MINS")? {
            config.error_bucket_refill_period = Duration::from_secs(mins * 60);
        }

        if let Some(count) = read_u64("THROTTLE_BUCKET_CAPACITY")? {
            config.throttle_bucket_capacity = count;
        }
        if let Some(count) = read_u64("THROTTLE_BUCKET_REFILL_AMOUNT")? {
            config.throttle_bucket_refill_amount = count;
        }
        if let Some(mins) = read_u64("THROTTLE_BUCKET_REFILL_PERIOD_MINS")? {
            config.throttle_bucket_refill_period = Duration::from_secs(mins * 60);
        }

        if let Some(mins) = read_u64("BAN_DURATION_MINS")? {
            config.ban_duration = Duration::from_secs(mins * 60);
        }

        if let Some(size) = read_u64("MAX_STATE_SIZE")? {
            config.max_state_size = size as usize;
        }
        if let Some(mins) = read_u64("STATE_EXPIRATION_MINS")? {
            config.state_expiration = Duration::from_secs(mins * 60);
        }

        config.enable_throttling_if_header = env::var("ENABLE_THROTTLING_IF_HEADER").ok();
        config.enable_ban_if_header = env::var("ENABLE_BAN_IF_HEADER").ok();
        config.always_throttle_param = env::var("ALWAYS_THROTTLE_PARAM").ok();
        config.always_ban_param = env::var("ALWAYS_BAN_PARAM").ok();
        config.query_patterns_file = env::var("QUERY_PATTERNS_FILE").ok().map(PathBuf::from);
        config.agent_patterns_file = env::var("AGENT_PATTERNS_FILE").ok().map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ThrottlerError> {
        // The time bucket counts whole milliseconds, so sub-millisecond
        // capacities are as invalid as zero.
        if self.time_bucket_capacity.as_millis() == 0
            || self.time_bucket_refill_amount.as_millis() == 0
            || self.time_bucket_refill_period.is_zero()
        {
            return Err(ThrottlerError::Config(
                "Time bucket capacity, refill amount and refill period must be positive"
                    .to_string(),
            ));
        }

        if self.error_bucket_capacity == 0
            || self.error_bucket_refill_amount == 0
            || self.error_bucket_refill_period.is_zero()
        {
            return Err(ThrottlerError::Config(
                "Error bucket capacity, refill amount and refill period must be positive"
                    .to_string(),
            ));
        }

        if self.throttle_bucket_capacity == 0
            || self.throttle_bucket_refill_amount == 0
            || self.throttle_bucket_refill_period.is_zero()
        {
            return Err(ThrottlerError::Config(
                "Throttle bucket capacity, refill amount and refill period must be positive"
                    .to_string(),
            ));
        }

        if self.ban_duration.is_zero() {
            return Err(ThrottlerError::Config(
                "Ban duration must be positive".to_string(),
            ));
        }

        if self.max_state_size == 0 {
            return Err(ThrottlerError::Config(
                "Max state size must be greater than 0".to_string(),
            ));
        }

        if self.state_expiration.is_zero() {
            return Err(ThrottlerError::Config(
                "State expiration must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn read_u64(name: &str) -> Result<Option<u64>, ThrottlerError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ThrottlerError::Config(format!("Invalid {}: {}", name, value))),
        Err(_) => Ok(None),
    }
}
