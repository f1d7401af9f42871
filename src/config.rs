use crate::error::ConfigError;
use std::env;
use std::time::Duration;

const ENV_PREFIX: &str = "LIVE_TALLY_";

/// Tunables for one engine instance. Every threshold used by the mode
/// controller lives here; the defaults mirror the production widget.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub enable_realtime: bool,
    pub polling_interval: Duration,
    pub max_retries: u32,
    pub enable_smart_reconnect: bool,
    pub enable_battery_saver: bool,
    pub max_error_count: u32,
    pub max_consecutive_errors: u32,
    pub min_connection_quality: f64,
    pub realtime_retry_delay: Duration,
    pub quality_check_interval: Duration,
    pub realtime_fallback_timeout: Duration,
    pub highlight_duration: Duration,
    pub request_timeout: Duration,
    pub personal_refresh_interval: Duration,
    pub signal_debounce: Duration,

    // Recovery gate (polling -> realtime)
    pub recovery_score_margin: f64,
    pub recovery_min_successes: u32,
    pub recovery_max_error_rate: f64,
    pub min_polling_dwell: Duration,

    // Power handling
    pub low_battery_level: f64,
    pub background_interval_multiplier: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_realtime: true,
            polling_interval: Duration::from_millis(1000),
            max_retries: 3,
            enable_smart_reconnect: true,
            enable_battery_saver: false,
            max_error_count: 3,
            max_consecutive_errors: 2,
            min_connection_quality: 70.0,
            realtime_retry_delay: Duration::from_secs(30),
            quality_check_interval: Duration::from_secs(15),
            realtime_fallback_timeout: Duration::from_secs(3),
            highlight_duration: Duration::from_millis(3000),
            request_timeout: Duration::from_secs(10),
            personal_refresh_interval: Duration::from_secs(5),
            signal_debounce: Duration::from_millis(500),
            recovery_score_margin: 20.0,
            recovery_min_successes: 15,
            recovery_max_error_rate: 0.1,
            min_polling_dwell: Duration::from_secs(60),
            low_battery_level: 0.2,
            background_interval_multiplier: 4,
        }
    }
}

impl EngineConfig {
    /// Reads `LIVE_TALLY_*` overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup, falling back to defaults
    /// for absent keys. Keys are given without the `LIVE_TALLY_` prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        if let Some(v) = get("ENABLE_REALTIME") {
            config.enable_realtime = parse_bool("ENABLE_REALTIME", &v)?;
        }
        if let Some(v) = get("POLLING_INTERVAL_MS") {
            config.polling_interval = parse_millis("POLLING_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            config.max_retries = parse_num("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("ENABLE_SMART_RECONNECT") {
            config.enable_smart_reconnect = parse_bool("ENABLE_SMART_RECONNECT", &v)?;
        }
        if let Some(v) = get("ENABLE_BATTERY_SAVER") {
            config.enable_battery_saver = parse_bool("ENABLE_BATTERY_SAVER", &v)?;
        }
        if let Some(v) = get("MAX_ERROR_COUNT") {
            config.max_error_count = parse_num("MAX_ERROR_COUNT", &v)?;
        }
        if let Some(v) = get("MAX_CONSECUTIVE_ERRORS") {
            config.max_consecutive_errors = parse_num("MAX_CONSECUTIVE_ERRORS", &v)?;
        }
        if let Some(v) = get("MIN_CONNECTION_QUALITY") {
            config.min_connection_quality = parse_num("MIN_CONNECTION_QUALITY", &v)?;
        }
        if let Some(v) = get("REALTIME_RETRY_DELAY_MS") {
            config.realtime_retry_delay = parse_millis("REALTIME_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("QUALITY_CHECK_INTERVAL_MS") {
            config.quality_check_interval = parse_millis("QUALITY_CHECK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("REALTIME_FALLBACK_TIMEOUT_MS") {
            config.realtime_fallback_timeout = parse_millis("REALTIME_FALLBACK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("HIGHLIGHT_DURATION_MS") {
            config.highlight_duration = parse_millis("HIGHLIGHT_DURATION_MS", &v)?;
        }
        if let Some(v) = get("REQUEST_TIMEOUT_MS") {
            config.request_timeout = parse_millis("REQUEST_TIMEOUT_MS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("polling_interval", self.polling_interval),
            ("quality_check_interval", self.quality_check_interval),
            ("realtime_fallback_timeout", self.realtime_fallback_timeout),
            ("request_timeout", self.request_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if !(0.0..=100.0).contains(&self.min_connection_quality) {
            return Err(ConfigError::OutOfRange {
                key: "min_connection_quality",
                value: self.min_connection_quality,
            });
        }
        if !(0.0..=1.0).contains(&self.low_battery_level) {
            return Err(ConfigError::OutOfRange {
                key: "low_battery_level",
                value: self.low_battery_level,
            });
        }
        if self.max_error_count == 0 {
            return Err(ConfigError::OutOfRange {
                key: "max_error_count",
                value: 0.0,
            });
        }
        Ok(())
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, raw)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| invalid(key, raw))
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    parse_num::<u64>(key, raw).map(Duration::from_millis)
}

fn invalid(key: &str, raw: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{}{}", ENV_PREFIX, key),
        value: raw.to_string(),
    }
}
