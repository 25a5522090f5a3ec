//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use ledger::{DEFAULT_RECENT_OPERATIONS_CAPACITY, LedgerSettings};
use saga::RetryPolicy;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

/// Service configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `plain` or `json` (default: `plain`)
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory stores if unset
/// - `WORKER_COUNT`: concurrent message workers (default: `4`)
/// - `MESSAGE_MAX_ATTEMPTS`: deliveries before dead-lettering, `0` for no
///   limit (default: `0`)
/// - `MESSAGE_RETRY_DELAY_MS`: pause before a redelivery (default: `500`)
/// - `RECENT_OPERATIONS_CAPACITY`: operation ids remembered per account
///   (default: `200`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub worker_count: usize,
    pub message_max_attempts: u32,
    pub message_retry_delay: Duration,
    pub recent_operations_capacity: usize,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. Unparseable
    /// values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse(lookup("PORT")).unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref().map(str::trim) {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => defaults.log_format,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            worker_count: parse(lookup("WORKER_COUNT"))
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.worker_count),
            message_max_attempts: parse(lookup("MESSAGE_MAX_ATTEMPTS"))
                .unwrap_or(defaults.message_max_attempts),
            message_retry_delay: parse(lookup("MESSAGE_RETRY_DELAY_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.message_retry_delay),
            recent_operations_capacity: parse(lookup("RECENT_OPERATIONS_CAPACITY"))
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.recent_operations_capacity),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: (self.message_max_attempts > 0).then_some(self.message_max_attempts),
            delay: self.message_retry_delay,
        }
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            recent_operations_capacity: self.recent_operations_capacity,
        }
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Plain,
            database_url: None,
            worker_count: 4,
            message_max_attempts: 0,
            message_retry_delay: Duration::from_millis(500),
            recent_operations_capacity: DEFAULT_RECENT_OPERATIONS_CAPACITY,
        }
    }
}
