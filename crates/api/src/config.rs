//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use messaging::{ConsumerConfig, RetryPolicy};
use state_store::TtlConfig;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default: `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: Postgres backends when set, in-memory otherwise
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `STATE_TTL_SECS` / `MAPPING_TTL_SECS`: transient key lifetimes (default: `3600` each)
/// - `OPERATION_TIMEOUT_MS`: bound on each store or publish call (default: `2000`)
/// - `CONSUMER_MAX_IN_FLIGHT`, `CONSUMER_BATCH_SIZE`, `CONSUMER_POLL_INTERVAL_MS`
/// - `VISIBILITY_TIMEOUT_SECS`: lease length before redelivery (default: `30`)
/// - `PROCESS_MAX_ATTEMPTS` / `NOTIFY_MAX_ATTEMPTS`: attempts before dead-letter (default: `5` / `8`)
/// - `RETRY_BASE_DELAY_MS` / `RETRY_MAX_DELAY_MS`: redelivery backoff (default: `500` / `30000`)
/// - `DRAIN_TIMEOUT_SECS`: shutdown drain bound (default: `10`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub state_ttl: Duration,
    pub mapping_ttl: Duration,
    pub operation_timeout: Duration,
    pub consumer_max_in_flight: usize,
    pub consumer_batch_size: usize,
    pub consumer_poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub process_max_attempts: u32,
    pub notify_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub drain_timeout: Duration,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(name, default))
}

fn millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(env_or(name, default))
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: env_or("LOG_FORMAT", defaults.log_format),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            database_max_connections: env_or(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            state_ttl: secs("STATE_TTL_SECS", 3600),
            mapping_ttl: secs("MAPPING_TTL_SECS", 3600),
            operation_timeout: millis("OPERATION_TIMEOUT_MS", 2000),
            consumer_max_in_flight: env_or("CONSUMER_MAX_IN_FLIGHT", defaults.consumer_max_in_flight),
            consumer_batch_size: env_or("CONSUMER_BATCH_SIZE", defaults.consumer_batch_size),
            consumer_poll_interval: millis("CONSUMER_POLL_INTERVAL_MS", 200),
            visibility_timeout: secs("VISIBILITY_TIMEOUT_SECS", 30),
            process_max_attempts: env_or("PROCESS_MAX_ATTEMPTS", defaults.process_max_attempts),
            notify_max_attempts: env_or("NOTIFY_MAX_ATTEMPTS", defaults.notify_max_attempts),
            retry_base_delay: millis("RETRY_BASE_DELAY_MS", 500),
            retry_max_delay: millis("RETRY_MAX_DELAY_MS", 30_000),
            drain_timeout: secs("DRAIN_TIMEOUT_SECS", 10),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ttl(&self) -> TtlConfig {
        TtlConfig {
            state_ttl: self.state_ttl,
            mapping_ttl: self.mapping_ttl,
        }
    }

    /// Consumer settings for a stage that dead-letters after `max_attempts`.
    pub fn consumer_config(&self, max_attempts: u32) -> ConsumerConfig {
        ConsumerConfig {
            max_in_flight: self.consumer_max_in_flight,
            batch_size: self.consumer_batch_size,
            poll_interval: self.consumer_poll_interval,
            // A stage makes at most four bounded calls per message.
            handler_timeout: self.operation_timeout * 4,
            drain_timeout: self.drain_timeout,
            retry: RetryPolicy {
                max_attempts,
                base_delay: self.retry_base_delay,
                max_delay: self.retry_max_delay,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            database_max_connections: 10,
            state_ttl: Duration::from_secs(3600),
            mapping_ttl: Duration::from_secs(3600),
            operation_timeout: Duration::from_millis(2000),
            consumer_max_in_flight: 16,
            consumer_batch_size: 8,
            consumer_poll_interval: Duration::from_millis(200),
            visibility_timeout: Duration::from_secs(30),
            process_max_attempts: 5,
            notify_max_attempts: 8,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert_eq!(config.process_max_attempts, 5);
        assert_eq!(config.notify_max_attempts, 8);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_ttls_are_independent() {
        let config = Config {
            state_ttl: Duration::from_secs(60),
            mapping_ttl: Duration::from_secs(600),
            ..Config::default()
        };
        let ttl = config.ttl();
        assert_eq!(ttl.state_ttl, Duration::from_secs(60));
        assert_eq!(ttl.mapping_ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_consumer_config_carries_stage_bound() {
        let config = Config::default();
        let notify = config.consumer_config(config.notify_max_attempts);
        assert_eq!(notify.retry.max_attempts, 8);
        assert_eq!(notify.max_in_flight, 16);
        assert_eq!(notify.handler_timeout, Duration::from_secs(8));
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
