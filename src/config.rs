// ============================================================================
// Bridge Configuration
// ============================================================================
//
// Centralized configuration for the delivery bridge.
// Supports loading from environment variables with sensible defaults.
//
// ============================================================================

use anyhow::Result;
use std::str::FromStr;
use std::time::Duration;

// Default HTTP port
const DEFAULT_PORT: u16 = 8080;

// Producer defaults
const DEFAULT_SEND_INTERVAL_MS: u64 = 200;
const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_BACKOFF_CEILING_MS: u64 = 30_000;

// Transport defaults
const DEFAULT_BINDING_NAME: &str = "busbinding";
const DEFAULT_BINDING_OPERATION: &str = "create";
const DEFAULT_TRANSPORT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

// Receiver defaults
const DEFAULT_IDEMPOTENCY_RETENTION_SECS: u64 = 24 * 3600;
const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 300;

// Shutdown defaults
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;

/// Main configuration structure for the bridge
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,

    /// Name of the transport binding; also the HTTP route the transport
    /// delivers to (`POST /{binding_name}`)
    pub binding_name: String,
    pub binding_operation: String,

    /// Base producer cadence. Stretched exponentially under backpressure.
    pub send_interval: Duration,
    pub max_send_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_ceiling: Duration,

    pub transport_queue_capacity: usize,

    /// How long the transport waits for an acknowledgment before a delivery
    /// is considered lost and redelivered
    pub visibility_timeout: Duration,
    pub max_delivery_attempts: u32,

    /// Retention window for processed-message entries.
    /// Must cover the transport's redelivery horizon, or duplicates of old
    /// messages stop being suppressed.
    pub idempotency_retention: Duration,
    pub eviction_interval: Duration,

    pub shutdown_grace: Duration,

    pub rust_log: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let port: u16 = env_parse("PORT", DEFAULT_PORT);

        let config = Self {
            port,
            bind_address: format!("[::]:{}", port),

            binding_name: std::env::var("BINDING_NAME")
                .unwrap_or_else(|_| DEFAULT_BINDING_NAME.to_string()),
            binding_operation: std::env::var("BINDING_OPERATION")
                .unwrap_or_else(|_| DEFAULT_BINDING_OPERATION.to_string()),

            send_interval: Duration::from_millis(env_parse(
                "SEND_INTERVAL_MS",
                DEFAULT_SEND_INTERVAL_MS,
            )),
            max_send_attempts: env_parse("MAX_SEND_ATTEMPTS", DEFAULT_MAX_SEND_ATTEMPTS),
            initial_backoff: Duration::from_millis(env_parse(
                "INITIAL_BACKOFF_MS",
                DEFAULT_INITIAL_BACKOFF_MS,
            )),
            backoff_ceiling: Duration::from_millis(env_parse(
                "BACKOFF_CEILING_MS",
                DEFAULT_BACKOFF_CEILING_MS,
            )),

            transport_queue_capacity: env_parse(
                "TRANSPORT_QUEUE_CAPACITY",
                DEFAULT_TRANSPORT_QUEUE_CAPACITY,
            ),
            visibility_timeout: Duration::from_millis(env_parse(
                "VISIBILITY_TIMEOUT_MS",
                DEFAULT_VISIBILITY_TIMEOUT_MS,
            )),
            max_delivery_attempts: env_parse(
                "MAX_DELIVERY_ATTEMPTS",
                DEFAULT_MAX_DELIVERY_ATTEMPTS,
            ),

            idempotency_retention: std::env::var("IDEMPOTENCY_RETENTION")
                .ok()
                .and_then(|v| parse_retention(&v))
                .unwrap_or(Duration::from_secs(DEFAULT_IDEMPOTENCY_RETENTION_SECS)),
            eviction_interval: Duration::from_secs(env_parse(
                "EVICTION_INTERVAL_SECS",
                DEFAULT_EVICTION_INTERVAL_SECS,
            )),

            shutdown_grace: Duration::from_millis(env_parse(
                "SHUTDOWN_GRACE_MS",
                DEFAULT_SHUTDOWN_GRACE_MS,
            )),

            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants
    pub fn validate(&self) -> Result<()> {
        if self.binding_name.is_empty() {
            anyhow::bail!("BINDING_NAME must not be empty");
        }
        if !self
            .binding_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!(
                "BINDING_NAME '{}' must be alphanumeric (plus '-'/'_') to form a valid route",
                self.binding_name
            );
        }
        if self.max_send_attempts == 0 {
            anyhow::bail!("MAX_SEND_ATTEMPTS must be at least 1");
        }
        if self.max_delivery_attempts == 0 {
            anyhow::bail!("MAX_DELIVERY_ATTEMPTS must be at least 1");
        }
        if self.transport_queue_capacity == 0 {
            anyhow::bail!("TRANSPORT_QUEUE_CAPACITY must be at least 1");
        }
        if self.visibility_timeout.is_zero() {
            anyhow::bail!("VISIBILITY_TIMEOUT_MS must be at least 1");
        }
        Ok(())
    }

    /// HTTP route the transport delivers inbound messages to
    pub fn binding_route(&self) -> String {
        format!("/{}", self.binding_name)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse a retention window such as `24h`, `30m`, `90s` or bare seconds
fn parse_retention(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (number, unit_secs) = match value.as_bytes()[value.len() - 1] {
        b'h' => (&value[..value.len() - 1], 3600),
        b'm' => (&value[..value.len() - 1], 60),
        b's' => (&value[..value.len() - 1], 1),
        _ => (value, 1),
    };

    number
        .parse::<u64>()
        .ok()
        .map(|n| Duration::from_secs(n * unit_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_VARS: [&str; 13] = [
        "PORT",
        "BINDING_NAME",
        "BINDING_OPERATION",
        "SEND_INTERVAL_MS",
        "MAX_SEND_ATTEMPTS",
        "INITIAL_BACKOFF_MS",
        "BACKOFF_CEILING_MS",
        "TRANSPORT_QUEUE_CAPACITY",
        "VISIBILITY_TIMEOUT_MS",
        "MAX_DELIVERY_ATTEMPTS",
        "IDEMPOTENCY_RETENTION",
        "EVICTION_INTERVAL_SECS",
        "SHUTDOWN_GRACE_MS",
    ];

    fn clear_env() {
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();

        let config = Config::from_env().unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.binding_name, "busbinding");
        assert_eq!(config.binding_operation, "create");
        assert_eq!(config.send_interval, Duration::from_millis(200));
        assert_eq!(config.max_send_attempts, 5);
        assert_eq!(config.backoff_ceiling, Duration::from_secs(30));
        assert_eq!(config.idempotency_retention, Duration::from_secs(86_400));
        assert_eq!(config.binding_route(), "/busbinding");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("PORT", "9090");
        std::env::set_var("BINDING_NAME", "orders");
        std::env::set_var("SEND_INTERVAL_MS", "50");
        std::env::set_var("IDEMPOTENCY_RETENTION", "30m");

        let config = Config::from_env().unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.bind_address, "[::]:9090");
        assert_eq!(config.binding_route(), "/orders");
        assert_eq!(config.send_interval, Duration::from_millis(50));
        assert_eq!(config.idempotency_retention, Duration::from_secs(1800));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_binding_name_rejected() {
        clear_env();
        std::env::set_var("BINDING_NAME", "orders/extra");

        assert!(Config::from_env().is_err());

        clear_env();
    }

    #[test]
    fn test_parse_retention() {
        assert_eq!(parse_retention("24h"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_retention("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_retention("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_retention("3600"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_retention(""), None);
        assert_eq!(parse_retention("soon"), None);
    }
}
