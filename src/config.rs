//! Configuration module for the event bus and order engine

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the health, metrics and websocket server binds to
    pub listen_addr: String,

    /// Optional websocket endpoint of the market tick feed
    pub feed_endpoint: Option<String>,

    /// Symbols requested from the tick feed (e.g., ["BTC/USD", "ETH/USD"])
    pub symbols: Vec<String>,

    /// Bound of each connection's delivery queue
    pub queue_capacity: usize,

    /// Deadline applied to every exchange adapter call
    pub adapter_timeout_ms: u64,

    /// Status queries attempted after a timed-out adapter call before the
    /// order is forced to `failed`
    pub max_adapter_timeouts: u32,

    /// Reconciliation settings for orders whose exchange state is unknown
    pub reconcile_interval_secs: u64,
    pub max_reconcile_attempts: u32,

    /// How long terminal orders stay in memory after their last update;
    /// 0 keeps them for the process lifetime
    pub order_retention_secs: u64,

    /// Write-ahead journal location; transitions are not persisted when unset
    pub journal_path: Option<PathBuf>,

    /// Order gateway base URL; the paper exchange is used when unset
    pub exchange_gateway_url: Option<String>,

    /// Venue name stamped on orders that do not specify one
    pub exchange_name: String,

    /// Reconnection settings for the tick feed
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    /// Health check interval in seconds
    pub health_check_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTC/USD,ETH/USD".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            feed_endpoint: optional_var("FEED_ENDPOINT"),
            symbols,
            queue_capacity: parse_var("DELIVERY_QUEUE_CAPACITY", defaults.queue_capacity),
            adapter_timeout_ms: parse_var("ADAPTER_TIMEOUT_MS", defaults.adapter_timeout_ms),
            max_adapter_timeouts: parse_var("MAX_ADAPTER_TIMEOUTS", defaults.max_adapter_timeouts),
            reconcile_interval_secs: parse_var(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            ),
            max_reconcile_attempts: parse_var(
                "MAX_RECONCILE_ATTEMPTS",
                defaults.max_reconcile_attempts,
            ),
            order_retention_secs: parse_var("ORDER_RETENTION_SECS", defaults.order_retention_secs),
            journal_path: optional_var("JOURNAL_PATH").map(PathBuf::from),
            exchange_gateway_url: optional_var("EXCHANGE_GATEWAY_URL"),
            exchange_name: env::var("EXCHANGE_NAME").unwrap_or(defaults.exchange_name),
            reconnect_delay_ms: parse_var("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            max_reconnect_attempts: parse_var(
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            health_check_interval_secs: parse_var(
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(CoreError::Config(
                "delivery queue capacity must be at least 1".to_string(),
            ));
        }
        if self.adapter_timeout_ms == 0 {
            return Err(CoreError::Config(
                "adapter timeout must be greater than zero".to_string(),
            ));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(CoreError::Config(
                "reconcile interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn order_retention(&self) -> Option<Duration> {
        (self.order_retention_secs > 0).then(|| Duration::from_secs(self.order_retention_secs))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9090".to_string(),
            feed_endpoint: None,
            symbols: vec!["BTC/USD".to_string(), "ETH/USD".to_string()],
            queue_capacity: 1024,
            adapter_timeout_ms: 5000,
            max_adapter_timeouts: 3,
            reconcile_interval_secs: 30,
            max_reconcile_attempts: 20,
            order_retention_secs: 3600,
            journal_path: None,
            exchange_gateway_url: None,
            exchange_name: "paper".to_string(),
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 10,
            health_check_interval_secs: 30,
        }
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
