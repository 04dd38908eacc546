//! Environment-driven configuration
//!
//! Every setting is optional. [`Config::from_env`] reads `HEARTH_*` variables
//! and falls back to the component defaults.

use crate::client::ClientConfig;
use crate::error::{GatewayError, Result};
use crate::forwarder::ForwarderConfig;
use crate::hub::HubConfig;
use hearth_core::EventType;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(GatewayError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Full gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket listener address
    pub listen_addr: SocketAddr,
    /// Metrics and health listener address
    pub metrics_addr: SocketAddr,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Registry and maintenance settings
    pub hub: HubConfig,
    /// Per-connection settings
    pub client: ClientConfig,
    /// Event forwarding settings
    pub forwarder: ForwarderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            hub: HubConfig::default(),
            client: ClientConfig::default(),
            forwarder: ForwarderConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `HEARTH_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Config::default();

        let hub = HubConfig {
            max_clients: env.parse("HEARTH_MAX_CLIENTS", defaults.hub.max_clients)?,
            heartbeat_interval: env.secs(
                "HEARTH_HEARTBEAT_INTERVAL_SECS",
                defaults.hub.heartbeat_interval,
            )?,
            maintenance_interval: env.secs(
                "HEARTH_MAINTENANCE_INTERVAL_SECS",
                defaults.hub.maintenance_interval,
            )?,
            client_timeout: env.secs("HEARTH_CLIENT_TIMEOUT_SECS", defaults.hub.client_timeout)?,
            ..defaults.hub
        };

        let client = ClientConfig {
            queue_capacity: env.parse("HEARTH_QUEUE_CAPACITY", defaults.client.queue_capacity)?,
            ping_interval: env.secs("HEARTH_PING_INTERVAL_SECS", defaults.client.ping_interval)?,
            pong_timeout: env.secs("HEARTH_PONG_TIMEOUT_SECS", defaults.client.pong_timeout)?,
            write_timeout: env.secs("HEARTH_WRITE_TIMEOUT_SECS", defaults.client.write_timeout)?,
            max_message_size: env
                .parse("HEARTH_MAX_MESSAGE_SIZE", defaults.client.max_message_size)?,
            inbound_rate: env.parse("HEARTH_INBOUND_RATE", defaults.client.inbound_rate)?,
            inbound_burst: env.parse("HEARTH_INBOUND_BURST", defaults.client.inbound_burst)?,
            ..defaults.client
        };

        let max_events_per_second = env.parse(
            "HEARTH_MAX_EVENTS_PER_SECOND",
            defaults.forwarder.max_events_per_second,
        )?;
        let forwarder = ForwarderConfig {
            max_events_per_second,
            event_burst: env.parse("HEARTH_EVENT_BURST", max_events_per_second)?,
            batch_events: env.parse("HEARTH_BATCH_EVENTS", defaults.forwarder.batch_events)?,
            batch_window: env.millis("HEARTH_BATCH_WINDOW_MS", defaults.forwarder.batch_window)?,
            max_batch_size: env.parse("HEARTH_MAX_BATCH_SIZE", defaults.forwarder.max_batch_size)?,
            default_event_types: env.event_types(
                "HEARTH_DEFAULT_EVENT_TYPES",
                defaults.forwarder.default_event_types,
            )?,
            max_errors_retained: env.parse(
                "HEARTH_MAX_ERRORS_RETAINED",
                defaults.forwarder.max_errors_retained,
            )?,
            ..defaults.forwarder
        };

        let config = Config {
            listen_addr: env.parse("HEARTH_LISTEN_ADDR", defaults.listen_addr)?,
            metrics_addr: env.parse("HEARTH_METRICS_ADDR", defaults.metrics_addr)?,
            log_level: env.get("HEARTH_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: env.parse("HEARTH_LOG_FORMAT", defaults.log_format)?,
            hub,
            client,
            forwarder,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.client.queue_capacity == 0 {
            return Err(GatewayError::Config(
                "HEARTH_QUEUE_CAPACITY must be at least 1".into(),
            ));
        }
        if self.hub.max_clients == 0 {
            return Err(GatewayError::Config(
                "HEARTH_MAX_CLIENTS must be at least 1".into(),
            ));
        }
        if self.client.pong_timeout <= self.client.ping_interval {
            return Err(GatewayError::Config(
                "HEARTH_PONG_TIMEOUT_SECS must exceed HEARTH_PING_INTERVAL_SECS".into(),
            ));
        }
        if self.forwarder.batch_events && self.forwarder.max_batch_size == 0 {
            return Err(GatewayError::Config(
                "HEARTH_MAX_BATCH_SIZE must be at least 1 when batching".into(),
            ));
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| GatewayError::Config(format!("{key}={raw}: {e}"))),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn event_types(&self, key: &str, default: Vec<EventType>) -> Result<Vec<EventType>> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<EventType>()
                    .map_err(|e| GatewayError::Config(format!("{key}: {e}")))
            })
            .collect()
    }
}
