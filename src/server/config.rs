//! Application configuration types

use runbus_core::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub worker: WorkerAppConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which broker carries the traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process broker; the controller hosts its own worker
    Memory,
    /// Redis pub/sub
    Redis,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Seconds to wait for a reply on request topics
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: f64,
}

fn default_broker_kind() -> BrokerKind {
    BrokerKind::Redis
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_request_timeout_secs() -> f64 {
    5.0
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            url: default_broker_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl BrokerConfig {
    /// Request timeout, falling back to the default for unusable values.
    pub fn request_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.request_timeout_secs)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_request_timeout_secs()))
    }
}

/// Worker configuration (exposed to TOML)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAppConfig {
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
}

fn default_checkpoint_interval_ms() -> u64 {
    50
}

fn default_event_capacity() -> usize {
    256
}

fn default_pending_ttl_secs() -> u64 {
    600
}

impl Default for WorkerAppConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            event_capacity: default_event_capacity(),
            pending_ttl_secs: default_pending_ttl_secs(),
        }
    }
}

impl WorkerAppConfig {
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            checkpoint_interval: Duration::from_millis(self.checkpoint_interval_ms.max(1)),
            event_capacity: self.event_capacity.max(1),
            pending_ttl: Duration::from_secs(self.pending_ttl_secs.max(1)),
        }
    }
}

/// Controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Seconds `controller run` waits; unset waits forever
    #[serde(default)]
    pub default_timeout_secs: Option<f64>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Filter directives used when `RUST_LOG` is not set.
    pub fn filter_directives(&self) -> String {
        ["runbus", "runbus_core", "runbus_bus", "runbus_service"]
            .iter()
            .map(|target| format!("{}={}", target, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.broker.kind, BrokerKind::Redis);
        assert_eq!(config.broker.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.controller.default_timeout_secs, None);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_bad_request_timeout_falls_back() {
        let broker = BrokerConfig {
            request_timeout_secs: -3.0,
            ..BrokerConfig::default()
        };
        assert_eq!(broker.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_worker_config_conversion() {
        let worker = WorkerAppConfig {
            checkpoint_interval_ms: 20,
            event_capacity: 0,
            pending_ttl_secs: 0,
        }
        .to_worker_config();
        assert_eq!(worker.checkpoint_interval, Duration::from_millis(20));
        assert_eq!(worker.event_capacity, 1);
        assert_eq!(worker.pending_ttl, Duration::from_secs(1));
    }

    #[test]
    fn test_filter_directives() {
        let logging = LoggingConfig {
            level: "debug".into(),
            format: LogFormat::Json,
        };
        let directives = logging.filter_directives();
        assert!(directives.starts_with("runbus=debug,"));
        assert!(directives.contains("runbus_bus=debug"));
    }
}
