//! Configuration parsing for the TMS streaming client.
//!
//! All settings come from a single JSON file. Every section is optional and
//! falls back to defaults, so `{}` is a valid config.
//!
//! # Example config
//!
//! ```json
//! {
//!   "log": { "level": "info", "dir": "/tmp/log" },
//!   "registry": { "id_base": 1000, "id_stride": 100 },
//!   "listener": { "poll_timeout_ms": 1000, "max_drain_failures": 1 },
//!   "subscriptions": {
//!     "vwap_instruments": ["IBM", "MSFT"],
//!     "portfolio_listeners": 2,
//!     "target_snapshot": true
//!   },
//!   "simulator": { "update_interval_ms": 250 }
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::TmsError;

/// Number of correlation tags each listener reserves above its id.
pub const TAGS_PER_LISTENER: u64 = 4;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub registry: RegistryConfig,
    pub listener: ListenerConfig,
    pub subscriptions: SubscriptionsConfig,
    pub simulator: SimulatorConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), TmsError> {
        self.registry.validate()?;
        self.listener.validate()?;
        self.simulator.validate()
    }
}

/// Logging block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Option<String>,
    /// Directory for daily-rotating log files.
    pub dir: Option<String>,
}

/// Listener id allocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// First id handed out.
    pub id_base: u64,
    /// Distance between consecutive ids.
    pub id_stride: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            id_base: 1000,
            id_stride: 100,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), TmsError> {
        if self.id_base == 0 {
            return Err(TmsError::Config("registry.id_base must be positive".into()));
        }
        if self.id_stride <= TAGS_PER_LISTENER {
            return Err(TmsError::Config(format!(
                "registry.id_stride must exceed {TAGS_PER_LISTENER} (got {})",
                self.id_stride
            )));
        }
        Ok(())
    }
}

/// Polling and drain behavior of each listener thread.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Deadline of every completion queue poll. Also bounds how long a stop
    /// request can go unnoticed.
    pub poll_timeout_ms: u64,
    /// Give up draining after this many consecutive poll timeouts.
    /// `None` waits for the peer indefinitely.
    pub max_drain_timeouts: Option<u32>,
    /// Consider the peer closed after this many consecutive failed
    /// completions while draining.
    pub max_drain_failures: u32,
    /// Pin listener threads to this CPU core.
    pub cpu_core: Option<i32>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1000,
            max_drain_timeouts: None,
            max_drain_failures: 1,
            cpu_core: None,
        }
    }
}

impl ListenerConfig {
    #[inline]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), TmsError> {
        if self.poll_timeout_ms == 0 {
            return Err(TmsError::Config("listener.poll_timeout_ms must be positive".into()));
        }
        if self.max_drain_failures == 0 {
            return Err(TmsError::Config("listener.max_drain_failures must be positive".into()));
        }
        if self.max_drain_timeouts == Some(0) {
            return Err(TmsError::Config("listener.max_drain_timeouts must be positive".into()));
        }
        Ok(())
    }
}

/// Which subscribers the runner starts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionsConfig {
    /// One interval-VWAP subscriber per instrument.
    pub vwap_instruments: Vec<String>,
    /// Number of stateless portfolio listeners.
    pub portfolio_listeners: u32,
    /// Take one market target snapshot at startup.
    pub target_snapshot: bool,
    /// Initial debug tracing flag of every listener.
    pub debug: bool,
}

/// Synthetic feed used by the runner's loopback transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub update_interval_ms: u64,
    /// Number of targets in the initial target snapshot.
    pub target_count: u32,
    pub portfolios: Vec<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 250,
            target_count: 5,
            portfolios: vec!["Growth".to_string(), "Income".to_string()],
        }
    }
}

impl SimulatorConfig {
    #[inline]
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn validate(&self) -> Result<(), TmsError> {
        if self.update_interval_ms == 0 {
            return Err(TmsError::Config("simulator.update_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Parse and validate a config from a JSON string.
pub fn parse_config(content: &str) -> anyhow::Result<AppConfig> {
    let config: AppConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.registry.id_base, 1000);
        assert_eq!(config.registry.id_stride, 100);
        assert_eq!(config.listener.poll_timeout(), Duration::from_secs(1));
        assert_eq!(config.listener.max_drain_timeouts, None);
        assert_eq!(config.listener.max_drain_failures, 1);
        assert!(config.subscriptions.vwap_instruments.is_empty());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = parse_config(
            r#"{
                "listener": { "poll_timeout_ms": 50, "max_drain_timeouts": 3 },
                "subscriptions": { "vwap_instruments": ["IBM"], "debug": true }
            }"#,
        )
        .unwrap();
        assert_eq!(config.listener.poll_timeout(), Duration::from_millis(50));
        assert_eq!(config.listener.max_drain_timeouts, Some(3));
        assert_eq!(config.listener.max_drain_failures, 1);
        assert_eq!(config.subscriptions.vwap_instruments, vec!["IBM"]);
        assert!(config.subscriptions.debug);
    }

    #[test]
    fn stride_must_leave_room_for_tags() {
        let err = parse_config(r#"{ "registry": { "id_stride": 4 } }"#).unwrap_err();
        assert!(err.to_string().contains("id_stride"));
        assert!(parse_config(r#"{ "registry": { "id_stride": 5 } }"#).is_ok());
    }

    #[test]
    fn zero_poll_timeout_rejected() {
        assert!(parse_config(r#"{ "listener": { "poll_timeout_ms": 0 } }"#).is_err());
        assert!(parse_config(r#"{ "listener": { "max_drain_failures": 0 } }"#).is_err());
    }
}
