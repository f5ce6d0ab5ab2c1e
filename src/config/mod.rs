//! # Configuration Management Module
//!
//! Loads the TOML configuration file, applies environment overrides and derives
//! the values the runtime components are built from.
//!
//! ## Configuration Structure
//!
//! - [`GatewaySettings`] - modem port, baud rate, SIM PIN, pacing and command timeout
//! - [`SchedulerSettings`] - reconciliation interval and look-ahead window
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use smsgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?.with_env_overrides();
//!     let gateway_config = config.gateway_config();
//!     println!("Modem port: {}", gateway_config.port());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [gateway]
//! port = "/dev/ttyUSB0"     # or "auto" for the first USB serial port
//! baud_rate = 115200
//! # sim_pin = "1234"
//! rate_limit_ms = 1000
//! command_timeout_ms = 10000
//!
//! [scheduler]
//! reconcile_interval_secs = 60
//! lookahead_hours = 24
//!
//! [logging]
//! level = "info"
//! file = "smsgate.log"
//! ```
//!
//! ## Environment Integration
//!
//! `SMS_GATEWAY_PORT` and `SIM_PIN` override the file values. Precedence:
//! CLI args > Environment > Config file > Defaults

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

/// Lowest accepted gap between two sends. Modem and carrier throughput cap.
pub const MIN_RATE_LIMIT_MS: u64 = 1000;

/// Port value that requests auto-detection of the first USB serial device.
pub const AUTO_PORT: &str = "auto";

const DEFAULT_PORT: &str = "/dev/ttyUSB0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub port: String,
    pub baud_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_pin: Option<String>,
    /// Minimum gap between consecutive sends (ms). Values below 1000ms are clamped.
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
    /// Bound on waiting for a terminal response to one AT command (ms).
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub reconcile_interval_secs: u64,
    pub lookahead_hours: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            lookahead_hours: 24,
        }
    }
}

impl SchedulerSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn lookahead(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lookahead_hours as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Serial link parameters. Immutable once resolved at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    port: String,
    baud_rate: u32,
    sim_pin: Option<String>,
}

impl GatewayConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32, sim_pin: Option<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            sim_pin: sim_pin.filter(|p| !p.is_empty()),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn sim_pin(&self) -> Option<&str> {
        self.sim_pin.as_deref()
    }
}

/// Pacing and timeout values for the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTuning {
    pub rate_limit: Duration,
    pub command_timeout: Duration,
}

impl Default for GatewayTuning {
    fn default() -> Self {
        Self {
            rate_limit: Duration::from_millis(MIN_RATE_LIMIT_MS),
            command_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Apply `SMS_GATEWAY_PORT` and `SIM_PIN` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = lookup("SMS_GATEWAY_PORT").filter(|p| !p.is_empty()) {
            self.gateway.port = port;
        }
        if let Some(pin) = lookup("SIM_PIN").filter(|p| !p.is_empty()) {
            self.gateway.sim_pin = Some(pin);
        }
        self
    }

    /// Resolve the immutable link parameters, auto-detecting the port when set to `"auto"`.
    pub fn gateway_config(&self) -> GatewayConfig {
        let port = if self.gateway.port.eq_ignore_ascii_case(AUTO_PORT) {
            crate::modem::transport::detect_port().unwrap_or_else(|| {
                warn!(
                    "No USB serial port detected; falling back to {}",
                    DEFAULT_PORT
                );
                DEFAULT_PORT.to_string()
            })
        } else {
            self.gateway.port.clone()
        };
        GatewayConfig::new(port, self.gateway.baud_rate, self.gateway.sim_pin.clone())
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        self.scheduler.clone()
    }

    pub fn tuning(&self) -> GatewayTuning {
        let defaults = GatewayTuning::default();
        let mut rate_limit_ms = self.gateway.rate_limit_ms.unwrap_or(MIN_RATE_LIMIT_MS);
        if rate_limit_ms < MIN_RATE_LIMIT_MS {
            warn!(
                "Configured rate_limit_ms={}ms is below {}ms; clamping to {}ms",
                rate_limit_ms, MIN_RATE_LIMIT_MS, MIN_RATE_LIMIT_MS
            );
            rate_limit_ms = MIN_RATE_LIMIT_MS;
        }
        GatewayTuning {
            rate_limit: Duration::from_millis(rate_limit_ms),
            command_timeout: self
                .gateway
                .command_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.command_timeout),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: GatewaySettings {
                port: DEFAULT_PORT.to_string(),
                baud_rate: 115200,
                sim_pin: None,
                rate_limit_ms: Some(MIN_RATE_LIMIT_MS),
                command_timeout_ms: Some(10_000),
            },
            scheduler: SchedulerSettings::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("smsgate.log".to_string()),
            },
        }
    }
}
