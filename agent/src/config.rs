//! Agent configuration loading and defaults.
//!
//! Same precedence chain as the controller: env vars (`MUSTER_AGENT_ADDR`,
//! `MUSTER_AGENT_TOKEN`) > config file (`--config <path>` or
//! `muster-agent.toml` in CWD) > compiled defaults.
//!
//! ```toml
//! [controller]
//! addr = "127.0.0.1:60119"
//! connect_timeout_secs = 5
//!
//! [auth]
//! token = "your-secret-token"
//!
//! [reconnect]
//! initial_delay_secs = 1
//! max_delay_secs = 30
//! rejoin_delay_secs = 2
//!
//! [telemetry]
//! disk_path = "/"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where to find the controller.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// `host:port` of the controller (default `127.0.0.1:60119`).
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Per-candidate connect timeout in seconds (default 5).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared token sent in the AUTH frame after connecting.
    /// Override with `MUSTER_AGENT_TOKEN`.
    #[serde(default = "default_token")]
    pub token: String,
}

/// Exponential backoff for the reconnect loop.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// First retry delay in seconds (default 1). Doubles per failure.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    /// Backoff cap in seconds (default 30).
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Pause before redialing after an established connection drops
    /// (default 2).
    #[serde(default = "default_rejoin_delay_secs")]
    pub rejoin_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Filesystem path measured for the disk figures (default `/`).
    #[serde(default = "default_disk_path")]
    pub disk_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_addr() -> String {
    "127.0.0.1:60119".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_token() -> String {
    "change-me".to_string()
}
fn default_initial_delay_secs() -> u64 {
    1
}
fn default_max_delay_secs() -> u64 {
    30
}
fn default_rejoin_delay_secs() -> u64 {
    2
}
fn default_disk_path() -> String {
    "/".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            rejoin_delay_secs: default_rejoin_delay_secs(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            disk_path: default_disk_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            auth: AuthConfig::default(),
            reconnect: ReconnectConfig::default(),
            telemetry: TelemetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("muster-agent.toml").exists() {
            let content = std::fs::read_to_string("muster-agent.toml")
                .expect("Failed to read muster-agent.toml");
            toml::from_str(&content).expect("Failed to parse muster-agent.toml")
        } else {
            Config::default()
        };

        if let Ok(addr) = std::env::var("MUSTER_AGENT_ADDR") {
            config.controller.addr = addr;
        }
        if let Ok(token) = std::env::var("MUSTER_AGENT_TOKEN") {
            config.auth.token = token;
        }

        config
    }
}
