//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `MUSTER_TOKEN`, `MUSTER_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `muster.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:60119"
//!
//! [auth]
//! token = "your-secret-token"
//!
//! [limits]
//! max_frame_size = 16777216   # 16 MiB
//! read_chunk = 4096
//! tail_limit = 65536          # 64 KiB
//!
//! [poll]
//! ping_interval_ms = 10000
//! status_interval_ms = 5000
//! gc_interval_ms = 60000
//! gc_max_age_secs = 600
//!
//! [exec]
//! wait_timeout_secs = 60
//! poll_interval_ms = 150
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:60119`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared agent token. Override with `MUSTER_TOKEN` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_token")]
    pub token: String,
}

/// Per-connection wire limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Cap on a single frame body in bytes (default 16 MiB).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Read buffer chunk size in bytes (default 4096).
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Cap on a command record's rolling output tail (default 64 KiB).
    #[serde(default = "default_tail_limit")]
    pub tail_limit: usize,
}

/// Periodic job intervals.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// PING keepalive broadcast interval in milliseconds (default 10 000).
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// STATUS poll broadcast interval in milliseconds (default 5000).
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// Finished-record GC interval in milliseconds (default 60 000).
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
    /// Age after which finished records are collected, in seconds (default 600).
    #[serde(default = "default_gc_max_age_secs")]
    pub gc_max_age_secs: u64,
}

/// Remote execution wait settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    /// Wall-clock timeout waiting for an execution to finish (default 60 s).
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Interval between result polls in milliseconds (default 150).
    #[serde(default = "default_exec_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:60119".to_string()
}
fn default_token() -> String {
    "change-me".to_string()
}
fn default_max_frame_size() -> usize {
    16 * 1024 * 1024
}
fn default_read_chunk() -> usize {
    4096
}
fn default_tail_limit() -> usize {
    64 * 1024
}
fn default_ping_interval_ms() -> u64 {
    10_000
}
fn default_status_interval_ms() -> u64 {
    5000
}
fn default_gc_interval_ms() -> u64 {
    60_000
}
fn default_gc_max_age_secs() -> u64 {
    600
}
fn default_wait_timeout_secs() -> u64 {
    60
}
fn default_exec_poll_interval_ms() -> u64 {
    150
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
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

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            read_chunk: default_read_chunk(),
            tail_limit: default_tail_limit(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            status_interval_ms: default_status_interval_ms(),
            gc_interval_ms: default_gc_interval_ms(),
            gc_max_age_secs: default_gc_max_age_secs(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_wait_timeout_secs(),
            poll_interval_ms: default_exec_poll_interval_ms(),
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
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            poll: PollConfig::default(),
            exec: ExecConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `muster.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("muster.toml").exists() {
            let content =
                std::fs::read_to_string("muster.toml").expect("Failed to read muster.toml");
            toml::from_str(&content).expect("Failed to parse muster.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(token) = std::env::var("MUSTER_TOKEN") {
            config.auth.token = token;
        }
        if let Ok(listen) = std::env::var("MUSTER_LISTEN") {
            config.server.listen = listen;
        }

        config
    }
}
