#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! muster agent library — the pieces the `muster-agent` binary wires into
//! its reconnect loop:
//!
//! - `handlers` — the agent-side wire handler set
//! - `telemetry` — CPU/memory/disk gathering from `/proc` and `statvfs`
//! - `exec` — shell execution with chunked stdout streaming
//! - `config` — TOML + env-var configuration

pub mod config;
pub mod exec;
pub mod handlers;
pub mod telemetry;

pub use config::Config;
