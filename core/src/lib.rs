#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! muster-core — the networking substrate shared by the controller and agent.
//!
//! Both sides of the fabric speak the same length-prefixed wire format and
//! use the same [`Connection`] abstraction on top of it:
//!
//! - `frame` — the wire unit and its `tokio_util` codec
//! - `connection` — a framed connection with a handler table and per-frame
//!   worker dispatch
//! - `net` — endpoint introspection and client connect with timeout
//! - `proto` — command constants, `key=value` header parsing, formatting
//!   helpers

pub mod connection;
pub mod frame;
pub mod net;
pub mod proto;

pub use connection::{handler, ConnId, ConnOptions, Connection, Handler};
pub use frame::{Frame, FrameCodec, MAX_FRAME_SIZE};
pub use net::{connect_with_timeout, AddrFamily, Endpoint};
