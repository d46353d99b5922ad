//! Protocol command names, header parsing, and formatting helpers.

use std::collections::HashMap;

/// Canonical command tokens.
pub mod commands {
    pub const AUTH: &str = "AUTH";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const STATUS: &str = "STATUS";
    pub const EXEC: &str = "EXEC";
    pub const EXEC_OUT: &str = "EXEC_OUT";
    pub const EXEC_DONE: &str = "EXEC_DONE";
    pub const BYE: &str = "BYE";
    pub const OK: &str = "OK";
    pub const ERR: &str = "ERR";
}

/// Parse a `key=value` header line.
///
/// Tokens split on whitespace; each token splits on the first `=`. Tokens
/// without `=` are ignored, and later duplicates overwrite earlier ones.
pub fn parse_kv(s: &str) -> HashMap<String, String> {
    let mut kv = HashMap::new();
    for token in s.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            kv.insert(key.to_string(), value.to_string());
        }
    }
    kv
}

/// Split a payload into its first line (without the newline) and the rest.
///
/// A payload without any newline is all header with an empty remainder.
pub fn split_first_line(payload: &[u8]) -> (&[u8], &[u8]) {
    match payload.iter().position(|&b| b == b'\n') {
        Some(pos) => (&payload[..pos], &payload[pos + 1..]),
        None => (payload, &[]),
    }
}

/// Render a byte count in binary units (`1.5KiB`, `12GiB`).
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value >= 10.0 {
        format!("{value:.0}{}", UNITS[unit])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

/// Percentage of `used` over `total`; zero when `total` is zero.
pub fn pct(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 * 100.0 / total as f64
}
