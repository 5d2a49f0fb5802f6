//! Configuration resolution for the terminal bridge.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BRIDGE_PORT` | 8080 | HTTP listen port |
//! | `BRIDGE_HOSTS_FILE` | `hosts.json` | Credential records |
//! | `SSH_CONNECT_TIMEOUT` | 30s | Dial + authentication timeout in seconds |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `BRIDGE_TERM` | `xterm-256color` | PTY terminal type |
//! | `BRIDGE_COLS` | 120 | PTY width in columns |
//! | `BRIDGE_ROWS` | 32 | PTY height in rows |
//! | `BRIDGE_STATS_INTERVAL` | 5s | Host-stats push period in seconds |
//! | `BRIDGE_HOST_KEYS` | unset | `accept-any` or comma-separated `SHA256:` fingerprints |

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default HTTP listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Default credential records file
pub const DEFAULT_HOSTS_FILE: &str = "hosts.json";

/// Default SSH dial + authentication timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default PTY terminal type
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Default PTY width
pub const DEFAULT_COLS: u32 = 120;

/// Default PTY height
pub const DEFAULT_ROWS: u32 = 32;

/// Default host-stats push period in seconds
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

/// Bound on waiting for pty-req / shell replies
pub const CHANNEL_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the closing handshake when a session exits
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

pub const PORT_ENV_VAR: &str = "BRIDGE_PORT";
pub const HOSTS_FILE_ENV_VAR: &str = "BRIDGE_HOSTS_FILE";
pub const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub const TERM_ENV_VAR: &str = "BRIDGE_TERM";
pub const COLS_ENV_VAR: &str = "BRIDGE_COLS";
pub const ROWS_ENV_VAR: &str = "BRIDGE_ROWS";
pub const STATS_INTERVAL_ENV_VAR: &str = "BRIDGE_STATS_INTERVAL";
pub const HOST_KEYS_ENV_VAR: &str = "BRIDGE_HOST_KEYS";

/// Resolve a value with priority: parameter -> env var -> default.
///
/// Unparseable environment values fall through to the default.
fn resolve<T: FromStr>(param: Option<T>, var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

pub fn resolve_port(port_param: Option<u16>) -> u16 {
    resolve(port_param, PORT_ENV_VAR, DEFAULT_PORT)
}

pub fn resolve_hosts_file(path_param: Option<String>) -> String {
    resolve(path_param, HOSTS_FILE_ENV_VAR, DEFAULT_HOSTS_FILE.to_string())
}

/// Resolve the connect timeout, returning a `Duration`.
pub fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

/// Resolve the compression setting; the env var accepts `true`/`1`.
pub fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

pub fn resolve_term(term_param: Option<String>) -> String {
    resolve(term_param, TERM_ENV_VAR, DEFAULT_TERM.to_string())
}

/// Resolve PTY dimensions as `(cols, rows)`. Zero is treated as unset.
pub fn resolve_dimensions(cols_param: Option<u32>, rows_param: Option<u32>) -> (u32, u32) {
    let cols = resolve(cols_param, COLS_ENV_VAR, DEFAULT_COLS);
    let rows = resolve(rows_param, ROWS_ENV_VAR, DEFAULT_ROWS);
    (
        if cols == 0 { DEFAULT_COLS } else { cols },
        if rows == 0 { DEFAULT_ROWS } else { rows },
    )
}

pub fn resolve_stats_interval(interval_param: Option<u64>) -> Duration {
    let secs = resolve(
        interval_param,
        STATS_INTERVAL_ENV_VAR,
        DEFAULT_STATS_INTERVAL_SECS,
    );
    Duration::from_secs(secs.max(1))
}

/// Raw host key policy string, if configured.
pub fn resolve_host_keys(param: Option<String>) -> Option<String> {
    param.or_else(|| env::var(HOST_KEYS_ENV_VAR).ok())
}

/// Terminal allocation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalConfig {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl TerminalConfig {
    pub fn from_env() -> Self {
        let (cols, rows) = resolve_dimensions(None, None);
        Self {
            term: resolve_term(None),
            cols,
            rows,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            term: DEFAULT_TERM.to_string(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}
