//! Configuration resolution for the gateway.
//!
//! Every setting is read from an environment variable (a `.env` file is loaded
//! by `main` through `dotenv`) and falls back to a built-in default when the
//! variable is missing or unparsable. Malformed subnets are the exception and
//! fail startup with a [`ConfigError`].
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WEBSSH_LISTEN_ADDR` | 0.0.0.0 | Listen address |
//! | `WEBSSH_PORT` | 2222 | Listen port |
//! | `SSH_HOST` | - | Default target host for HTTP Basic sessions |
//! | `SSH_PORT` | 22 | Default target port |
//! | `SSH_TERM` | xterm-color | Default terminal type |
//! | `SSH_READY_TIMEOUT_MS` | 20000 | Handshake and authentication bound |
//! | `SSH_KEEPALIVE_INTERVAL_MS` | 120000 | Keepalive interval |
//! | `SSH_KEEPALIVE_COUNT_MAX` | 10 | Unanswered keepalives before dropping |
//! | `SSH_COMPRESSION` | true | Offer zlib compression |
//! | `SSH_ALLOWED_SUBNETS` | - | Comma separated CIDR allowlist for targets |
//! | `SSH_ENV_ALLOWLIST` | - | Comma separated env variable allowlist |
//! | `WEBSSH_ALLOW_REPLAY` | false | Allow credential replay |
//! | `WEBSSH_ALLOW_REAUTH` | true | Allow reauthentication |
//! | `WEBSSH_ALLOW_RECONNECT` | true | Allow client reconnect |
//! | `WEBSSH_AUTO_LOG` | false | Client side session logging |
//! | `WEBSSH_REPLAY_CRLF` | false | Terminate replayed passwords with CRLF |
//! | `WEBSSH_SHUTDOWN_GRACE_SECS` | 300 | Drain countdown length |

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use ipnet::IpNet;
use serde::Serialize;

use super::error::ConfigError;

/// Default listen port
pub(crate) const DEFAULT_LISTEN_PORT: u16 = 2222;

/// Default SSH port of target hosts
pub(crate) const DEFAULT_SSH_PORT: u16 = 22;

/// Default terminal type when the client does not send one
pub(crate) const DEFAULT_TERM: &str = "xterm-color";

/// Default handshake timeout in milliseconds
pub(crate) const DEFAULT_READY_TIMEOUT_MS: u64 = 20_000;

/// Default keepalive interval in milliseconds
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 120_000;

/// Default number of unanswered keepalives
pub(crate) const DEFAULT_KEEPALIVE_COUNT_MAX: usize = 10;

/// Default drain countdown in seconds
pub(crate) const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 300;

pub(crate) const LISTEN_ADDR_ENV_VAR: &str = "WEBSSH_LISTEN_ADDR";
pub(crate) const LISTEN_PORT_ENV_VAR: &str = "WEBSSH_PORT";
pub(crate) const SSH_HOST_ENV_VAR: &str = "SSH_HOST";
pub(crate) const SSH_PORT_ENV_VAR: &str = "SSH_PORT";
pub(crate) const SSH_TERM_ENV_VAR: &str = "SSH_TERM";
pub(crate) const READY_TIMEOUT_ENV_VAR: &str = "SSH_READY_TIMEOUT_MS";
pub(crate) const KEEPALIVE_INTERVAL_ENV_VAR: &str = "SSH_KEEPALIVE_INTERVAL_MS";
pub(crate) const KEEPALIVE_COUNT_ENV_VAR: &str = "SSH_KEEPALIVE_COUNT_MAX";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub(crate) const ALLOWED_SUBNETS_ENV_VAR: &str = "SSH_ALLOWED_SUBNETS";
pub(crate) const ENV_ALLOWLIST_ENV_VAR: &str = "SSH_ENV_ALLOWLIST";
pub(crate) const ALLOW_REPLAY_ENV_VAR: &str = "WEBSSH_ALLOW_REPLAY";
pub(crate) const ALLOW_REAUTH_ENV_VAR: &str = "WEBSSH_ALLOW_REAUTH";
pub(crate) const ALLOW_RECONNECT_ENV_VAR: &str = "WEBSSH_ALLOW_RECONNECT";
pub(crate) const AUTO_LOG_ENV_VAR: &str = "WEBSSH_AUTO_LOG";
pub(crate) const REPLAY_CRLF_ENV_VAR: &str = "WEBSSH_REPLAY_CRLF";
pub(crate) const SHUTDOWN_GRACE_ENV_VAR: &str = "WEBSSH_SHUTDOWN_GRACE_SECS";

/// Settings for outgoing SSH connections.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub default_host: Option<String>,
    pub default_port: u16,
    pub term: String,
    pub ready_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count_max: usize,
    pub compress: bool,
    pub allowed_subnets: Vec<IpNet>,
    pub env_allowlist: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            default_host: None,
            default_port: DEFAULT_SSH_PORT,
            term: DEFAULT_TERM.to_string(),
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
            keepalive_count_max: DEFAULT_KEEPALIVE_COUNT_MAX,
            compress: true,
            allowed_subnets: Vec::new(),
            env_allowlist: Vec::new(),
        }
    }
}

/// Feature switches reported to the client in the `permissions` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub auto_log: bool,
    pub allow_replay: bool,
    pub allow_reconnect: bool,
    pub allow_reauth: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            auto_log: false,
            allow_replay: false,
            allow_reconnect: true,
            allow_reauth: true,
        }
    }
}

/// Process-wide gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub ssh: SshSettings,
    pub permissions: Permissions,
    /// Use `\r\n` instead of `\n` after a replayed password.
    pub replay_crlf: bool,
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_LISTEN_PORT),
            ssh: SshSettings::default(),
            permissions: Permissions::default(),
            replay_crlf: false,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl GatewayConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_ip = match env::var(LISTEN_ADDR_ENV_VAR) {
            Ok(addr) => addr
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidListenAddr(addr))?,
            Err(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let listen_port = resolve_parsed(LISTEN_PORT_ENV_VAR, DEFAULT_LISTEN_PORT);

        let ssh = SshSettings {
            default_host: env::var(SSH_HOST_ENV_VAR).ok().filter(|h| !h.is_empty()),
            default_port: resolve_parsed(SSH_PORT_ENV_VAR, DEFAULT_SSH_PORT),
            term: env::var(SSH_TERM_ENV_VAR)
                .ok()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_TERM.to_string()),
            ready_timeout: Duration::from_millis(resolve_parsed(
                READY_TIMEOUT_ENV_VAR,
                DEFAULT_READY_TIMEOUT_MS,
            )),
            keepalive_interval: Duration::from_millis(resolve_parsed(
                KEEPALIVE_INTERVAL_ENV_VAR,
                DEFAULT_KEEPALIVE_INTERVAL_MS,
            )),
            keepalive_count_max: resolve_parsed(KEEPALIVE_COUNT_ENV_VAR, DEFAULT_KEEPALIVE_COUNT_MAX),
            compress: resolve_bool(COMPRESSION_ENV_VAR, true),
            allowed_subnets: parse_subnets(
                ALLOWED_SUBNETS_ENV_VAR,
                &env::var(ALLOWED_SUBNETS_ENV_VAR).unwrap_or_default(),
            )?,
            env_allowlist: split_list(&env::var(ENV_ALLOWLIST_ENV_VAR).unwrap_or_default()),
        };

        let permissions = Permissions {
            auto_log: resolve_bool(AUTO_LOG_ENV_VAR, false),
            allow_replay: resolve_bool(ALLOW_REPLAY_ENV_VAR, false),
            allow_reconnect: resolve_bool(ALLOW_RECONNECT_ENV_VAR, true),
            allow_reauth: resolve_bool(ALLOW_REAUTH_ENV_VAR, true),
        };

        Ok(Self {
            listen: SocketAddr::new(listen_ip, listen_port),
            ssh,
            permissions,
            replay_crlf: resolve_bool(REPLAY_CRLF_ENV_VAR, false),
            shutdown_grace: Duration::from_secs(resolve_parsed(
                SHUTDOWN_GRACE_ENV_VAR,
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )),
        })
    }

    /// Line ending appended to a replayed password.
    pub fn replay_line_ending(&self) -> &'static str {
        if self.replay_crlf { "\r\n" } else { "\n" }
    }
}

/// Resolve a value with priority: env var -> default. Unparsable values fall back.
fn resolve_parsed<T: std::str::FromStr>(var: &str, default: T) -> T {
    if let Ok(raw) = env::var(var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }
    default
}

/// Resolve a boolean flag: `true`/`1` are true, any other value is false.
fn resolve_bool(var: &str, default: bool) -> bool {
    match env::var(var) {
        Ok(raw) => raw.eq_ignore_ascii_case("true") || raw == "1",
        Err(_) => default,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a comma separated CIDR list. Bare addresses become host routes.
pub(crate) fn parse_subnets(variable: &'static str, raw: &str) -> Result<Vec<IpNet>, ConfigError> {
    split_list(raw)
        .into_iter()
        .map(|entry| {
            if let Ok(net) = entry.parse::<IpNet>() {
                return Ok(net);
            }
            entry
                .parse::<IpAddr>()
                .map(IpNet::from)
                .map_err(|e| ConfigError::InvalidSubnet {
                    variable,
                    value: entry.clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}
