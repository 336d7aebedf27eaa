//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags**: applied by `main` after loading
//! 2. **Environment variables**: `NSHD_IDENTIFIER`, `NSHD_RELAYS`
//!    (comma-separated), `NSHD_BASE_DIR`
//! 3. **Config file**: path via `--config <path>`, or `nshd.toml` in CWD
//! 4. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [daemon]
//! base_dir = "/etc/nshd/"
//! # wallet = "/etc/nshd/wallet.json"
//! # password_file = "/etc/nshd/wallet.pswd"
//! # authorized_file = "/etc/nshd/authorized_pubkeys"
//! identifier = ""
//!
//! [shell]
//! shell = "bash"
//! session = true
//! working_dir = "~"
//!
//! [exec]
//! sync_timeout_ms = 5000
//! async_timeout_ms = 0     # 0 = unbounded
//! log_cmd = false
//!
//! [transport]
//! relays = ["wss://relay.example.com/bus"]
//! reconnect_delay_secs = 1
//! reconnect_max_delay_secs = 30
//! reply_timeout_secs = 10
//!
//! [keepalive]
//! ping_interval_secs = 20
//! force_ping_interval_secs = 60
//! must_keepalive = false
//!
//! [logging]
//! level = "info"
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::util::join_dir;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// File locations and identity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding wallet, password and authorized files (default `/etc/nshd/`).
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Wallet file, defaults to `<base_dir>/wallet.json`.
    pub wallet: Option<String>,
    /// Wallet password file, defaults to `<base_dir>/wallet.pswd`.
    pub password_file: Option<String>,
    /// Authorized principals file, defaults to `<base_dir>/authorized_pubkeys`.
    pub authorized_file: Option<String>,
    /// Identifier prefixed to the public key to form the daemon's address.
    #[serde(default)]
    pub identifier: String,
}

/// Interactive session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary for interactive sessions (default `bash`).
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Keep one persistent shell per principal (default true).
    #[serde(default = "default_session")]
    pub session: bool,
    /// Working directory for sessions and one-shot commands (default `~`).
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

/// One-shot execution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    /// Timeout for `execSync` requests in milliseconds (default 5000).
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    /// Timeout for asynchronous one-shots in milliseconds (default 0 = unbounded).
    #[serde(default)]
    pub async_timeout_ms: u64,
    /// Include the command text in the execution log line.
    #[serde(default)]
    pub log_cmd: bool,
}

/// Relay transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Relay WebSocket URLs; one connection is kept per URL.
    #[serde(default)]
    pub relays: Vec<String>,
    /// Initial reconnect delay in seconds (default 1).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max reconnect delay in seconds (default 30).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// How long a send waits for the receiver's reply (default 10).
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,
}

/// Liveness probe settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KeepaliveConfig {
    /// Heartbeat and self-probe interval in seconds (default 20).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Forced probe interval in seconds (default 60).
    #[serde(default = "default_force_ping_interval")]
    pub force_ping_interval_secs: u64,
    /// Exit with status 1 when keepalive stays down for 5 intervals.
    #[serde(default)]
    pub must_keepalive: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_base_dir() -> String {
    "/etc/nshd/".to_string()
}
fn default_shell() -> String {
    "bash".to_string()
}
fn default_session() -> bool {
    true
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_sync_timeout_ms() -> u64 {
    5000
}
fn default_reconnect_delay() -> u64 {
    1
}
fn default_reconnect_max_delay() -> u64 {
    30
}
fn default_reply_timeout() -> u64 {
    10
}
fn default_ping_interval() -> u64 {
    20
}
fn default_force_ping_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            wallet: None,
            password_file: None,
            authorized_file: None,
            identifier: String::new(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            session: default_session(),
            working_dir: default_working_dir(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: default_sync_timeout_ms(),
            async_timeout_ms: 0,
            log_cmd: false,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            reply_timeout_secs: default_reply_timeout(),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            force_ping_interval_secs: default_force_ping_interval(),
            must_keepalive: false,
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

/// Errors raised while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read(String, std::io::Error),
    Parse(String, toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(p, e) => write!(f, "Failed to read config file {p}: {e}"),
            ConfigError::Parse(p, e) => write!(f, "Failed to parse config file {p}: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `nshd.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("nshd.toml").exists() => Self::from_file("nshd.toml")?,
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_string(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_string(), e))
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("NSHD_BASE_DIR") {
            self.daemon.base_dir = dir;
        }
        if let Ok(id) = std::env::var("NSHD_IDENTIFIER") {
            self.daemon.identifier = id;
        }
        if let Ok(relays) = std::env::var("NSHD_RELAYS") {
            self.transport.relays = relays
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(ToString::to_string)
                .collect();
        }
    }

    pub fn wallet_path(&self) -> String {
        self.daemon
            .wallet
            .clone()
            .unwrap_or_else(|| join_dir(&self.daemon.base_dir, "wallet.json"))
    }

    pub fn password_path(&self) -> String {
        self.daemon
            .password_file
            .clone()
            .unwrap_or_else(|| join_dir(&self.daemon.base_dir, "wallet.pswd"))
    }

    pub fn authorized_path(&self) -> String {
        self.daemon
            .authorized_file
            .clone()
            .unwrap_or_else(|| join_dir(&self.daemon.base_dir, "authorized_pubkeys"))
    }

    /// Keepalive period, at least one second.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive.ping_interval_secs.max(1))
    }

    /// Forced probe period, at least one second.
    pub fn force_ping_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive.force_ping_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.exec.sync_timeout_ms, 5000);
        assert_eq!(config.exec.async_timeout_ms, 0);
        assert!(config.shell.session);
        assert_eq!(config.wallet_path(), "/etc/nshd/wallet.json");
        assert_eq!(config.password_path(), "/etc/nshd/wallet.pswd");
        assert_eq!(config.authorized_path(), "/etc/nshd/authorized_pubkeys");
        assert_eq!(config.ping_interval(), Duration::from_secs(20));
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            "[daemon]\nbase_dir = \"/tmp/nshd\"\nidentifier = \"box\"\n\n[exec]\nlog_cmd = true\n",
        )
        .unwrap();
        assert_eq!(config.daemon.identifier, "box");
        assert!(config.exec.log_cmd);
        assert_eq!(config.exec.sync_timeout_ms, 5000);
        assert_eq!(config.wallet_path(), "/tmp/nshd/wallet.json");
        assert_eq!(config.keepalive.force_ping_interval_secs, 60);
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config: Config = toml::from_str(
            "[keepalive]\nping_interval_secs = 0\nforce_ping_interval_secs = 0\n",
        )
        .unwrap();
        assert_eq!(config.ping_interval(), Duration::from_secs(1));
        assert_eq!(config.force_ping_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_explicit_paths_win() {
        let config: Config =
            toml::from_str("[daemon]\nwallet = \"/srv/w.json\"\n").unwrap();
        assert_eq!(config.wallet_path(), "/srv/w.json");
        assert_eq!(config.password_path(), "/etc/nshd/wallet.pswd");
    }
}
