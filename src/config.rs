//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `AERO_NAME`, `AERO_IP`, `AERO_RPC_PORT`,
//!    `AERO_TRANSFER_PORT`, `AERO_MASTER`, `AERO_MASTER_ADDR`
//! 2. **Config file**: path via `--config <path>`, or `aero.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! [node]
//! name = "aero-node"
//! identity = ""                  # derived from name/ip/rpc_port when empty
//! ip = "127.0.0.1"
//! rpc_port = 9090
//! transfer_port = 9091
//! master = false
//! master_addr = "127.0.0.1:9090"  # peers only
//! shared = ["/srv/share/a.bin"]
//!
//! [auth]
//! key_path = "key"
//!
//! [transfer]
//! download_dir = "."
//!
//! [logging]
//! level = "info"
//! file = ""                      # protocol messages go to this file when set
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::hasher;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local identity, addresses, and role.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Display name (default `aero-node`). Override with `AERO_NAME`.
    #[serde(default = "default_name")]
    pub name: String,
    /// Stable identity hash. Derived from name, ip and RPC port when empty.
    #[serde(default)]
    pub identity: String,
    /// Address advertised to peers and bound locally (default `127.0.0.1`).
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Registry RPC port (default 9090). 0 picks a free port.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// Transfer port (default 9091). 0 picks a free port.
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,
    /// Hold the authoritative directory (default false).
    #[serde(default)]
    pub master: bool,
    /// `host:port` of the master's RPC endpoint. Ignored on a master.
    pub master_addr: Option<String>,
    /// Files offered at startup.
    #[serde(default)]
    pub shared: Vec<String>,
}

/// Shared-secret location.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Key file, created with a random secret on first start (default `key`).
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Where received files are written (default `.`).
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Append protocol messages to this file instead of the tracing output.
    pub file: Option<String>,
}

fn default_name() -> String {
    "aero-node".to_string()
}
fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_rpc_port() -> u16 {
    9090
}
fn default_transfer_port() -> u16 {
    9091
}
fn default_key_path() -> String {
    "key".to_string()
}
fn default_download_dir() -> String {
    ".".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            identity: String::new(),
            ip: default_ip(),
            rpc_port: default_rpc_port(),
            transfer_port: default_transfer_port(),
            master: false,
            master_addr: None,
            shared: Vec::new(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_path: default_key_path(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl NodeConfig {
    /// Configured identity, or a hash of `name@ip:rpc_port`.
    pub fn identity_hash(&self) -> String {
        if self.identity.is_empty() {
            hasher::hash_bytes(format!("{}@{}:{}", self.name, self.ip, self.rpc_port).as_bytes())
        } else {
            self.identity.clone()
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `aero.toml` in the
    /// current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("aero.toml").exists() => Self::from_file("aero.toml")?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(name) = get("AERO_NAME") {
            self.node.name = name;
        }
        if let Some(ip) = get("AERO_IP") {
            self.node.ip = ip;
        }
        if let Some(port) = get("AERO_RPC_PORT") {
            self.node.rpc_port = parse_env("AERO_RPC_PORT", port)?;
        }
        if let Some(port) = get("AERO_TRANSFER_PORT") {
            self.node.transfer_port = parse_env("AERO_TRANSFER_PORT", port)?;
        }
        if let Some(master) = get("AERO_MASTER") {
            self.node.master = parse_env("AERO_MASTER", master)?;
        }
        if let Some(addr) = get("AERO_MASTER_ADDR") {
            self.node.master_addr = Some(addr);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { key, value })
}
