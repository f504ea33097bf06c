//! Node connection configuration and persistence
//!
//! Handles loading and saving the connection configuration, and generating
//! the daemon's own config file for embedded mode.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Daemon binary name
#[cfg(target_os = "windows")]
pub const DAEMON_BINARY_NAME: &str = "zcashd.exe";

#[cfg(not(target_os = "windows"))]
pub const DAEMON_BINARY_NAME: &str = "zcashd";

/// Name of the daemon's own config file inside its data directory
pub const DAEMON_CONF_NAME: &str = "zcash.conf";

/// Default local Tor SOCKS endpoint
pub const DEFAULT_TOR_PROXY: &str = "127.0.0.1:9050";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// How the wallet reaches its node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Wallet launches and supervises the daemon
    #[default]
    Embedded,
    /// User runs the daemon; the wallet only talks RPC
    External,
}

/// Network type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }

    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8232,
            Network::Testnet => 18232,
        }
    }

    /// Subdirectory of the data directory holding network-specific files
    pub fn data_subdir(&self) -> Option<&'static str> {
        match self {
            Network::Mainnet => None,
            Network::Testnet => Some("testnet3"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

/// Authentication method for RPC
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Cookie-based authentication (read from the data directory)
    #[default]
    Cookie,
    /// Username/password authentication
    Userpass,
}

/// Connection configuration stored in node_config.json
///
/// Immutable for the lifetime of a connection attempt: the connection
/// manager owns its copy, so changing settings means building a new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default)]
    pub mode: NodeMode,

    #[serde(default)]
    pub network: Network,

    #[serde(default = "default_rpc_host")]
    pub rpc_host: String,

    /// RPC port (0 means use network default)
    #[serde(default)]
    pub rpc_port: u16,

    #[serde(default)]
    pub auth_method: AuthMethod,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_password: Option<String>,

    /// Route traffic through a local SOCKS proxy
    #[serde(default)]
    pub use_tor: bool,

    #[serde(default = "default_tor_proxy")]
    pub tor_proxy: String,

    /// Daemon data directory (platform default when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_directory: Option<String>,

    /// Daemon binary (managed node directory when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon_path: Option<String>,

    /// Extra command-line arguments for the embedded daemon
    #[serde(default)]
    pub custom_args: String,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_tor_proxy() -> String {
    DEFAULT_TOR_PROXY.to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mode: NodeMode::default(),
            network: Network::default(),
            rpc_host: default_rpc_host(),
            rpc_port: 0,
            auth_method: AuthMethod::default(),
            rpc_user: None,
            rpc_password: None,
            use_tor: false,
            tor_proxy: default_tor_proxy(),
            data_directory: None,
            daemon_path: None,
            custom_args: String::new(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl NodeConfig {
    /// Path to node_config.json
    pub fn config_path() -> PathBuf {
        crate::app_data_dir().join("node_config.json")
    }

    /// Load config from disk, or return default if not found
    pub fn load() -> Self {
        let path = Self::config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::error!("Failed to parse {}: {}, using defaults", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&path, contents).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })?;

        log::info!("Node config saved to {}", path.display());
        Ok(())
    }

    pub fn use_embedded_daemon(&self) -> bool {
        self.mode == NodeMode::Embedded
    }

    pub fn effective_rpc_port(&self) -> u16 {
        if self.rpc_port > 0 {
            self.rpc_port
        } else {
            self.network.default_rpc_port()
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Directory for wallet-managed daemon binaries
    pub fn managed_node_dir() -> PathBuf {
        crate::app_data_dir().join("node")
    }

    /// Path to the daemon binary
    pub fn daemon_binary_path(&self) -> PathBuf {
        match &self.daemon_path {
            Some(path) if !path.is_empty() => PathBuf::from(crate::expand_path(path)),
            _ => Self::managed_node_dir().join(DAEMON_BINARY_NAME),
        }
    }

    /// Platform default daemon data directory
    pub fn default_daemon_data_dir() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Zcash")
        }

        #[cfg(target_os = "macos")]
        {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Zcash")
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".zcash")
        }
    }

    /// Data directory for this config (configured or default)
    pub fn get_data_directory(&self) -> PathBuf {
        match &self.data_directory {
            Some(dir) if !dir.is_empty() => PathBuf::from(crate::expand_path(dir)),
            _ => Self::default_daemon_data_dir(),
        }
    }

    /// Network-specific directory (holds the cookie and wallet.dat)
    pub fn network_data_dir(&self) -> PathBuf {
        let base = self.get_data_directory();
        match self.network.data_subdir() {
            Some(sub) => base.join(sub),
            None => base,
        }
    }

    pub fn cookie_path(&self) -> PathBuf {
        self.network_data_dir().join(".cookie")
    }

    pub fn daemon_conf_path(&self) -> PathBuf {
        self.get_data_directory().join(DAEMON_CONF_NAME)
    }

    /// Whether RPC traffic itself must go through the SOCKS proxy.
    /// Loopback endpoints are never proxied.
    pub fn proxy_rpc(&self) -> bool {
        if !self.use_tor {
            return false;
        }
        let host = self.rpc_host.trim();
        !(host == "localhost"
            || host
                .parse::<std::net::IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false))
    }

    /// Command-line arguments for the embedded daemon
    pub fn daemon_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-datadir={}", self.get_data_directory().display()),
            format!("-conf={}", self.daemon_conf_path().display()),
            format!("-rpcport={}", self.effective_rpc_port()),
        ];

        if self.network == Network::Testnet {
            args.push("-testnet".to_string());
        }

        args.extend(self.custom_args.split_whitespace().map(str::to_string));
        args
    }

    /// Generate daemon config content for embedded mode
    pub fn generate_daemon_conf(&self) -> String {
        let mut lines = vec![
            "# Generated by Shielded Wallet".to_string(),
            "".to_string(),
            "server=1".to_string(),
            "rpcbind=127.0.0.1".to_string(),
            "rpcallowip=127.0.0.1".to_string(),
        ];

        if self.auth_method == AuthMethod::Userpass {
            if let Some(user) = &self.rpc_user {
                lines.push(format!("rpcuser={}", user));
            }
            if let Some(password) = &self.rpc_password {
                lines.push(format!("rpcpassword={}", password));
            }
        }

        if self.use_tor {
            lines.push(format!("proxy={}", self.tor_proxy));
        }

        lines.join("\n")
    }

    /// Write the daemon config if it does not exist yet. An existing file is
    /// left alone except for appending the Tor proxy line when it is missing.
    pub fn ensure_daemon_conf(&self) -> Result<(), ConfigError> {
        let conf_path = self.daemon_conf_path();

        if let Some(parent) = conf_path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let write_err = |source| ConfigError::Write {
            path: conf_path.display().to_string(),
            source,
        };

        match fs::read_to_string(&conf_path) {
            Ok(existing) => {
                if self.use_tor && conf_value(&existing, "proxy").is_none() {
                    let mut updated = existing;
                    if !updated.ends_with('\n') {
                        updated.push('\n');
                    }
                    updated.push_str(&format!("proxy={}\n", self.tor_proxy));
                    fs::write(&conf_path, updated).map_err(write_err)?;
                    log::info!("Added Tor proxy to {}", conf_path.display());
                }
            }
            Err(_) => {
                fs::write(&conf_path, self.generate_daemon_conf()).map_err(write_err)?;
                log::info!("{} written to {}", DAEMON_CONF_NAME, conf_path.display());
            }
        }

        Ok(())
    }

    /// Detect `daemon=1` in the daemon's config file. A daemon that forks
    /// into the background cannot be supervised, so this is reported instead
    /// of attempting a launch.
    pub fn detect_daemon_mode_conflict(&self) -> Option<PathBuf> {
        let conf_path = self.daemon_conf_path();
        let content = fs::read_to_string(&conf_path).ok()?;
        match conf_value(&content, "daemon") {
            Some("1") => Some(conf_path),
            _ => None,
        }
    }
}

/// Last value for `key` in a `key=value` config file, ignoring comments
fn conf_value<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter_map(|line| line.split_once('='))
        .filter(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
        .last()
}
