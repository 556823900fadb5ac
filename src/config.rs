//! Relay configuration file
//!
//! Loaded from `relay-config.json` in the working directory by default. A file
//! with default values is written on first start.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "relay-config.json";
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 9696;
pub const DEFAULT_MAX_CONNECTIONS: usize = 25;
pub const DEFAULT_GATEWAY_HOST: &str = "127.0.0.1";
pub const DEFAULT_GATEWAY_PORT: u16 = 9697;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "nothing" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" | "information" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Contents of the configuration file.
///
/// Numeric fields are kept wide so out-of-range values survive parsing and
/// can be replaced with defaults by [`RelayConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_address: String,
    pub bind_port: i64,
    pub max_connections: i64,
    pub log_level: String,
    pub gateway_host: String,
    pub gateway_port: u16,
    pub connect_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            bind_port: DEFAULT_BIND_PORT as i64,
            max_connections: DEFAULT_MAX_CONNECTIONS as i64,
            log_level: LogLevel::Info.to_string(),
            gateway_host: DEFAULT_GATEWAY_HOST.to_string(),
            gateway_port: DEFAULT_GATEWAY_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl RelayConfig {
    /// Load the file at `path`, writing a default one first if it is missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let json =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: RelayConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, json).context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Replace invalid values with defaults, returning a note for each fix
    pub fn validate(&mut self) -> Vec<String> {
        let mut fixes = Vec::new();

        if self.bind_address.trim().is_empty() {
            self.bind_address = DEFAULT_BIND_ADDRESS.to_string();
            fixes.push(format!("bind_address empty, using {}", DEFAULT_BIND_ADDRESS));
        }

        if !(1..=u16::MAX as i64).contains(&self.bind_port) {
            fixes.push(format!(
                "bind_port {} out of range, using {}",
                self.bind_port, DEFAULT_BIND_PORT
            ));
            self.bind_port = DEFAULT_BIND_PORT as i64;
        }

        if self.max_connections <= 0 {
            fixes.push(format!(
                "max_connections {} invalid, using {}",
                self.max_connections, DEFAULT_MAX_CONNECTIONS
            ));
            self.max_connections = DEFAULT_MAX_CONNECTIONS as i64;
        }

        if self.log_level.parse::<LogLevel>().is_err() {
            fixes.push(format!("log_level {:?} unknown, using info", self.log_level));
            self.log_level = LogLevel::Info.to_string();
        }

        if self.gateway_host.trim().is_empty() {
            self.gateway_host = DEFAULT_GATEWAY_HOST.to_string();
            fixes.push(format!("gateway_host empty, using {}", DEFAULT_GATEWAY_HOST));
        }

        if self.gateway_port == 0 {
            self.gateway_port = DEFAULT_GATEWAY_PORT;
            fixes.push(format!("gateway_port 0 invalid, using {}", DEFAULT_GATEWAY_PORT));
        }

        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = DEFAULT_CONNECT_TIMEOUT_SECS;
            fixes.push(format!(
                "connect_timeout_secs 0 invalid, using {}",
                DEFAULT_CONNECT_TIMEOUT_SECS
            ));
        }

        fixes
    }

    /// Listening port; call after [`RelayConfig::validate`]
    pub fn port(&self) -> u16 {
        u16::try_from(self.bind_port).unwrap_or(DEFAULT_BIND_PORT)
    }

    /// Connection limit; call after [`RelayConfig::validate`]
    pub fn connection_limit(&self) -> usize {
        usize::try_from(self.max_connections)
            .ok()
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn level(&self) -> LogLevel {
        self.log_level.parse().unwrap_or_default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
