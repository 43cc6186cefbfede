//! Configuration loading and types.
//!
//! Configuration is read from a YAML file (PascalCase keys, matching the
//! deployed fleet's conventions) and then overridden from the
//! environment.  Each subsection governs a different part of the system:
//! networking, the shared database, and the cluster identity this process
//! is allowed to assume.

use serde::Deserialize;
use std::path::Path;

/// Identity bit: may run as master.
pub const IDENTITY_MASTER: u8 = 1;
/// Identity bit: may run as slave.
pub const IDENTITY_SLAVE: u8 = 2;
/// Identity bits: race for master, fall back to slave.
pub const IDENTITY_ALL: u8 = IDENTITY_MASTER | IDENTITY_SLAVE;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// HTTP listener settings.
    #[serde(default)]
    pub net: NetConfig,

    /// Shared store the fleet coordinates through.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Identity this process may assume: 0 = membership disabled,
    /// 1 = master only, 2 = slave only, 3 = either.
    #[serde(default)]
    pub identity: u8,

    /// `debug` or `release`; gates verbose logging.
    #[serde(default = "default_running_mode")]
    pub running_mode: String,

    /// Advertise `127.0.0.1` when no non-loopback interface is found.
    #[serde(default)]
    pub localhost: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            net: NetConfig::default(),
            database: DatabaseConfig::default(),
            identity: 0,
            running_mode: default_running_mode(),
            localhost: false,
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetConfig {
    /// Bind port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
        }
    }
}

/// Shared database configuration: a non-empty sequence of connection
/// descriptors.  Only the first descriptor is used; the rest are spares
/// kept for operational parity with the fleet's config layout.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseConfig {
    #[serde(default)]
    pub servers: Vec<DatabaseServer>,
}

/// A single database connection descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseServer {
    /// Path of the database file.
    pub path: String,
}

impl Config {
    /// Whether this process runs with verbose logging.
    pub fn is_debug(&self) -> bool {
        self.running_mode == "debug"
    }

    /// Validate cross-field constraints.
    ///
    /// Membership requires at least one database descriptor; identity is
    /// a two-bit set.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identity > IDENTITY_ALL {
            anyhow::bail!("Identity must be 0..=3, got {}", self.identity);
        }
        if self.identity != 0 && self.database.servers.is_empty() {
            anyhow::bail!("Database.Servers must not be empty when Identity is set");
        }
        if self.running_mode != "debug" && self.running_mode != "release" {
            anyhow::bail!("RunningMode must be `debug` or `release`");
        }
        Ok(())
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_listen_port() -> u16 {
    8080
}

fn default_running_mode() -> String {
    "release".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

/// Apply environment overrides on top of a loaded configuration.
///
/// Recognized variables: `Producer_Net_ListenPort`, `Producer_Identity`.
/// Unparseable values are ignored.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = std::env::var("Producer_Net_ListenPort") {
        if let Ok(port) = value.parse::<u16>() {
            config.net.listen_port = port;
        }
    }
    if let Ok(value) = std::env::var("Producer_Identity") {
        if let Ok(identity) = value.parse::<u8>() {
            config.identity = identity;
        }
    }
}
