//! Daemon Configuration
//!
//! `daemon.toml` in `~/.config/lanconnect`, created with defaults on first run.

use anyhow::{Context, Result};
use lanconnect_protocol::{DeviceType, LanConfig, ManagerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Plugin configuration
    #[serde(default)]
    pub plugins: PluginConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,

    /// Device type (desktop, laptop, phone, tablet, tv); detected if unset
    #[serde(default)]
    pub device_type: Option<String>,

    /// Device ID for a newly generated certificate (random if not set)
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP discovery and TCP connection port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transfer port range start
    #[serde(default = "default_transfer_port_start")]
    pub transfer_port_start: u16,

    /// Transfer port range end
    #[serde(default = "default_transfer_port_end")]
    pub transfer_port_end: u16,

    /// Identity broadcast interval in seconds
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval: u64,

    /// Reconnection sweep interval in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,

    /// Accept unknown devices that find us
    #[serde(default = "default_true")]
    pub discoverable: bool,

    /// Stop being discoverable once this many unpaired devices are known
    #[serde(default = "default_max_unpaired_devices")]
    pub max_unpaired_devices: usize,
}

/// Plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Enable ping plugin
    #[serde(default = "default_true")]
    pub enable_ping: bool,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (device registry)
    pub data_dir: PathBuf,

    /// Certificate directory
    pub cert_dir: PathBuf,
}

fn default_port() -> u16 {
    1716
}

fn default_transfer_port_start() -> u16 {
    1739
}

fn default_transfer_port_end() -> u16 {
    1764
}

fn default_broadcast_interval() -> u64 {
    10
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_max_unpaired_devices() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            transfer_port_start: default_transfer_port_start(),
            transfer_port_end: default_transfer_port_end(),
            broadcast_interval: default_broadcast_interval(),
            reconnect_interval: default_reconnect_interval(),
            discoverable: true,
            max_unpaired_devices: default_max_unpaired_devices(),
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self { enable_ping: true }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = default_config_dir();
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("lanconnect");
        let cert_dir = config_dir.join("certs");

        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_type: None,
                device_id: None,
            },
            network: NetworkConfig::default(),
            plugins: PluginConfig::default(),
            paths: PathConfig {
                config_dir,
                data_dir,
                cert_dir,
            },
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("lanconnect")
}

impl Config {
    /// Load configuration from `path` (or the default location), creating
    /// a default file if none exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_dir().join(CONFIG_FILE_NAME),
        };

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {:?}", config_path))
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    /// Write configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(&self.paths.cert_dir)
            .context("Failed to create certificate directory")?;
        Ok(())
    }

    /// Configured device type, or the detected one
    pub fn device_type(&self) -> DeviceType {
        match &self.device.device_type {
            Some(name) => DeviceType::parse(name),
            None => DeviceType::detect(),
        }
    }

    /// LAN service settings
    pub fn lan_config(&self) -> LanConfig {
        LanConfig {
            port: self.network.port,
            transfer_port_range: self.network.transfer_port_start..=self.network.transfer_port_end,
            broadcast_interval: Duration::from_secs(self.network.broadcast_interval),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ..LanConfig::default()
        }
    }

    /// Manager settings
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            reconnect_interval: Duration::from_secs(self.network.reconnect_interval.max(1)),
            discoverable: self.network.discoverable,
            max_unpaired_devices: self.network.max_unpaired_devices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, 1716);
        assert_eq!(config.network.transfer_port_start, 1739);
        assert_eq!(config.network.transfer_port_end, 1764);
        assert!(config.network.discoverable);
        assert!(config.plugins.enable_ping);

        let manager = config.manager_config();
        assert_eq!(manager.reconnect_interval, Duration::from_secs(5));
        assert_eq!(manager.max_unpaired_devices, 3);
        assert_eq!(config.lan_config().transfer_port_range, 1739..=1764);
    }

    #[test]
    fn test_load_creates_default_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);

        let created = Config::load(Some(&path)).unwrap();
        assert!(path.exists());

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.device.name, created.device.name);
        assert_eq!(loaded.network.port, 1716);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"
[device]
name = "Workstation"
device_type = "laptop"

[network]
port = 1800
discoverable = false

[paths]
config_dir = "/tmp/lc"
data_dir = "/tmp/lc/data"
cert_dir = "/tmp/lc/certs"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.device.name, "Workstation");
        assert_eq!(config.device_type(), DeviceType::Laptop);
        assert_eq!(config.network.port, 1800);
        assert_eq!(config.network.transfer_port_start, 1739);
        assert!(!config.manager_config().discoverable);
        assert!(config.plugins.enable_ping);
    }
}
