use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use rdev_proto::DEFAULT_PORT;
use rdev_transport::TransportRegistry;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("Device #{0} has no name")]
    MissingName(usize),

    #[error("Device {0} is configured twice")]
    DuplicateDevice(String),

    #[error("Device {device} uses unknown transport {transport}")]
    UnknownTransport { device: String, transport: String },

    #[error("Device {0} has no target")]
    MissingTarget(String),
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(rename = "device")]
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    pub transport: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub options: String,
    /// Shared devices may be opened by several clients at once.
    #[serde(default)]
    pub shared: bool,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        text.parse()
    }

    /// Checks the device list against the transports `registry` can build.
    pub fn validate(&self, registry: &TransportRegistry) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for (index, device) in self.devices.iter().enumerate() {
            if device.name.is_empty() {
                return Err(ConfigError::MissingName(index));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
            if !registry.contains(&device.transport) {
                return Err(ConfigError::UnknownTransport {
                    device: device.name.clone(),
                    transport: device.transport.clone(),
                });
            }
            if device.target.is_empty() && device.transport != rdev_transport::null::KIND {
                return Err(ConfigError::MissingTarget(device.name.clone()));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}
