//! Bridge configuration
//!
//! The four connection settings (mesh password, broker address, broker port, base
//! topic) are required and always come from the environment. Everything else has a
//! default and may be tuned through an optional TOML file.

use crate::protocol::topics::validate_base_topic;
use serde::{Deserialize, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_NETWORK_PASSWORD: &str = "CASAMBI_NETWORK_PASSWORD";
pub const ENV_BROKER: &str = "MQTT_BROKER";
pub const ENV_PORT: &str = "MQTT_PORT";
pub const ENV_BASE_TOPIC: &str = "MQTT_BASE_TOPIC";
pub const ENV_USERNAME: &str = "MQTT_USERNAME";
pub const ENV_PASSWORD: &str = "MQTT_PASSWORD";
pub const ENV_CLIENT_ID: &str = "MQTT_CLIENT_ID";
pub const ENV_NETWORK_INDEX: &str = "CASAMBI_NETWORK_INDEX";

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttSection,
    pub casambi: CasambiSection,
    pub reconnect: ReconnectSection,
    pub health: HealthSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    /// Broker host name or address (`MQTT_BROKER`)
    #[serde(skip_deserializing)]
    pub broker: String,
    /// Broker port (`MQTT_PORT`)
    #[serde(skip_deserializing)]
    pub port: u16,
    /// Prefix of every unit topic (`MQTT_BASE_TOPIC`)
    #[serde(skip_deserializing)]
    pub base_topic: String,
    /// Client identifier, generated when absent
    pub client_id: Option<String>,
    #[serde(skip)]
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// How long the initial connect and each reconnect attempt wait for ConnAck
    pub connect_timeout_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker: String::new(),
            port: 0,
            base_topic: String::new(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

impl MqttSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Mesh network settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CasambiSection {
    /// Network password (`CASAMBI_NETWORK_PASSWORD`), never printed
    #[serde(skip_deserializing, serialize_with = "redacted")]
    pub network_password: String,
    pub discovery_timeout_secs: u64,
    /// Bound on each link's disconnect during shutdown
    pub disconnect_timeout_secs: u64,
    /// Network to pick when discovery finds several; prompts when unset and interactive
    pub network_index: Option<usize>,
    pub backend: MeshBackend,
}

impl Default for CasambiSection {
    fn default() -> Self {
        Self {
            network_password: String::new(),
            discovery_timeout_secs: 10,
            disconnect_timeout_secs: 5,
            network_index: None,
            backend: MeshBackend::default(),
        }
    }
}

impl CasambiSection {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }
}

/// Which mesh client implementation drives the mesh link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MeshBackend {
    /// In-memory networks described in the configuration file
    Virtual {
        #[serde(default)]
        networks: Vec<VirtualNetworkConfig>,
    },
}

impl Default for MeshBackend {
    fn default() -> Self {
        MeshBackend::Virtual {
            networks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualNetworkConfig {
    pub address: String,
    pub name: String,
    #[serde(default)]
    pub units: Vec<VirtualUnitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualUnitConfig {
    pub id: u16,
    pub name: String,
    #[serde(default = "default_true")]
    pub dimmer: bool,
    #[serde(default)]
    pub vertical: bool,
    /// Supported colour temperature range in Kelvin
    pub temperature_min: Option<u32>,
    pub temperature_max: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Broker reconnection policy constants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    pub first_delay_secs: u64,
    pub rate: u32,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            first_delay_secs: 1,
            rate: 2,
            max_delay_secs: 60,
            max_attempts: 12,
        }
    }
}

/// Liveness publishing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSection {
    pub interval_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl HealthSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn redacted<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_empty() {
        serializer.serialize_str("")
    } else {
        serializer.serialize_str("***")
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl BridgeConfig {
    /// Load tuning from `path` (if any), then the required settings from the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_environment(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the TOML tuning file; required settings are left empty
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Fill environment-provided settings using `lookup`
    ///
    /// Empty values count as missing.
    pub fn apply_environment<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> Result<String, ConfigError> {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ConfigError::EnvVarNotFound(name.to_string()))
        };
        let optional = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        self.casambi.network_password = required(ENV_NETWORK_PASSWORD)?;
        self.mqtt.broker = required(ENV_BROKER)?;

        let port = required(ENV_PORT)?;
        self.mqtt.port = port.parse().map_err(|_| ConfigError::InvalidValue {
            name: ENV_PORT.to_string(),
            reason: format!("'{port}' is not a valid port"),
        })?;

        self.mqtt.base_topic = required(ENV_BASE_TOPIC)?;

        self.mqtt.username = optional(ENV_USERNAME);
        self.mqtt.password = optional(ENV_PASSWORD);
        if let Some(client_id) = optional(ENV_CLIENT_ID) {
            self.mqtt.client_id = Some(client_id);
        }
        if let Some(index) = optional(ENV_NETWORK_INDEX) {
            let parsed = index.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: ENV_NETWORK_INDEX.to_string(),
                reason: format!("'{index}' is not a network index"),
            })?;
            self.casambi.network_index = Some(parsed);
        }

        Ok(())
    }

    /// TOML view of the resolved settings, secrets masked
    pub fn render_redacted(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidValue {
                name: ENV_PORT.to_string(),
                reason: "port must be greater than 0".to_string(),
            });
        }

        validate_base_topic(&self.mqtt.base_topic).map_err(|e| ConfigError::InvalidValue {
            name: ENV_BASE_TOPIC.to_string(),
            reason: e.to_string(),
        })?;

        if self.reconnect.rate == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.rate must be at least 1".to_string(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.health.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "health.interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Configuration with every required value filled in, for unit tests
    #[cfg(test)]
    pub fn test_config() -> Self {
        let mut config = Self::default();
        config.casambi.network_password = "secret".to_string();
        config.mqtt.broker = "localhost".to_string();
        config.mqtt.port = 1883;
        config.mqtt.base_topic = "casambi".to_string();
        config
    }
}
