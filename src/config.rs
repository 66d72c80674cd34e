//! Configuration for the timestamper service
//!
//! Loaded from a TOML file. Broker credentials are referenced by environment
//! variable name and resolved when the connection is built, never stored here.

use crate::connection::mqtt::ReconnectConfig;
use crate::connection::QoS;
use crate::relay::envelope::PublishOverrides;
use crate::relay::topic::{validate_topic_filter, TopicRewrite};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimestamperConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub relays: Vec<RelaySection>,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Client identifier prefix; a millisecond suffix keeps restarts from colliding
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_client_id() -> String {
    "mqtt-timestamper".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Maximum consecutive reconnection attempts (absent = unlimited)
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![25, 50, 100, 250]
}

fn default_sustained_delay() -> u64 {
    250
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern_ms: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        ReconnectConfig {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_pattern_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

/// One relay: source filter, topic rewrite and publish overrides
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    /// Topic filter to subscribe to; may contain `+` and `#`
    pub source_topic: String,
    /// QoS requested for the source subscription (default: 2)
    #[serde(default = "default_subscribe_qos")]
    pub subscribe_qos: QoS,
    /// Also unsubscribe from the source filter at shutdown (default: true)
    #[serde(default = "default_true")]
    pub unsubscribe_on_stop: bool,
    #[serde(default)]
    pub rewrite: TopicRewrite,
    #[serde(default)]
    pub publish: PublishOverrides,
}

fn default_subscribe_qos() -> QoS {
    QoS::ExactlyOnce
}

fn default_true() -> bool {
    true
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
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TimestamperConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TimestamperConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.mqtt.broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.mqtt.broker_url.clone()))?;

        if self.mqtt.client_id.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.client_id must not be empty".to_string(),
            ));
        }

        if self.relays.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one [[relays]] entry is required".to_string(),
            ));
        }

        for (index, relay) in self.relays.iter().enumerate() {
            validate_topic_filter(&relay.source_topic).map_err(|e| {
                ConfigError::InvalidConfig(format!("relays[{index}].source_topic: {e}"))
            })?;
            relay.rewrite.validate().map_err(|e| {
                ConfigError::InvalidConfig(format!("relays[{index}].rewrite: {e}"))
            })?;
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Fail if a configured credential variable is not set
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        for name in [&self.mqtt.username_env, &self.mqtt.password_env]
            .into_iter()
            .flatten()
        {
            if std::env::var(name).is_err() {
                return Err(ConfigError::EnvVarNotFound(name.clone()));
            }
        }
        Ok(())
    }
}
