//! Pure connection state management for the MQTT client
//!
//! Connection states, the reconnection backoff policy and broker option setup.

use crate::config::{MqttSection, ReconnectSection};
use rumqttc::v5::MqttOptions;
use std::time::Duration;
use thiserror::Error;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count, 1-based)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection backoff policy
///
/// The delay before attempt `k` (0-based) is `min(first_delay * rate^k, max_delay)`.
/// With the defaults this waits 1, 2, 4, 8, 16, 32 seconds and then 60 seconds for
/// the remaining attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub first_delay: Duration,
    pub rate: u32,
    pub max_delay: Duration,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(1),
            rate: 2,
            max_delay: Duration::from_secs(60),
            max_attempts: Some(12),
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            first_delay: Duration::from_secs(section.first_delay_secs),
            rate: section.rate,
            max_delay: Duration::from_secs(section.max_delay_secs),
            max_attempts: Some(section.max_attempts),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the attempt that follows `attempts_made` failed attempts
    pub fn calculate_backoff_delay(&self, attempts_made: u32) -> Duration {
        self.rate
            .checked_pow(attempts_made)
            .and_then(|factor| self.first_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Sum of every backoff delay, or None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<Duration> {
        self.max_attempts.map(|max_attempts| {
            (0..max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Every delay of a limited policy, in order
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts.unwrap_or(0))
            .map(|attempt| self.calculate_backoff_delay(attempt))
            .collect()
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// Build broker options from the configuration
pub fn configure_mqtt_options(client_id: &str, config: &MqttSection) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, config.broker.as_str(), config.port);

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.as_str(), password.as_str());
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_clean_start(true);

    mqtt_options
}
