//! MQTT client for the bridge's broker link
//!
//! Pure functions are separated from I/O:
//!
//! - [`connection`] - connection states, backoff policy and broker options
//! - [`message_handler`] - event routing and inbound message forwarding
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`client`] - the event loop supervisor and the [`Broker`](crate::transport::Broker) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use casambi_mqtt::config::MqttSection;
//! use casambi_mqtt::transport::mqtt::{MqttClient, ReconnectConfig};
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker: "localhost".to_string(),
//!     port: 1883,
//!     base_topic: "casambi".to_string(),
//!     ..Default::default()
//! };
//!
//! let client = MqttClient::new(&config, ReconnectConfig::default());
//! client.connect().await?;
//! client.subscribe("casambi/Home/Lamp1/cmnd").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{reconnect_with_backoff, MqttClient};
pub use connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
