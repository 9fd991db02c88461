//! Casambi ⇄ MQTT bridge
//!
//! Bridges a Casambi wireless lighting mesh network to an MQTT broker so that home
//! automation systems can observe unit state and issue commands through topics.
//!
//! # Overview
//!
//! - [`protocol`] - topic layout and JSON payload codec
//! - [`transport`] - the broker link (rumqttc client with bounded reconnection)
//! - [`mesh`] - the mesh link (discovery, session registry, unit commands)
//! - [`bridge`] - command router, state publisher, liveness task and the orchestrator
//! - [`observability`] - structured logging and runtime counters
//!
//! # Quick Start
//!
//! ```rust
//! use casambi_mqtt::mesh::{Unit, UnitState};
//! use casambi_mqtt::protocol::{command_topic, encode_state, state_topic};
//!
//! let mut unit = Unit::new(1, "Lamp1");
//! unit.on = true;
//! unit.state = UnitState {
//!     dimmer: Some(80),
//!     temperature: Some(2700),
//!     ..Default::default()
//! };
//!
//! assert_eq!(state_topic("casambi", "Home", "Lamp1"), "casambi/Home/Lamp1/state");
//! assert_eq!(command_topic("casambi", "Home", "Lamp1"), "casambi/Home/Lamp1/cmnd");
//!
//! let payload = encode_state(&unit).unwrap();
//! let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
//! assert_eq!(json["dimmer"], 80);
//! assert!(json["rgb"].is_null());
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod mesh;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use bridge::{BridgeLifecycle, BridgeState, TerminationReason};
pub use config::*;
pub use error::{BridgeError, BridgeResult};
pub use mesh::{MeshClient, MeshError, MeshLink, Network, Unit, UnitState};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
pub use transport::{Broker, InboundMessage};
