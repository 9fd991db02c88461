//! Mesh side of the bridge
//!
//! [`MeshClient`] abstracts the radio protocol stack: discovery, session setup,
//! unit control and change notifications. [`MeshLink`] wraps a client with the
//! connection state and the unit registry the rest of the bridge reads from.

pub mod link;
pub mod selection;
pub mod unit;
pub mod virtual_network;

pub use link::{ConnectedSession, MeshLink, MeshLinkState};
pub use selection::{
    choose_network, FirstNetworkSelector, FixedIndexSelector, InteractiveSelector,
    NetworkSelector,
};
pub use unit::{ColorSource, Network, Rgb, Session, Unit, UnitCapabilities, UnitState};
pub use virtual_network::{MeshCommand, VirtualMesh, VirtualNetwork};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors raised by the mesh client or the mesh link
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshError {
    #[error("Authentication with network failed: {0}")]
    Authentication(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Unit '{0}' is unreachable")]
    UnitUnreachable(String),

    #[error("Unit '{unit}' rejected command: {reason}")]
    CommandRejected { unit: String, reason: String },

    #[error("Unknown unit: {0}")]
    UnknownUnit(String),

    #[error("Mesh link is not connected")]
    NotConnected,

    #[error("No networks found")]
    NoNetworks,

    #[error("Invalid network selection: {0}")]
    InvalidSelection(String),
}

impl MeshError {
    /// Errors that end the bridge rather than a single command
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MeshError::Authentication(_)
                | MeshError::NetworkUnavailable(_)
                | MeshError::NoNetworks
                | MeshError::InvalidSelection(_)
                | MeshError::NotConnected
        )
    }
}

/// Protocol-level mesh client
#[async_trait]
pub trait MeshClient: Send + Sync + 'static {
    /// Scan for reachable networks, waiting at most `timeout`
    async fn discover(&self, timeout: Duration) -> Result<Vec<Network>, MeshError>;

    /// Open a session with `network`, returning the network's name
    async fn connect(&self, network: &Network, password: &str) -> Result<String, MeshError>;

    /// Units of the connected network
    async fn units(&self) -> Result<Vec<Unit>, MeshError>;

    /// Stream of units whose state changed; the stream closes when the session drops
    fn subscribe_unit_changes(&self) -> Result<broadcast::Receiver<Unit>, MeshError>;

    async fn set_level(&self, unit: &Unit, level: u8) -> Result<(), MeshError>;

    /// `kelvin` is already inside the unit's supported range
    async fn set_temperature(&self, unit: &Unit, kelvin: u32) -> Result<(), MeshError>;

    async fn set_vertical(&self, unit: &Unit, value: u8) -> Result<(), MeshError>;

    async fn disconnect(&self) -> Result<(), MeshError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(MeshError::Authentication("bad".into()).is_fatal());
        assert!(MeshError::NetworkUnavailable("gone".into()).is_fatal());
        assert!(MeshError::NoNetworks.is_fatal());
        assert!(MeshError::NotConnected.is_fatal());
        assert!(!MeshError::UnitUnreachable("Lamp1".into()).is_fatal());
        assert!(!MeshError::UnknownUnit("Lamp9".into()).is_fatal());
        assert!(!MeshError::CommandRejected {
            unit: "Lamp1".into(),
            reason: "no dimmer".into()
        }
        .is_fatal());
    }
}
