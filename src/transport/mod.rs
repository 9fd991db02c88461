//! Broker transport
//!
//! [`Broker`] abstracts the publish/subscribe link so the bridge can be driven by
//! the MQTT client in production and by a recording mock in tests.

use tokio::sync::{mpsc, watch};

pub mod mqtt;

pub use mqtt::ConnectionState;

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set when the broker delivered a retained message
    pub retain: bool,
}

/// Publish/subscribe link to a message broker
///
/// Methods take `&self` so one link can be shared between the router, the state
/// publisher and the liveness task.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect and wait for the broker's acknowledgment
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Close the connection; repeated calls are no-ops
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Subscribe to `topic`; the subscription survives reconnects
    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error>;

    /// Publish without waiting for delivery acknowledgment
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
    -> Result<(), Self::Error>;

    fn connection_state(&self) -> ConnectionState;

    /// Observe connection state changes
    fn state_receiver(&self) -> watch::Receiver<ConnectionState>;

    /// Where inbound messages are delivered, in arrival order
    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>);

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }

    /// True once reconnection has given up
    fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            ConnectionState::PermanentlyDisconnected(_)
        )
    }
}
