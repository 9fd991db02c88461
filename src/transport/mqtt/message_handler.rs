//! Pure event routing and inbound message forwarding for the MQTT client

use crate::transport::InboundMessage;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::{mqttbytes::QoS, Event};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                }),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    count: suback.return_codes.len(),
                    refused: suback
                        .return_codes
                        .iter()
                        .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                        .map(|code| format!("{code:?}"))
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Delivery quality for every publish and subscription
    ///
    /// Publishing never waits for a broker acknowledgment.
    pub fn determine_qos_level() -> QoS {
        QoS::AtMostOnce
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived(InboundMessage),
    /// Broker sent a disconnect
    Disconnected,
    /// SubAck; `refused` holds the reason codes of filters the broker rejected
    SubscriptionConfirmed {
        packet_id: u16,
        count: usize,
        refused: Vec<String>,
    },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Hands inbound messages to the bridge
///
/// The sender can be installed after the event loop has started; messages arriving
/// before that are dropped with a warning.
#[derive(Default)]
pub struct MessageForwarder {
    sender: Mutex<Option<mpsc::Sender<InboundMessage>>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    /// Forward in arrival order; waits while the consumer is busy
    pub async fn forward(&self, message: InboundMessage) -> Result<(), String> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match sender {
            Some(sender) => {
                debug!(topic = %message.topic, bytes = message.payload.len(), "Forwarding message");
                sender
                    .send(message)
                    .await
                    .map_err(|e| format!("Failed to forward message: {e}"))
            }
            None => {
                warn!(topic = %message.topic, "Received MQTT message but no consumer configured - message dropped");
                Err("No message sender configured".to_string())
            }
        }
    }
}
