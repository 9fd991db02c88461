//! Mock implementations for testing
//!
//! [`MockBroker`] records everything the bridge publishes and subscribes to and lets
//! tests inject inbound messages and connection state changes.

use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::{Broker, InboundMessage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

/// One message accepted by [`MockBroker::publish`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// In-memory broker
pub struct MockBroker {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<String>>,
    sender: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    state_tx: watch::Sender<ConnectionState>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    publish_attempts: AtomicUsize,
    subscribe_attempts: AtomicUsize,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
}

impl Default for MockBroker {
    fn default() -> Self {
        let (state_tx, _) =
            watch::channel(ConnectionState::Disconnected("Not connected".to_string()));
        Self {
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
            state_tx,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            publish_attempts: AtomicUsize::new(0),
            subscribe_attempts: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that is already in the Connected state
    pub fn connected() -> Self {
        let broker = Self::default();
        broker.set_state(ConnectionState::Connected);
        broker
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Simulate the broker link moving to `state`
    pub fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        lock(&self.published)
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }

    pub fn clear_history(&self) {
        lock(&self.published).clear();
        self.publish_attempts.store(0, Ordering::SeqCst);
    }

    /// Deliver a message as if it arrived on a subscribed topic
    ///
    /// Returns false when no consumer is installed.
    pub async fn inject_message(&self, topic: &str, payload: &[u8]) -> bool {
        let sender = lock(&self.sender).clone();
        match sender {
            Some(sender) => sender
                .send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    retain: false,
                })
                .await
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected(
                "Mock connection failure".to_string(),
            ));
            return Err(MqttError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        let was_disconnected = self.state_tx.send_if_modified(|state| {
            if matches!(state, ConnectionState::Disconnected(_)) {
                false
            } else {
                *state = ConnectionState::Disconnected("Client disconnected".to_string());
                true
            }
        });
        if was_disconnected {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MqttError::SubscriptionFailed(
                format!("Mock subscription failure for {topic}").into(),
            ));
        }
        let mut subscriptions = lock(&self.subscriptions);
        if !subscriptions.iter().any(|existing| existing == topic) {
            subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), Self::Error> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }
        let state = self.connection_state();
        if state != ConnectionState::Connected {
            return Err(MqttError::NotConnected { state });
        }
        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *lock(&self.sender) = Some(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_broker_records_traffic() {
        let broker = MockBroker::new();
        broker.connect().await.unwrap();
        broker.subscribe("casambi/Home/Lamp1/cmnd").await.unwrap();
        broker.subscribe("casambi/Home/Lamp1/cmnd").await.unwrap();
        broker
            .publish("casambi/health/STATE", b"OK".to_vec(), false)
            .await
            .unwrap();

        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.subscriptions().len(), 1);
        assert_eq!(broker.published_to("casambi/health/STATE").len(), 1);
    }

    #[tokio::test]
    async fn test_mock_broker_rejects_publish_when_disconnected() {
        let broker = MockBroker::new();
        assert!(matches!(
            broker.publish("t", Vec::new(), false).await,
            Err(MqttError::NotConnected { .. })
        ));
        assert_eq!(broker.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn test_mock_broker_disconnect_counts_once() {
        let broker = MockBroker::connected();
        broker.disconnect().await.unwrap();
        broker.disconnect().await.unwrap();
        assert_eq!(broker.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_inject_message() {
        let broker = MockBroker::new();
        assert!(!broker.inject_message("t", b"{}").await);

        let (tx, mut rx) = mpsc::channel(1);
        broker.set_message_sender(tx);
        assert!(broker.inject_message("t", b"{}").await);
        assert_eq!(rx.recv().await.unwrap().topic, "t");
    }
}
