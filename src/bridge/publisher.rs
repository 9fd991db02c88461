//! State Publisher: confirmed unit state to retained broker messages

use super::subscriptions::SubscriptionTracker;
use crate::error::{BridgeError, BridgeResult};
use crate::mesh::Unit;
use crate::observability::metrics::metrics;
use crate::protocol::{encode_state, is_publishable_level, state_topic};
use crate::transport::Broker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct StatePublisher<B: Broker> {
    broker: Arc<B>,
    base_topic: String,
    network_name: String,
    subscriptions: Arc<SubscriptionTracker<B>>,
}

impl<B: Broker> StatePublisher<B> {
    pub fn new(
        broker: Arc<B>,
        base_topic: &str,
        network_name: &str,
        subscriptions: Arc<SubscriptionTracker<B>>,
    ) -> Self {
        Self {
            broker,
            base_topic: base_topic.to_string(),
            network_name: network_name.to_string(),
            subscriptions,
        }
    }

    /// Publish `unit`'s state, retained
    ///
    /// Failures are logged and returned but never retried; the unit's next change
    /// publishes again.
    pub async fn publish(&self, unit: &Unit) -> BridgeResult<()> {
        info!(
            unit = %unit.name,
            on = unit.on,
            dimmer = ?unit.state.dimmer,
            vertical = ?unit.state.vertical,
            temperature = ?unit.state.temperature,
            "Unit change"
        );

        if !is_publishable_level(&unit.name) {
            warn!(unit = %unit.name, "Unit name cannot be used in a topic, state not published");
            return Err(BridgeError::publish_failure(
                unit.name.clone(),
                "unit name is not a valid topic level",
            ));
        }

        self.subscriptions.ensure_subscribed(&unit.name).await;

        let topic = state_topic(&self.base_topic, &self.network_name, &unit.name);
        let payload = encode_state(unit)?;
        match self.broker.publish(&topic, payload, true).await {
            Ok(()) => {
                metrics().mqtt_message_published();
                debug!(topic = %topic, "Published unit state");
                Ok(())
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                warn!(topic = %topic, error = %e, "Failed to publish unit state");
                Err(BridgeError::publish_failure(topic, e.to_string()))
            }
        }
    }

    /// Publish every change until the mesh link stops producing them
    pub async fn run(self, mut changes: mpsc::Receiver<Arc<Unit>>) {
        while let Some(unit) = changes.recv().await {
            // Already logged; the next change publishes again
            let _ = self.publish(&unit).await;
        }
        debug!("State publisher stopped");
    }
}
