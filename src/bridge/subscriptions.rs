//! Command-topic subscriptions for the units of the connected network

use crate::mesh::Session;
use crate::protocol::{command_topic, is_publishable_level};
use crate::transport::Broker;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Tracks which units already have a command subscription
///
/// Units that join the mesh after startup get their subscription the first time
/// their state is published.
pub struct SubscriptionTracker<B: Broker> {
    broker: Arc<B>,
    base_topic: String,
    network_name: String,
    subscribed: Mutex<HashSet<String>>,
}

impl<B: Broker> SubscriptionTracker<B> {
    pub fn new(broker: Arc<B>, base_topic: &str, network_name: &str) -> Self {
        Self {
            broker,
            base_topic: base_topic.to_string(),
            network_name: network_name.to_string(),
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    /// Subscribe to the command topic of every unit in `session`
    ///
    /// Returns how many subscriptions succeeded. Failures are logged and retried
    /// the next time the unit changes.
    pub async fn subscribe_all(&self, session: &Session) -> usize {
        let mut subscribed = 0;
        for unit in session.units() {
            if self.ensure_subscribed(&unit.name).await {
                subscribed += 1;
            }
        }
        info!(
            network = %self.network_name,
            subscribed,
            units = session.unit_count(),
            "Command topics subscribed"
        );
        subscribed
    }

    /// Subscribe to `unit_name`'s command topic unless that already happened
    ///
    /// Returns true when a new subscription was made.
    pub async fn ensure_subscribed(&self, unit_name: &str) -> bool {
        if !is_publishable_level(unit_name) {
            warn!(unit = unit_name, "Unit name cannot be used in a topic, not subscribing");
            return false;
        }
        if !self.lock().insert(unit_name.to_string()) {
            return false;
        }

        let topic = command_topic(&self.base_topic, &self.network_name, unit_name);
        match self.broker.subscribe(&topic).await {
            Ok(()) => {
                info!(topic = %topic, "Subscribed to command topic");
                true
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to subscribe to command topic");
                self.lock().remove(unit_name);
                false
            }
        }
    }

    pub fn is_subscribed(&self, unit_name: &str) -> bool {
        self.lock().contains(unit_name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.subscribed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{Network, Unit};
    use crate::testing::MockBroker;

    fn session() -> Session {
        Session::new(
            Network::new("aa:bb"),
            "Home",
            vec![
                Unit::new(1, "Lamp1"),
                Unit::new(2, "Blind"),
                Unit::new(3, "Bad#Name"),
            ],
        )
    }

    #[tokio::test]
    async fn test_subscribe_all_skips_unusable_names() {
        let broker = Arc::new(MockBroker::connected());
        let tracker = SubscriptionTracker::new(broker.clone(), "casambi", "Home");

        assert_eq!(tracker.subscribe_all(&session()).await, 2);
        assert_eq!(
            broker.subscriptions(),
            vec![
                "casambi/Home/Blind/cmnd".to_string(),
                "casambi/Home/Lamp1/cmnd".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_subscribed_once() {
        let broker = Arc::new(MockBroker::connected());
        let tracker = SubscriptionTracker::new(broker.clone(), "casambi", "Home");

        assert!(tracker.ensure_subscribed("Lamp9").await);
        assert!(!tracker.ensure_subscribed("Lamp9").await);
        assert_eq!(broker.subscribe_attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_subscription_is_retried() {
        let broker = Arc::new(MockBroker::connected());
        broker.fail_subscribe(true);
        let tracker = SubscriptionTracker::new(broker.clone(), "casambi", "Home");

        assert!(!tracker.ensure_subscribed("Lamp1").await);
        assert!(!tracker.is_subscribed("Lamp1"));

        broker.fail_subscribe(false);
        assert!(tracker.ensure_subscribed("Lamp1").await);
        assert!(tracker.is_subscribed("Lamp1"));
    }
}
