//! Periodic liveness message

use crate::protocol::{HEALTH_PAYLOAD, HEALTH_TOPIC};
use crate::transport::Broker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Publish the liveness message once, not retained
pub async fn publish_liveness<B: Broker>(broker: &B) -> bool {
    match broker
        .publish(HEALTH_TOPIC, HEALTH_PAYLOAD.as_bytes().to_vec(), false)
        .await
    {
        Ok(()) => {
            debug!(topic = HEALTH_TOPIC, "Published liveness");
            true
        }
        Err(e) => {
            // Keep going; the next tick tries again
            warn!(topic = HEALTH_TOPIC, error = %e, "Failed to publish liveness");
            false
        }
    }
}

/// Publish liveness immediately and then every `period` until `shutdown` turns true
pub fn spawn_liveness_task<B: Broker>(
    broker: Arc<B>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = period.as_secs(), "Start health interval");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    publish_liveness(broker.as_ref()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Liveness task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;

    #[tokio::test(start_paused = true)]
    async fn test_publishes_immediately_then_every_period() {
        let broker = Arc::new(MockBroker::connected());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_liveness_task(broker.clone(), Duration::from_secs(60), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.published_to(HEALTH_TOPIC).len(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        let published = broker.published_to(HEALTH_TOPIC);
        assert_eq!(published.len(), 3);
        assert!(published.iter().all(|m| m.payload == b"OK" && !m.retain));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_survives_publish_failures() {
        let broker = Arc::new(MockBroker::connected());
        broker.fail_publish(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_liveness_task(broker.clone(), Duration::from_secs(60), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!handle.is_finished());
        assert_eq!(broker.publish_attempts(), 2);

        broker.fail_publish(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.published_to(HEALTH_TOPIC).len(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
