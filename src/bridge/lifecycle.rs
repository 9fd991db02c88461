//! Bridge lifecycle: startup sequence, steady state and ordered shutdown
//!
//! ```text
//! Idle → BrokerConnecting → AwaitingMesh → MeshDiscovering → MeshSelecting
//!      → MeshConnecting → Subscribing → Running → ShuttingDown → Stopped
//! ```
//!
//! Broker reconnects while Running are handled by the broker link itself. The
//! bridge only leaves Running on a termination signal, a broker link that has
//! given up reconnecting, or a mesh session that died.

use super::liveness::spawn_liveness_task;
use super::publisher::StatePublisher;
use super::router::CommandRouter;
use super::subscriptions::SubscriptionTracker;
use crate::config::BridgeConfig;
use crate::mesh::{
    choose_network, ConnectedSession, MeshClient, MeshError, MeshLink, MeshLinkState,
    NetworkSelector,
};
use crate::observability::metrics::metrics;
use crate::protocol::is_publishable_level;
use crate::transport::{Broker, ConnectionState};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

const INBOUND_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    BrokerConnecting,
    AwaitingMesh,
    MeshDiscovering,
    MeshSelecting,
    MeshConnecting,
    Subscribing,
    Running,
    ShuttingDown,
    Stopped,
}

impl BridgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeState::Idle => "idle",
            BridgeState::BrokerConnecting => "broker_connecting",
            BridgeState::AwaitingMesh => "awaiting_mesh",
            BridgeState::MeshDiscovering => "mesh_discovering",
            BridgeState::MeshSelecting => "mesh_selecting",
            BridgeState::MeshConnecting => "mesh_connecting",
            BridgeState::Subscribing => "subscribing",
            BridgeState::Running => "running",
            BridgeState::ShuttingDown => "shutting_down",
            BridgeState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a running bridge stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Signal,
    BrokerFailed(String),
    MeshFailed(String),
}

impl TerminationReason {
    /// Process exit status for this reason
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationReason::Signal => 0,
            TerminationReason::BrokerFailed(_) | TerminationReason::MeshFailed(_) => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Broker error: {0}")]
    Broker(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),
    #[error("Network name '{0}' cannot be used in a topic")]
    InvalidNetworkName(String),
    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: BridgeState,
    },
}

/// Owns both links and the tasks that connect them
pub struct BridgeLifecycle<B: Broker, C: MeshClient> {
    config: BridgeConfig,
    broker: Arc<B>,
    mesh: Arc<MeshLink<C>>,
    selector: Arc<dyn NetworkSelector>,
    state_tx: watch::Sender<BridgeState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    liveness: Option<JoinHandle<()>>,
}

impl<B: Broker, C: MeshClient> BridgeLifecycle<B, C> {
    pub fn new(
        config: BridgeConfig,
        broker: Arc<B>,
        mesh_client: Arc<C>,
        selector: Arc<dyn NetworkSelector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(BridgeState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            broker,
            mesh: Arc::new(MeshLink::new(mesh_client)),
            selector,
            state_tx,
            shutdown_tx,
            tasks: Vec::new(),
            liveness: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn mesh(&self) -> &Arc<MeshLink<C>> {
        &self.mesh
    }

    fn transition(&self, next: BridgeState) {
        let previous = self.state_tx.send_replace(next);
        metrics().set_bridge_state(next.as_str());
        info!(from = %previous, to = %next, "Bridge state");
    }

    /// Run the startup sequence up to Running
    ///
    /// On error the bridge stays in the failed step; call [`shutdown`](Self::shutdown)
    /// to release whatever was already connected.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != BridgeState::Idle {
            return Err(LifecycleError::InvalidState {
                action: "start",
                state,
            });
        }

        // Installed before connecting so nothing delivered after subscribing is lost
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        self.broker.set_message_sender(inbound_tx);

        self.transition(BridgeState::BrokerConnecting);
        self.broker
            .connect()
            .await
            .map_err(|e| LifecycleError::Broker(Box::new(e)))?;
        info!("Connected to MQTT broker");

        self.transition(BridgeState::AwaitingMesh);

        self.transition(BridgeState::MeshDiscovering);
        let networks = self
            .mesh
            .discover(self.config.casambi.discovery_timeout())
            .await?;
        if networks.is_empty() {
            error!("No mesh network found");
            return Err(MeshError::NoNetworks.into());
        }

        self.transition(BridgeState::MeshSelecting);
        let selector = self.selector.clone();
        let candidates = networks.clone();
        let network = tokio::task::spawn_blocking(move || {
            choose_network(&candidates, selector.as_ref())
        })
        .await
        .map_err(|e| MeshError::InvalidSelection(format!("selection task failed: {e}")))??;
        info!(network = %network, "Selected mesh network");

        self.transition(BridgeState::MeshConnecting);
        let ConnectedSession { session, changes } = self
            .mesh
            .connect(&network, &self.config.casambi.network_password)
            .await?;
        let network_name = session.network_name().to_string();
        info!(network = %network_name, "Connected to network");
        if !is_publishable_level(&network_name) {
            return Err(LifecycleError::InvalidNetworkName(network_name));
        }

        self.transition(BridgeState::Subscribing);
        let base_topic = self.config.mqtt.base_topic.clone();
        let subscriptions = Arc::new(SubscriptionTracker::new(
            self.broker.clone(),
            &base_topic,
            &network_name,
        ));
        subscriptions.subscribe_all(&session).await;

        let publisher = StatePublisher::new(
            self.broker.clone(),
            &base_topic,
            &network_name,
            subscriptions,
        );
        let span = crate::lifecycle_span!(network = %network_name);
        self.tasks
            .push(tokio::spawn(publisher.run(changes).instrument(span.clone())));

        let router = CommandRouter::new(self.mesh.clone(), &base_topic, &network_name);
        self.tasks
            .push(tokio::spawn(router.run(inbound_rx).instrument(span)));

        self.liveness = Some(spawn_liveness_task(
            self.broker.clone(),
            self.config.health.interval(),
            self.shutdown_tx.subscribe(),
        ));

        self.transition(BridgeState::Running);
        Ok(())
    }

    /// Wait in Running until `signal` resolves or a link fails, then shut down
    pub async fn run_until_terminated<F>(&mut self, signal: F) -> TerminationReason
    where
        F: Future<Output = ()>,
    {
        let broker_state = self.broker.state_receiver();
        let mesh_state = self.mesh.state_receiver();

        let reason = tokio::select! {
            _ = signal => {
                info!("Termination signal received");
                TerminationReason::Signal
            }
            reason = broker_failure(broker_state) => reason,
            reason = mesh_failure(mesh_state) => reason,
        };

        match &reason {
            TerminationReason::Signal => {}
            TerminationReason::BrokerFailed(why) => error!(reason = %why, "Broker link failed"),
            TerminationReason::MeshFailed(why) => error!(reason = %why, "Mesh link failed"),
        }

        self.shutdown().await;
        reason
    }

    /// Start, then run until terminated
    ///
    /// A failed start still performs the ordered shutdown before the error is returned.
    pub async fn run<F>(&mut self, signal: F) -> Result<TerminationReason, LifecycleError>
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.start().await {
            error!(error = %e, "Bridge startup failed");
            self.shutdown().await;
            return Err(e);
        }
        Ok(self.run_until_terminated(signal).await)
    }

    /// Disconnect the mesh, then the broker, each bounded by the disconnect timeout
    ///
    /// Safe to call repeatedly; only the first call has any effect.
    pub async fn shutdown(&mut self) {
        if matches!(
            self.state(),
            BridgeState::ShuttingDown | BridgeState::Stopped
        ) {
            return;
        }
        self.transition(BridgeState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);
        if let Some(liveness) = self.liveness.take() {
            if tokio::time::timeout(Duration::from_secs(1), liveness)
                .await
                .is_err()
            {
                warn!("Liveness task did not stop in time");
            }
        }

        let limit = self.config.casambi.disconnect_timeout();

        match tokio::time::timeout(limit, self.mesh.disconnect()).await {
            Ok(Ok(())) => info!("Mesh link disconnected"),
            Ok(Err(e)) => warn!(error = %e, "Mesh disconnect failed"),
            Err(_) => warn!(timeout_secs = limit.as_secs(), "Mesh disconnect timed out"),
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }

        match tokio::time::timeout(limit, self.broker.disconnect()).await {
            Ok(Ok(())) => info!("Broker link disconnected"),
            Ok(Err(e)) => warn!(error = %e, "Broker disconnect failed"),
            Err(_) => warn!(timeout_secs = limit.as_secs(), "Broker disconnect timed out"),
        }

        self.transition(BridgeState::Stopped);
    }
}

/// Resolves once the broker link gives up reconnecting
async fn broker_failure(mut state: watch::Receiver<ConnectionState>) -> TerminationReason {
    let reason = state
        .wait_for(|s| matches!(s, ConnectionState::PermanentlyDisconnected(_)))
        .await
        .ok()
        .map(|s| match &*s {
            ConnectionState::PermanentlyDisconnected(reason) => reason.clone(),
            other => format!("{other:?}"),
        });

    match reason {
        Some(reason) => TerminationReason::BrokerFailed(reason),
        None => std::future::pending().await,
    }
}

/// Resolves once the mesh session fails
async fn mesh_failure(mut state: watch::Receiver<MeshLinkState>) -> TerminationReason {
    let reason = state
        .wait_for(|s| matches!(s, MeshLinkState::Failed(_)))
        .await
        .ok()
        .map(|s| match &*s {
            MeshLinkState::Failed(reason) => reason.clone(),
            other => format!("{other:?}"),
        });

    match reason {
        Some(reason) => TerminationReason::MeshFailed(reason),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(BridgeState::Idle.to_string(), "idle");
        assert_eq!(BridgeState::MeshSelecting.to_string(), "mesh_selecting");
        assert_eq!(BridgeState::Stopped.as_str(), "stopped");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TerminationReason::Signal.exit_code(), 0);
        assert_eq!(TerminationReason::BrokerFailed("x".into()).exit_code(), 1);
        assert_eq!(TerminationReason::MeshFailed("x".into()).exit_code(), 1);
    }

    #[tokio::test]
    async fn test_broker_failure_waits_for_permanent_disconnect() {
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        let waiter = tokio::spawn(broker_failure(rx));

        tx.send_replace(ConnectionState::Reconnecting(1));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send_replace(ConnectionState::PermanentlyDisconnected("gave up".into()));
        assert_eq!(
            waiter.await.unwrap(),
            TerminationReason::BrokerFailed("gave up".into())
        );
    }

    #[tokio::test]
    async fn test_mesh_failure_ignores_closed_channel() {
        let (tx, rx) = watch::channel(MeshLinkState::Connected);
        drop(tx);
        let outcome = tokio::time::timeout(Duration::from_millis(20), mesh_failure(rx)).await;
        assert!(outcome.is_err());
    }
}
