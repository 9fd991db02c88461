//! Impure I/O operations for the MQTT client
//!
//! A supervisor task owns the rumqttc event loop. It forwards inbound publishes,
//! re-issues tracked subscriptions after every ConnAck and, when an established
//! connection drops, reconnects with exponential backoff until the attempt budget
//! is spent.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::observability::metrics::metrics;
use crate::transport::{Broker, InboundMessage};
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, ConnectionError, EventLoop, MqttOptions, StateError};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Capacity of the request channel between `AsyncClient` and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;
/// How long `disconnect` waits for the supervisor to flush and stop
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// MQTT client for the bridge's broker link
pub struct MqttClient {
    client_id: String,
    options: MqttOptions,
    connect_timeout: Duration,
    reconnect_config: ReconnectConfig,
    client: Arc<Mutex<Option<AsyncClient>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_tx: watch::Sender<bool>,
    closing: Arc<AtomicBool>,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    /// Topics whose SubAck has not arrived yet, in request order
    awaiting_suback: Arc<Mutex<VecDeque<String>>>,
    forwarder: Arc<MessageForwarder>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    pub fn new(config: &MqttSection, reconnect_config: ReconnectConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(generate_client_id);
        let options = configure_mqtt_options(&client_id, config);
        let (state_tx, _) =
            watch::channel(ConnectionState::Disconnected("Not connected".to_string()));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            client_id,
            options,
            connect_timeout: config.connect_timeout(),
            reconnect_config,
            client: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(state_tx),
            shutdown_tx,
            closing: Arc::new(AtomicBool::new(false)),
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
            awaiting_suback: Arc::new(Mutex::new(VecDeque::new())),
            forwarder: Arc::new(MessageForwarder::new()),
            supervisor: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Topics re-issued after every (re)connect
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed_topics.lock().await.clone()
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
                match &*state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailed(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(MqttError::ConnectionFailed(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Connect and wait for the broker's ConnAck
    ///
    /// A failure before the first ConnAck is returned to the caller; only an
    /// established connection is retried.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return Err(MqttError::ConnectionFailed(
                "Event loop already started".to_string(),
            ));
        }

        self.closing.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(false);
        let (client, event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CHANNEL_CAPACITY);
        *self.client.lock().await = Some(client);
        transition(&self.state_tx, ConnectionState::Connecting);
        let state_rx = self.state_tx.subscribe();

        info!(
            client_id = %self.client_id,
            broker = ?self.options.broker_address(),
            "Connecting to MQTT broker"
        );

        let context = SupervisorContext {
            options: self.options.clone(),
            connect_timeout: self.connect_timeout,
            reconnect_config: self.reconnect_config.clone(),
            client: self.client.clone(),
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            closing: self.closing.clone(),
            subscribed_topics: self.subscribed_topics.clone(),
            awaiting_suback: self.awaiting_suback.clone(),
            forwarder: self.forwarder.clone(),
        };
        let span = crate::mqtt_span!(client_id = %self.client_id);
        *supervisor = Some(tokio::spawn(
            run_supervisor(context, event_loop).instrument(span),
        ));
        drop(supervisor);

        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, self.connect_timeout).await
        {
            if let Some(handle) = self.supervisor.lock().await.take() {
                handle.abort();
            }
            *self.client.lock().await = None;
            transition(&self.state_tx, ConnectionState::Disconnected(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    /// Close the broker connection. Safe to call repeatedly or before `connect`.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("MQTT client already disconnecting");
            return Ok(());
        }

        let client = self.client.lock().await.take();
        let connected = matches!(*self.state_tx.borrow(), ConnectionState::Connected);
        match client {
            Some(client) if connected => {
                match tokio::time::timeout(DISCONNECT_GRACE, client.disconnect()).await {
                    Ok(Ok(())) => debug!("Disconnect request queued"),
                    Ok(Err(e)) => warn!(error = %e, "Failed to queue disconnect request"),
                    Err(_) => warn!("Timed out queueing disconnect request"),
                }
            }
            _ => {
                // No live connection to close; stop any pending reconnection now
                debug!("No established connection, stopping the supervisor");
                let _ = self.shutdown_tx.send(true);
            }
        }

        if let Some(mut handle) = self.supervisor.lock().await.take() {
            match tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await {
                Ok(_) => info!("Event loop task shut down gracefully"),
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    let _ = self.shutdown_tx.send(true);
                    handle.abort();
                }
            }
        }

        transition(
            &self.state_tx,
            ConnectionState::Disconnected("Client disconnected".to_string()),
        );
        metrics().mqtt_connection_lost();
        info!("MQTT client disconnected");
        Ok(())
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let current_state = self.state_tx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    async fn current_client(&self) -> Result<AsyncClient, MqttError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| MqttError::NotConnected {
                state: self.state_tx.borrow().clone(),
            })
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.check_connection_state()?;
        let client = self.current_client().await?;
        client
            .publish(topic, MessageHandler::determine_qos_level(), retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;
        debug!(topic, retain, "Published message");
        Ok(())
    }

    /// Subscribe and track the topic for re-subscription
    ///
    /// While disconnected the topic is still tracked, so it is issued on the next
    /// ConnAck, and `NotConnected` is returned.
    pub async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        {
            let mut topics = self.subscribed_topics.lock().await;
            if topics.iter().any(|t| t == topic) {
                debug!(topic, "Already subscribed");
                return Ok(());
            }
            let state = self.state_tx.borrow().clone();
            if !HealthMonitor::can_subscribe(&state) {
                topics.push(topic.to_string());
                return Err(MqttError::NotConnected { state });
            }
        }

        let client = self.current_client().await?;
        self.awaiting_suback.lock().await.push_back(topic.to_string());
        if let Err(e) = client
            .subscribe(topic, MessageHandler::determine_qos_level())
            .await
        {
            self.awaiting_suback.lock().await.retain(|t| t != topic);
            return Err(MqttError::SubscriptionFailed(
                format!("Failed to subscribe to {topic}: {e}").into(),
            ));
        }

        let mut topics = self.subscribed_topics.lock().await;
        if !topics.iter().any(|t| t == topic) {
            topics.push(topic.to_string());
        }
        info!(topic, "Subscription requested");
        Ok(())
    }
}

#[async_trait]
impl Broker for MqttClient {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, topic).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, retain).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        self.forwarder.set_sender(sender);
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("casambi-mqtt-{}", &id[..8])
}

/// Publish a new connection state and log the transition
fn transition(state_tx: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let previous = state_tx.send_replace(next.clone());
    if previous != next {
        HealthMonitor::log_state_transition(&previous, &next);
    }
}

/// Sleep for `delay` unless shutdown is requested first
///
/// Returns true if the sleep completed, false if shutdown was requested.
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
            }
        }
    }
}

/// Drive reconnection attempts until one succeeds, the budget is spent, or
/// shutdown is requested
///
/// Publishes `Reconnecting(n)` before attempt `n`, `Connected` after a successful
/// attempt and `PermanentlyDisconnected` once the attempts are exhausted.
pub async fn reconnect_with_backoff<T, F, Fut>(
    config: &ReconnectConfig,
    state_tx: &watch::Sender<ConnectionState>,
    shutdown_rx: &mut watch::Receiver<bool>,
    mut attempt_fn: F,
) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut attempts_made = 0u32;
    loop {
        let decision =
            HealthMonitor::should_attempt_reconnection(attempts_made, config, *shutdown_rx.borrow());

        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                transition(
                    state_tx,
                    HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(
                        attempt,
                    )),
                );
                let max_display = config
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    attempt,
                    max = %max_display,
                    delay_secs = delay.as_secs_f64(),
                    "Attempting reconnection"
                );

                if !interruptible_sleep(shutdown_rx, delay).await {
                    return None;
                }

                metrics().mqtt_reconnect_attempt();
                match attempt_fn(attempt).await {
                    Ok(_) if *shutdown_rx.borrow() => {
                        info!(
                            attempt,
                            "Shutdown requested during reconnection attempt, dropping connection"
                        );
                        return None;
                    }
                    Ok(connection) => {
                        transition(
                            state_tx,
                            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
                        );
                        return Some(connection);
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "Reconnection attempt failed");
                        attempts_made = attempt;
                    }
                }
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                return None;
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!("Max reconnection attempts ({attempts_made}) exceeded");
                transition(
                    state_tx,
                    HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(reason)),
                );
                return None;
            }
        }
    }
}

struct SupervisorContext {
    options: MqttOptions,
    connect_timeout: Duration,
    reconnect_config: ReconnectConfig,
    client: Arc<Mutex<Option<AsyncClient>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_rx: watch::Receiver<bool>,
    closing: Arc<AtomicBool>,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    awaiting_suback: Arc<Mutex<VecDeque<String>>>,
    forwarder: Arc<MessageForwarder>,
}

impl SupervisorContext {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || *self.shutdown_rx.borrow()
    }

    /// Re-issue tracked subscriptions
    ///
    /// Runs on its own task: subscribing goes through the request channel that only
    /// drains while the supervisor keeps polling.
    async fn on_connected(&self) {
        metrics().mqtt_connection_established();
        let Some(client) = self.client.lock().await.clone() else {
            return;
        };
        let topics = self.subscribed_topics.lock().await.clone();
        if topics.is_empty() {
            return;
        }
        self.awaiting_suback
            .lock()
            .await
            .extend(topics.iter().cloned());

        tokio::spawn(async move {
            for topic in topics {
                match client
                    .subscribe(topic.as_str(), MessageHandler::determine_qos_level())
                    .await
                {
                    Ok(()) => debug!(topic = %topic, "Re-subscribed"),
                    Err(e) => error!(topic = %topic, error = %e, "Failed to re-subscribe"),
                }
            }
        });
    }

    /// Match a SubAck to the oldest outstanding request
    async fn subscription_acknowledged(&self) -> Option<String> {
        self.awaiting_suback.lock().await.pop_front()
    }

    /// Stop tracking a topic the broker refused, so reconnects don't re-issue it
    async fn subscription_refused(&self, reason: &str) {
        let topic = self.subscription_acknowledged().await;
        warn!(topic = ?topic, reason, "Broker refused subscription");
        if let Some(topic) = topic {
            self.subscribed_topics.lock().await.retain(|t| *t != topic);
        }
    }
}

/// Create a fresh client and wait for its ConnAck
async fn open_connection(
    options: MqttOptions,
    timeout: Duration,
) -> Result<(AsyncClient, EventLoop), String> {
    let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
    let acknowledged = tokio::time::timeout(timeout, async {
        loop {
            let event = event_loop.poll().await.map_err(|e| e.to_string())?;
            if matches!(
                MessageHandler::route_mqtt_event(&event),
                EventRoute::ConnectionAcknowledged
            ) {
                return Ok::<(), String>(());
            }
        }
    })
    .await;

    match acknowledged {
        Ok(Ok(())) => Ok((client, event_loop)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err("ConnAck timeout".to_string()),
    }
}

async fn run_supervisor(mut context: SupervisorContext, mut event_loop: EventLoop) {
    info!("Starting MQTT event loop supervisor");
    let mut established = false;

    loop {
        let event = tokio::select! {
            changed = context.shutdown_rx.changed() => {
                if changed.is_err() || *context.shutdown_rx.borrow() {
                    info!("Shutdown signal received, stopping supervisor");
                    break;
                }
                continue;
            }
            event = event_loop.poll() => event,
        };

        let lost_reason = match event {
            Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => {
                    established = true;
                    transition(
                        &context.state_tx,
                        HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
                    );
                    context.on_connected().await;
                    None
                }
                EventRoute::MessageReceived(message) => {
                    metrics().mqtt_message_received();
                    if let Err(e) = context.forwarder.forward(message).await {
                        debug!(error = %e, "Inbound message not forwarded");
                    }
                    None
                }
                EventRoute::Disconnected => Some(ConnectionEvent::DisconnectedByBroker),
                EventRoute::SubscriptionConfirmed {
                    packet_id,
                    count,
                    refused,
                } => {
                    if refused.is_empty() {
                        let topic = context.subscription_acknowledged().await;
                        debug!(packet_id, count, topic = ?topic, "Subscription confirmed");
                    } else {
                        context.subscription_refused(&refused.join(", ")).await;
                    }
                    None
                }
                EventRoute::InfrastructureEvent(description) => {
                    debug!(event = %description, "MQTT event");
                    None
                }
                EventRoute::OutgoingEvent => None,
            },
            // rumqttc reports refused SubAck codes as a state error and drops the connection
            Err(ConnectionError::MqttState(StateError::SubFail { reason })) => {
                context.subscription_refused(&format!("{reason:?}")).await;
                Some(ConnectionEvent::NetworkError(format!(
                    "Subscription refused: {reason:?}"
                )))
            }
            Err(e) => Some(ConnectionEvent::NetworkError(e.to_string())),
        };

        let Some(lost) = lost_reason else {
            continue;
        };
        context.awaiting_suback.lock().await.clear();

        if context.is_closing() {
            debug!("Connection closed during shutdown");
            break;
        }

        transition(&context.state_tx, HealthMonitor::determine_next_state(lost));
        metrics().mqtt_connection_lost();

        if !established {
            // The caller of `connect` reports this failure
            break;
        }

        let options = context.options.clone();
        let timeout = context.connect_timeout;
        let reconnected = reconnect_with_backoff(
            &context.reconnect_config,
            &context.state_tx,
            &mut context.shutdown_rx,
            |_attempt| open_connection(options.clone(), timeout),
        )
        .await;

        match reconnected {
            Some(_) if context.is_closing() => {
                debug!("Client closed while reconnecting");
                break;
            }
            Some((client, new_event_loop)) => {
                *context.client.lock().await = Some(client);
                event_loop = new_event_loop;
                context.on_connected().await;
            }
            None => break,
        }
    }

    info!("MQTT event loop supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_section() -> MqttSection {
        MqttSection {
            broker: "localhost".to_string(),
            port: 1883,
            base_topic: "casambi".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_generated_client_id() {
        let id = generate_client_id();
        assert!(id.starts_with("casambi-mqtt-"));
        assert_eq!(id.len(), "casambi-mqtt-".len() + 8);
    }

    #[test]
    fn test_configured_client_id_is_kept() {
        let mut section = test_section();
        section.client_id = Some("bridge-1".to_string());
        let client = MqttClient::new(&section, ReconnectConfig::default());
        assert_eq!(client.client_id(), "bridge-1");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connection_confirmation_timeout() {
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_secs(10)).await;

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("ConnAck"), "got: {err_msg}");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_disconnected() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("Test disconnect".to_string()));
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.unwrap_err().to_string().contains("Test disconnect"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruptible_sleep_completes() {
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        assert!(interruptible_sleep(&mut shutdown_rx, Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruptible_sleep_interrupted() {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = shutdown_tx.send(true);
        });

        assert!(!interruptible_sleep(&mut shutdown_rx, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_operations_fail_without_connection() {
        let client = MqttClient::new(&test_section(), ReconnectConfig::default());

        assert!(!client.is_connected());
        assert!(matches!(
            client.publish("casambi/health/STATE", b"OK".to_vec(), false).await,
            Err(MqttError::NotConnected { .. })
        ));
        assert!(matches!(
            client.subscribe("casambi/Home/Lamp1/cmnd").await,
            Err(MqttError::NotConnected { .. })
        ));
        // Tracked for the next ConnAck
        assert_eq!(
            client.subscribed_topics().await,
            vec!["casambi/Home/Lamp1/cmnd".to_string()]
        );
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let client = MqttClient::new(&test_section(), ReconnectConfig::default());
        assert!(client.disconnect().await.is_ok());
        assert!(client.disconnect().await.is_ok());
        assert!(!client.is_permanently_disconnected());
    }
}
