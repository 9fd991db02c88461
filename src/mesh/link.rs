//! Mesh link: owns the mesh session, the unit registry and the change pump

use super::unit::{Network, Session, Unit};
use super::{MeshClient, MeshError};
use crate::observability::metrics::metrics;
use crate::protocol::PropertyChange;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Temperatures at or below this value are mired, above it Kelvin
pub const MIRED_CEILING: f64 = 1000.0;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshLinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

/// Result of a successful [`MeshLink::connect`]
#[derive(Debug)]
pub struct ConnectedSession {
    /// Registry snapshot right after connecting
    pub session: Arc<Session>,
    /// Units whose state changed, already applied to the registry
    pub changes: mpsc::Receiver<Arc<Unit>>,
}

pub struct MeshLink<C: MeshClient> {
    client: Arc<C>,
    state_tx: Arc<watch::Sender<MeshLinkState>>,
    session_tx: Arc<watch::Sender<Option<Arc<Session>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<C: MeshClient> MeshLink<C> {
    pub fn new(client: Arc<C>) -> Self {
        let (state_tx, _) = watch::channel(MeshLinkState::Disconnected);
        let (session_tx, _) = watch::channel(None);
        Self {
            client,
            state_tx: Arc::new(state_tx),
            session_tx: Arc::new(session_tx),
            pump: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn state(&self) -> MeshLinkState {
        self.state_tx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<MeshLinkState> {
        self.state_tx.subscribe()
    }

    /// Current registry snapshot, `None` before connecting
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session_tx.borrow().clone()
    }

    pub fn unit(&self, name: &str) -> Option<Arc<Unit>> {
        self.session().and_then(|session| session.unit(name))
    }

    pub async fn discover(&self, timeout: Duration) -> Result<Vec<Network>, MeshError> {
        debug!(timeout_secs = timeout.as_secs(), "Scanning for mesh networks");
        let networks = self.client.discover(timeout).await?;
        info!(count = networks.len(), "Mesh discovery finished");
        Ok(networks)
    }

    /// Open a session with `network`, load its units and start forwarding changes
    pub async fn connect(
        &self,
        network: &Network,
        password: &str,
    ) -> Result<ConnectedSession, MeshError> {
        self.state_tx.send_replace(MeshLinkState::Connecting);

        match self.open_session(network, password).await {
            Ok((session, events)) => {
                let (changes_tx, changes_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
                self.session_tx.send_replace(Some(session.clone()));
                self.state_tx.send_replace(MeshLinkState::Connected);

                let span = crate::mesh_span!(network = %session.network_name());
                let handle = tokio::spawn(
                    run_event_pump(
                        events,
                        changes_tx,
                        self.session_tx.clone(),
                        self.state_tx.clone(),
                    )
                    .instrument(span),
                );
                if let Some(previous) = self.pump.lock().await.replace(handle) {
                    previous.abort();
                }

                info!(
                    network = %session.network_name(),
                    units = session.unit_count(),
                    "Mesh session established"
                );
                Ok(ConnectedSession {
                    session,
                    changes: changes_rx,
                })
            }
            Err(e) => {
                self.state_tx
                    .send_replace(MeshLinkState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        network: &Network,
        password: &str,
    ) -> Result<(Arc<Session>, broadcast::Receiver<Unit>), MeshError> {
        let network_name = self.client.connect(network, password).await?;
        // Subscribe before reading units so no change between the two is lost
        let events = self.client.subscribe_unit_changes()?;
        let units = self.client.units().await?;
        Ok((
            Arc::new(Session::new(network.clone(), network_name, units)),
            events,
        ))
    }

    /// Validate `change` against `unit` and send it to the mesh
    ///
    /// The registry is not touched; the confirmed state arrives through the change stream.
    /// A fatal error from the mesh client marks the link [`MeshLinkState::Failed`].
    pub async fn apply(&self, unit: &Unit, change: PropertyChange) -> Result<(), MeshError> {
        if self.state() != MeshLinkState::Connected {
            return Err(MeshError::NotConnected);
        }
        if !unit.online {
            return Err(MeshError::UnitUnreachable(unit.name.clone()));
        }

        let result = self.send_command(unit, change).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e);
            }
        }
        result
    }

    async fn send_command(&self, unit: &Unit, change: PropertyChange) -> Result<(), MeshError> {
        let capabilities = &unit.capabilities;
        match change {
            PropertyChange::Dimmer(value) => {
                if !capabilities.dimmer {
                    return Err(rejected(unit, "unit has no dimmer"));
                }
                let level = device_level(unit, value)?;
                self.client.set_level(unit, level).await
            }
            PropertyChange::Temperature(value) => {
                let Some(range) = &capabilities.temperature else {
                    return Err(rejected(unit, "unit has no colour temperature control"));
                };
                let kelvin = to_kelvin(value).ok_or_else(|| {
                    rejected(unit, &format!("invalid colour temperature {value}"))
                })?;
                if !range.contains(&kelvin) {
                    return Err(rejected(
                        unit,
                        &format!(
                            "{kelvin}K outside supported range {}-{}K",
                            range.start(),
                            range.end()
                        ),
                    ));
                }
                self.client.set_temperature(unit, kelvin).await
            }
            PropertyChange::Vertical(value) => {
                if !capabilities.vertical {
                    return Err(rejected(unit, "unit has no vertical control"));
                }
                let level = device_level(unit, value)?;
                self.client.set_vertical(unit, level).await
            }
        }
    }

    fn fail(&self, error: &MeshError) {
        let failed = self.state_tx.send_if_modified(|state| {
            if *state == MeshLinkState::Connected {
                *state = MeshLinkState::Failed(error.to_string());
                true
            } else {
                false
            }
        });
        if failed {
            warn!(error = %error, "Mesh link failed while sending a command");
        }
    }

    pub async fn set_level(&self, unit: &Unit, level: u8) -> Result<(), MeshError> {
        self.apply(unit, PropertyChange::Dimmer(f64::from(level)))
            .await
    }

    pub async fn set_temperature(&self, unit: &Unit, value: u32) -> Result<(), MeshError> {
        self.apply(unit, PropertyChange::Temperature(f64::from(value)))
            .await
    }

    pub async fn set_vertical(&self, unit: &Unit, value: u8) -> Result<(), MeshError> {
        self.apply(unit, PropertyChange::Vertical(f64::from(value)))
            .await
    }

    /// Stop the change pump and close the session. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<(), MeshError> {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }

        let was_open = !matches!(self.state(), MeshLinkState::Disconnected);
        self.state_tx.send_replace(MeshLinkState::Disconnected);
        if !was_open {
            debug!("Mesh link already disconnected");
            return Ok(());
        }

        info!("Disconnecting mesh session");
        self.client.disconnect().await
    }
}

impl<C: MeshClient> Drop for MeshLink<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.get_mut().take() {
            handle.abort();
        }
    }
}

fn rejected(unit: &Unit, reason: &str) -> MeshError {
    MeshError::CommandRejected {
        unit: unit.name.clone(),
        reason: reason.to_string(),
    }
}

fn device_level(unit: &Unit, value: f64) -> Result<u8, MeshError> {
    if !value.is_finite() || !(0.0..=255.0).contains(&value) {
        return Err(rejected(unit, &format!("level {value} outside 0-255")));
    }
    Ok(value.round() as u8)
}

/// Kelvin for a command value, converting mired when `value` is at most [`MIRED_CEILING`]
pub fn to_kelvin(value: f64) -> Option<u32> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let kelvin = if value <= MIRED_CEILING {
        1_000_000.0 / value
    } else {
        value
    };
    if kelvin > f64::from(u32::MAX) {
        return None;
    }
    Some(kelvin.round() as u32)
}

/// Keep only the latest update per unit, ordered by each unit's first appearance
pub fn coalesce(batch: Vec<Unit>) -> Vec<Unit> {
    let mut latest: Vec<Unit> = Vec::with_capacity(batch.len());
    for unit in batch {
        match latest.iter_mut().find(|seen| seen.name == unit.name) {
            Some(seen) => *seen = unit,
            None => latest.push(unit),
        }
    }
    latest
}

async fn run_event_pump(
    mut events: broadcast::Receiver<Unit>,
    changes: mpsc::Sender<Arc<Unit>>,
    session_tx: Arc<watch::Sender<Option<Arc<Session>>>>,
    state_tx: Arc<watch::Sender<MeshLinkState>>,
) {
    let mut closed = false;
    while !closed {
        let mut batch = match events.recv().await {
            Ok(unit) => vec![unit],
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Mesh change stream lagged, updates dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        loop {
            match events.try_recv() {
                Ok(unit) => batch.push(unit),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Mesh change stream lagged, updates dropped");
                }
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => {
                    closed = true;
                    break;
                }
            }
        }

        for unit in coalesce(batch) {
            let unit = Arc::new(unit);
            session_tx.send_modify(|session| {
                if let Some(current) = session {
                    *session = Some(Arc::new(current.with_unit(unit.clone())));
                }
            });
            metrics().unit_changed();

            if changes.send(unit).await.is_err() {
                debug!("No consumer for unit changes");
            }
        }
    }

    let failed = state_tx.send_if_modified(|state| {
        if *state == MeshLinkState::Connected {
            *state = MeshLinkState::Failed("mesh session closed".to_string());
            true
        } else {
            false
        }
    });
    if failed {
        warn!("Mesh change stream closed while connected");
    }
}
