//! In-memory mesh client
//!
//! Networks and units are declared up front (from the configuration file or in
//! tests). Commands are recorded and, by default, echoed back as confirmed state
//! changes the way a real network reports them.

use super::unit::{ColorSource, Network, Unit, UnitCapabilities, UnitState};
use super::{MeshClient, MeshError};
use crate::config::{MeshBackend, VirtualNetworkConfig, VirtualUnitConfig};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 64;

/// A command as received by the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshCommand {
    SetLevel { unit: String, level: u8 },
    SetTemperature { unit: String, kelvin: u32 },
    SetVertical { unit: String, value: u8 },
}

/// Declaration of one simulated network
#[derive(Debug, Clone)]
pub struct VirtualNetwork {
    address: String,
    name: String,
    password: Option<String>,
    units: Vec<Unit>,
    available: bool,
}

impl VirtualNetwork {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            password: None,
            units: Vec::new(),
            available: true,
        }
    }

    /// Require `password` when connecting; without it any password is accepted
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.units.push(unit);
        self
    }

    /// Discoverable, but the gateway stops answering before a session is opened
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

impl From<&VirtualNetworkConfig> for VirtualNetwork {
    fn from(config: &VirtualNetworkConfig) -> Self {
        config
            .units
            .iter()
            .map(Unit::from)
            .fold(Self::new(&config.address, &config.name), |network, unit| {
                network.with_unit(unit)
            })
    }
}

impl From<&VirtualUnitConfig> for Unit {
    fn from(config: &VirtualUnitConfig) -> Self {
        let temperature = match (config.temperature_min, config.temperature_max) {
            (Some(min), Some(max)) if min <= max => Some(min..=max),
            _ => None,
        };
        let state = UnitState {
            colorsource: temperature.as_ref().map(|_| ColorSource::Tw),
            dimmer: config.dimmer.then_some(0),
            temperature: temperature.as_ref().map(|range| *range.start()),
            vertical: config.vertical.then_some(0),
            ..Default::default()
        };
        Unit::new(config.id, &config.name)
            .with_capabilities(UnitCapabilities {
                dimmer: config.dimmer,
                vertical: config.vertical,
                temperature,
            })
            .with_state(state)
    }
}

#[derive(Debug, Default)]
struct Inner {
    networks: Vec<VirtualNetwork>,
    connected: Option<usize>,
    units: BTreeMap<String, Unit>,
    events: Option<broadcast::Sender<Unit>>,
    commands: Vec<MeshCommand>,
    disconnects: usize,
    silent: bool,
    command_failure: Option<MeshError>,
}

impl Inner {
    fn publish(&self, unit: &Unit) {
        if let Some(events) = &self.events {
            // No receiver just means nobody is listening yet
            let _ = events.send(unit.clone());
        }
    }

    /// Look up a unit for a command and record it
    fn command(
        &mut self,
        name: &str,
        command: MeshCommand,
        update: impl FnOnce(&mut Unit),
    ) -> Result<(), MeshError> {
        if self.connected.is_none() {
            return Err(MeshError::NotConnected);
        }
        if let Some(failure) = &self.command_failure {
            return Err(failure.clone());
        }
        let unit = self
            .units
            .get_mut(name)
            .ok_or_else(|| MeshError::UnknownUnit(name.to_string()))?;
        if !unit.online {
            return Err(MeshError::UnitUnreachable(name.to_string()));
        }

        debug!(unit = name, ?command, "Virtual mesh command");
        update(unit);
        let confirmed = unit.clone();
        self.commands.push(command);
        if !self.silent {
            self.publish(&confirmed);
        }
        Ok(())
    }
}

/// [`MeshClient`] backed by in-memory networks
#[derive(Debug, Default)]
pub struct VirtualMesh {
    inner: Mutex<Inner>,
}

impl VirtualMesh {
    pub fn new(networks: Vec<VirtualNetwork>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                networks,
                ..Default::default()
            }),
        }
    }

    pub fn from_backend(backend: &MeshBackend) -> Self {
        match backend {
            MeshBackend::Virtual { networks } => {
                Self::new(networks.iter().map(VirtualNetwork::from).collect())
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop echoing commands back as state changes
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Fail every following command with `failure`, or stop failing with `None`
    pub fn fail_commands(&self, failure: Option<MeshError>) {
        self.lock().command_failure = failure;
    }

    /// Commands received so far, oldest first
    pub fn commands(&self) -> Vec<MeshCommand> {
        self.lock().commands.clone()
    }

    /// Number of sessions closed through [`MeshClient::disconnect`]
    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected.is_some()
    }

    /// Report a state change that originated on the mesh, adding the unit if new
    pub fn inject_change(&self, unit: Unit) {
        let mut inner = self.lock();
        inner.units.insert(unit.name.clone(), unit.clone());
        inner.publish(&unit);
    }

    /// Mark a unit online or offline and report the change
    pub fn set_online(&self, name: &str, online: bool) -> Result<(), MeshError> {
        let mut inner = self.lock();
        let unit = inner
            .units
            .get_mut(name)
            .ok_or_else(|| MeshError::UnknownUnit(name.to_string()))?;
        unit.online = online;
        let changed = unit.clone();
        inner.publish(&changed);
        Ok(())
    }

    /// Simulate the radio session dying: the change stream closes
    pub fn drop_session(&self) {
        let mut inner = self.lock();
        inner.events = None;
        inner.connected = None;
    }
}

#[async_trait]
impl MeshClient for VirtualMesh {
    async fn discover(&self, _timeout: Duration) -> Result<Vec<Network>, MeshError> {
        Ok(self
            .lock()
            .networks
            .iter()
            .map(|network| Network::new(&network.address))
            .collect())
    }

    async fn connect(&self, network: &Network, password: &str) -> Result<String, MeshError> {
        let mut inner = self.lock();
        let index = inner
            .networks
            .iter()
            .position(|candidate| candidate.address == network.address)
            .ok_or_else(|| MeshError::NetworkUnavailable(network.address.clone()))?;

        let declared = inner.networks[index].clone();
        if !declared.available {
            return Err(MeshError::NetworkUnavailable(declared.address));
        }
        if declared
            .password
            .as_deref()
            .is_some_and(|expected| expected != password)
        {
            return Err(MeshError::Authentication(format!(
                "wrong password for network {}",
                declared.name
            )));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        inner.connected = Some(index);
        inner.events = Some(events);
        inner.units = declared
            .units
            .into_iter()
            .map(|unit| (unit.name.clone(), unit))
            .collect();
        Ok(declared.name)
    }

    async fn units(&self) -> Result<Vec<Unit>, MeshError> {
        let inner = self.lock();
        if inner.connected.is_none() {
            return Err(MeshError::NotConnected);
        }
        Ok(inner.units.values().cloned().collect())
    }

    fn subscribe_unit_changes(&self) -> Result<broadcast::Receiver<Unit>, MeshError> {
        self.lock()
            .events
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(MeshError::NotConnected)
    }

    async fn set_level(&self, unit: &Unit, level: u8) -> Result<(), MeshError> {
        let command = MeshCommand::SetLevel {
            unit: unit.name.clone(),
            level,
        };
        self.lock().command(&unit.name, command, |unit| {
            unit.state.dimmer = Some(level);
            unit.on = level > 0;
        })
    }

    async fn set_temperature(&self, unit: &Unit, kelvin: u32) -> Result<(), MeshError> {
        let command = MeshCommand::SetTemperature {
            unit: unit.name.clone(),
            kelvin,
        };
        self.lock().command(&unit.name, command, |unit| {
            unit.state.temperature = Some(kelvin);
            unit.state.colorsource = Some(ColorSource::Tw);
        })
    }

    async fn set_vertical(&self, unit: &Unit, value: u8) -> Result<(), MeshError> {
        let command = MeshCommand::SetVertical {
            unit: unit.name.clone(),
            value,
        };
        self.lock().command(&unit.name, command, |unit| {
            unit.state.vertical = Some(value);
        })
    }

    async fn disconnect(&self) -> Result<(), MeshError> {
        let mut inner = self.lock();
        if inner.connected.take().is_some() {
            inner.events = None;
            inner.disconnects += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> VirtualNetwork {
        VirtualNetwork::new("aa:bb", "Home")
            .with_password("secret")
            .with_unit(Unit::new(1, "Lamp1"))
    }

    #[tokio::test]
    async fn test_connect_checks_password() {
        let mesh = VirtualMesh::new(vec![home()]);
        let network = Network::new("aa:bb");

        assert!(matches!(
            mesh.connect(&network, "wrong").await,
            Err(MeshError::Authentication(_))
        ));
        assert_eq!(mesh.connect(&network, "secret").await.unwrap(), "Home");
        assert!(mesh.is_connected());
    }

    #[tokio::test]
    async fn test_unavailable_network() {
        let mesh = VirtualMesh::new(vec![home().unavailable()]);
        assert_eq!(mesh.discover(Duration::from_secs(1)).await.unwrap().len(), 1);
        assert!(matches!(
            mesh.connect(&Network::new("aa:bb"), "secret").await,
            Err(MeshError::NetworkUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_command_echoes_state() {
        let mesh = VirtualMesh::new(vec![home()]);
        mesh.connect(&Network::new("aa:bb"), "secret").await.unwrap();
        let mut events = mesh.subscribe_unit_changes().unwrap();

        let lamp = Unit::new(1, "Lamp1");
        mesh.set_level(&lamp, 128).await.unwrap();

        let echoed = events.recv().await.unwrap();
        assert_eq!(echoed.state.dimmer, Some(128));
        assert!(echoed.on);
        assert_eq!(
            mesh.commands(),
            vec![MeshCommand::SetLevel {
                unit: "Lamp1".into(),
                level: 128
            }]
        );
    }

    #[tokio::test]
    async fn test_command_failure_toggle() {
        let mesh = VirtualMesh::new(vec![home()]);
        mesh.connect(&Network::new("aa:bb"), "secret").await.unwrap();
        let lamp = Unit::new(1, "Lamp1");

        mesh.fail_commands(Some(MeshError::NetworkUnavailable("gateway gone".into())));
        assert!(matches!(
            mesh.set_level(&lamp, 10).await,
            Err(MeshError::NetworkUnavailable(_))
        ));
        assert!(mesh.commands().is_empty());

        mesh.fail_commands(None);
        mesh.set_level(&lamp, 10).await.unwrap();
        assert_eq!(mesh.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_unit_unreachable() {
        let mesh = VirtualMesh::new(vec![home()]);
        mesh.connect(&Network::new("aa:bb"), "secret").await.unwrap();
        mesh.set_online("Lamp1", false).unwrap();

        assert!(matches!(
            mesh.set_level(&Unit::new(1, "Lamp1"), 10).await,
            Err(MeshError::UnitUnreachable(_))
        ));
        assert!(mesh.commands().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mesh = VirtualMesh::new(vec![home()]);
        mesh.connect(&Network::new("aa:bb"), "secret").await.unwrap();

        mesh.disconnect().await.unwrap();
        mesh.disconnect().await.unwrap();

        assert_eq!(mesh.disconnect_count(), 1);
        assert!(matches!(
            mesh.units().await,
            Err(MeshError::NotConnected)
        ));
    }

    #[test]
    fn test_unit_from_config() {
        let config = VirtualUnitConfig {
            id: 3,
            name: "Spot".into(),
            dimmer: true,
            vertical: false,
            temperature_min: Some(2200),
            temperature_max: Some(6500),
        };
        let unit = Unit::from(&config);

        assert_eq!(unit.capabilities.temperature, Some(2200..=6500));
        assert_eq!(unit.state.temperature, Some(2200));
        assert_eq!(unit.state.colorsource, Some(ColorSource::Tw));
        assert_eq!(unit.state.dimmer, Some(0));
        assert_eq!(unit.state.vertical, None);
    }
}
