//! Mesh-side domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// A mesh network found by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Radio address of the gateway that answered the scan
    pub address: String,
    /// Human-readable name, only known once connected
    pub name: Option<String>,
}

impl Network {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", self.address, name),
            None => f.write_str(&self.address),
        }
    }
}

/// Active colour model of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSource {
    /// Tunable white
    Tw,
    Rgb,
    Xy,
}

impl fmt::Display for ColorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ColorSource::Tw => "TW",
            ColorSource::Rgb => "RGB",
            ColorSource::Xy => "XY",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

/// Controllable state of a unit; `None` means the unit does not report the value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitState {
    pub colorsource: Option<ColorSource>,
    pub dimmer: Option<u8>,
    pub rgb: Option<Rgb>,
    pub slider: Option<u8>,
    /// Kelvin
    pub temperature: Option<u32>,
    pub vertical: Option<u8>,
    pub white: Option<u8>,
    pub xy: Option<(f64, f64)>,
}

/// What a unit accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCapabilities {
    pub dimmer: bool,
    pub vertical: bool,
    /// Supported colour temperature in Kelvin, `None` when not tunable
    pub temperature: Option<RangeInclusive<u32>>,
}

impl Default for UnitCapabilities {
    fn default() -> Self {
        Self {
            dimmer: true,
            vertical: false,
            temperature: None,
        }
    }
}

/// One fixture in the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Device id inside the network
    pub id: u16,
    /// Stable name, used as a topic level
    pub name: String,
    pub on: bool,
    pub online: bool,
    pub state: UnitState,
    pub capabilities: UnitCapabilities,
}

impl Unit {
    pub fn new(id: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            on: false,
            online: true,
            state: UnitState::default(),
            capabilities: UnitCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: UnitCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_state(mut self, state: UnitState) -> Self {
        self.on = state.dimmer.map_or(self.on, |level| level > 0);
        self.state = state;
        self
    }
}

/// The connection to one network and its unit registry
///
/// A session value is never mutated after it is shared; updates produce a new
/// session through [`Session::with_unit`] so readers always see whole units.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    network: Network,
    network_name: String,
    units: BTreeMap<String, Arc<Unit>>,
}

impl Session {
    pub fn new(network: Network, network_name: impl Into<String>, units: Vec<Unit>) -> Self {
        let network_name = network_name.into();
        let network = Network {
            name: Some(network_name.clone()),
            ..network
        };
        let units = units
            .into_iter()
            .map(|unit| (unit.name.clone(), Arc::new(unit)))
            .collect();
        Self {
            network,
            network_name,
            units,
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Look up a unit by exact name
    pub fn unit(&self, name: &str) -> Option<Arc<Unit>> {
        self.units.get(name).cloned()
    }

    /// Units ordered by name
    pub fn units(&self) -> impl Iterator<Item = &Arc<Unit>> {
        self.units.values()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// New session with `unit` inserted or replaced
    pub fn with_unit(&self, unit: Arc<Unit>) -> Self {
        let mut units = self.units.clone();
        units.insert(unit.name.clone(), unit);
        Self {
            network: self.network.clone(),
            network_name: self.network_name.clone(),
            units,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_hex() {
        assert_eq!(Rgb(0, 0, 0).to_hex(), "#000000");
        assert_eq!(Rgb(255, 16, 1).to_hex(), "#ff1001");
    }

    #[test]
    fn test_network_display() {
        let mut network = Network::new("aa:bb");
        assert_eq!(network.to_string(), "aa:bb");
        network.name = Some("Home".to_string());
        assert_eq!(network.to_string(), "aa:bb (Home)");
    }

    #[test]
    fn test_with_state_derives_on_flag() {
        let unit = Unit::new(1, "Lamp1").with_state(UnitState {
            dimmer: Some(10),
            ..Default::default()
        });
        assert!(unit.on);

        let unit = unit.with_state(UnitState {
            dimmer: Some(0),
            ..Default::default()
        });
        assert!(!unit.on);
    }

    #[test]
    fn test_session_replacement_leaves_previous_untouched() {
        let session = Session::new(
            Network::new("aa:bb"),
            "Home",
            vec![Unit::new(1, "Lamp1"), Unit::new(2, "Blind")],
        );
        assert_eq!(session.network().name.as_deref(), Some("Home"));

        let mut changed = (*session.unit("Lamp1").unwrap()).clone();
        changed.state.dimmer = Some(75);
        let updated = session.with_unit(Arc::new(changed));

        assert_eq!(session.unit("Lamp1").unwrap().state.dimmer, None);
        assert_eq!(updated.unit("Lamp1").unwrap().state.dimmer, Some(75));
        assert_eq!(updated.unit_count(), 2);
    }

    #[test]
    fn test_session_units_sorted_by_name() {
        let session = Session::new(
            Network::new("aa:bb"),
            "Home",
            vec![Unit::new(2, "Zeta"), Unit::new(1, "Alpha")],
        );
        let names: Vec<_> = session.units().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Zeta"]);
    }
}
