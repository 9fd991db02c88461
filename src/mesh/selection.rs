//! Choosing which discovered network to join

use super::unit::Network;
use super::MeshError;
use dialoguer::Select;
use tracing::info;

/// Strategy for picking one of several discovered networks
///
/// Implementations may block (terminal prompts), so callers on the runtime should
/// run them through `spawn_blocking`.
pub trait NetworkSelector: Send + Sync {
    /// Index into `networks`; only called with two or more networks
    fn select(&self, networks: &[Network]) -> Result<usize, MeshError>;
}

/// Always pick the configured index
#[derive(Debug, Clone, Copy)]
pub struct FixedIndexSelector(pub usize);

impl NetworkSelector for FixedIndexSelector {
    fn select(&self, _networks: &[Network]) -> Result<usize, MeshError> {
        Ok(self.0)
    }
}

/// Pick the first network in discovery order
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstNetworkSelector;

impl NetworkSelector for FirstNetworkSelector {
    fn select(&self, _networks: &[Network]) -> Result<usize, MeshError> {
        Ok(0)
    }
}

/// Ask on the terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct InteractiveSelector;

impl NetworkSelector for InteractiveSelector {
    fn select(&self, networks: &[Network]) -> Result<usize, MeshError> {
        Select::new()
            .with_prompt("Select the network to bridge")
            .items(networks)
            .default(0)
            .interact()
            .map_err(|e| MeshError::InvalidSelection(e.to_string()))
    }
}

/// Resolve the network to join
///
/// No networks is an error, a single network is used without consulting `selector`,
/// and the selector's answer is bounds-checked.
pub fn choose_network(
    networks: &[Network],
    selector: &dyn NetworkSelector,
) -> Result<Network, MeshError> {
    match networks {
        [] => Err(MeshError::NoNetworks),
        [only] => {
            info!(network = %only, "Single network found, selecting it");
            Ok(only.clone())
        }
        _ => {
            let index = selector.select(networks)?;
            let network = networks.get(index).ok_or_else(|| {
                MeshError::InvalidSelection(format!(
                    "index {index} out of range, {} networks found",
                    networks.len()
                ))
            })?;
            info!(network = %network, index, "Network selected");
            Ok(network.clone())
        }
    }
}
