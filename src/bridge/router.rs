//! Command Router: inbound command messages to mesh commands

use crate::mesh::{MeshClient, MeshLink};
use crate::observability::metrics::metrics;
use crate::protocol::{decode_command, CommandTopicMatcher};
use crate::transport::InboundMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// What became of one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Not a command topic of the connected network
    Ignored,
    /// The topic names a unit that is not in the registry
    UnknownUnit(String),
    /// The payload could not be decoded; the message is dropped
    Malformed(String),
    /// Valid payload without any recognised property
    NoCommands,
    /// Each recognised property was sent to the mesh or rejected
    Dispatched { applied: usize, failed: usize },
}

pub struct CommandRouter<C: MeshClient> {
    mesh: Arc<MeshLink<C>>,
    matcher: CommandTopicMatcher,
}

impl<C: MeshClient> CommandRouter<C> {
    pub fn new(mesh: Arc<MeshLink<C>>, base_topic: &str, network_name: &str) -> Self {
        Self {
            mesh,
            matcher: CommandTopicMatcher::new(base_topic, network_name),
        }
    }

    /// Route one message
    ///
    /// Properties are applied in precedence order (dimmer, temperature, vertical); a
    /// rejected property does not stop the ones after it.
    pub async fn handle(&self, message: &InboundMessage) -> RouteOutcome {
        let Some(unit_name) = self.matcher.unit_name(&message.topic) else {
            trace!(topic = %message.topic, "Ignoring message outside this network's command topics");
            return RouteOutcome::Ignored;
        };

        metrics().command_received();
        debug!(
            topic = %message.topic,
            retained = message.retain,
            payload = %String::from_utf8_lossy(&message.payload),
            "Received command"
        );

        let Some(unit) = self.mesh.unit(unit_name) else {
            warn!(unit = unit_name, "Command for unknown unit dropped");
            metrics().command_dropped();
            return RouteOutcome::UnknownUnit(unit_name.to_string());
        };

        let changes = match decode_command(&message.payload) {
            Ok(changes) => changes,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Dropping malformed command payload");
                metrics().command_dropped();
                return RouteOutcome::Malformed(e.to_string());
            }
        };

        if changes.is_empty() {
            debug!(topic = %message.topic, "Command carries no recognised property");
            return RouteOutcome::NoCommands;
        }

        let mut applied = 0;
        let mut failed = 0;
        for change in changes {
            info!(
                topic = %message.topic,
                unit = %unit.name,
                property = change.name(),
                value = change.value(),
                "Applying command"
            );

            match self.mesh.apply(&unit, change).await {
                Ok(()) => {
                    applied += 1;
                    metrics().command_applied();
                }
                Err(e) => {
                    failed += 1;
                    metrics().command_dropped();
                    if e.is_fatal() {
                        error!(unit = %unit.name, property = change.name(), error = %e, "Command failed");
                    } else {
                        warn!(unit = %unit.name, property = change.name(), error = %e, "Command dropped");
                    }
                }
            }
        }

        RouteOutcome::Dispatched { applied, failed }
    }

    /// Handle messages in arrival order until the channel closes
    pub async fn run(self, mut messages: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = messages.recv().await {
            self.handle(&message).await;
        }
        debug!("Command router stopped");
    }
}
