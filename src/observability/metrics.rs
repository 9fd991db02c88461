//! Thread-safe metrics collection
//!
//! Atomic counters for broker traffic, command handling and mesh activity.
//! A snapshot is logged when the bridge shuts down.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Broker
    broker_connected: AtomicBool,
    connections_established: AtomicU64,
    reconnect_attempts: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,

    // Commands
    commands_received: AtomicU64,
    commands_applied: AtomicU64,
    commands_dropped: AtomicU64,

    // Mesh
    unit_changes: AtomicU64,

    // Lifecycle
    bridge_state: Mutex<String>,
    state_transitions: AtomicU64,
    started_at: Mutex<DateTime<Utc>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            broker_connected: AtomicBool::new(false),
            connections_established: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            commands_applied: AtomicU64::new(0),
            commands_dropped: AtomicU64::new(0),
            unit_changes: AtomicU64::new(0),
            bridge_state: Mutex::new("idle".to_string()),
            state_transitions: AtomicU64::new(0),
            started_at: Mutex::new(Utc::now()),
        }
    }

    // Broker metrics
    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(true, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.broker_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Command metrics
    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    /// One property change accepted by the mesh
    pub fn command_applied(&self) {
        self.commands_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// A command message or property change that was discarded
    pub fn command_dropped(&self) {
        self.commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unit_changed(&self) {
        self.unit_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_bridge_state(&self, state: &str) {
        if let Ok(mut current) = self.bridge_state.lock() {
            if *current != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current = state.to_string();
            }
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connections_established,
            &self.reconnect_attempts,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.commands_received,
            &self.commands_applied,
            &self.commands_dropped,
            &self.unit_changes,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.broker_connected.store(false, Ordering::Relaxed);
        if let Ok(mut state) = self.bridge_state.lock() {
            *state = "idle".to_string();
        }
        if let Ok(mut started_at) = self.started_at.lock() {
            *started_at = Utc::now();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        let started_at = self.started_at.lock().map(|t| *t).unwrap_or(now);
        let state = self
            .bridge_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            timestamp: now,
            started_at,
            uptime_seconds: (now - started_at).num_seconds().max(0) as u64,
            broker: BrokerMetrics {
                connected: self.broker_connected.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                received: self.commands_received.load(Ordering::Relaxed),
                applied: self.commands_applied.load(Ordering::Relaxed),
                dropped: self.commands_dropped.load(Ordering::Relaxed),
            },
            mesh: MeshMetrics {
                unit_changes: self.unit_changes.load(Ordering::Relaxed),
            },
            bridge: BridgeMetrics {
                state,
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub broker: BrokerMetrics,
    pub commands: CommandMetrics,
    pub mesh: MeshMetrics,
    pub bridge: BridgeMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerMetrics {
    pub connected: bool,
    pub connections_established: u64,
    pub reconnect_attempts: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandMetrics {
    pub received: u64,
    pub applied: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeshMetrics {
    pub unit_changes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeMetrics {
    pub state: String,
    pub state_transitions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_established();
        collector.mqtt_message_published();
        collector.mqtt_message_published();
        collector.mqtt_publish_failed();
        collector.command_received();
        collector.command_applied();
        collector.command_dropped();
        collector.unit_changed();

        let snapshot = collector.snapshot();
        assert!(snapshot.broker.connected);
        assert_eq!(snapshot.broker.connections_established, 1);
        assert_eq!(snapshot.broker.messages_published, 2);
        assert_eq!(snapshot.broker.publish_failures, 1);
        assert_eq!(snapshot.commands.received, 1);
        assert_eq!(snapshot.commands.applied, 1);
        assert_eq!(snapshot.commands.dropped, 1);
        assert_eq!(snapshot.mesh.unit_changes, 1);

        collector.mqtt_connection_lost();
        assert!(!collector.snapshot().broker.connected);
    }

    #[test]
    fn test_state_transitions_only_count_changes() {
        let collector = MetricsCollector::new();

        collector.set_bridge_state("running");
        collector.set_bridge_state("running");
        collector.set_bridge_state("stopped");

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.bridge.state, "stopped");
        assert_eq!(snapshot.bridge.state_transitions, 2);
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();
        collector.mqtt_reconnect_attempt();
        collector.set_bridge_state("running");

        collector.reset();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.broker.reconnect_attempts, 0);
        assert_eq!(snapshot.bridge.state, "idle");
        assert_eq!(snapshot.bridge.state_transitions, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert!(json["broker"]["messages_published"].is_u64());
        assert!(json["started_at"].is_string());
    }
}
