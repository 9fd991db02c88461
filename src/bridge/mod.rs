//! The bridge between the two links
//!
//! - [`router`] - broker command messages to mesh commands
//! - [`publisher`] - mesh state changes to retained broker messages
//! - [`subscriptions`] - command-topic subscriptions per unit
//! - [`liveness`] - the periodic liveness message
//! - [`lifecycle`] - startup, steady state and ordered shutdown

pub mod lifecycle;
pub mod liveness;
pub mod publisher;
pub mod router;
pub mod subscriptions;

pub use lifecycle::{BridgeLifecycle, BridgeState, LifecycleError, TerminationReason};
pub use liveness::{publish_liveness, spawn_liveness_task};
pub use publisher::StatePublisher;
pub use router::{CommandRouter, RouteOutcome};
pub use subscriptions::SubscriptionTracker;
