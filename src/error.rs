//! Crate-wide error type for the bridge
//!
//! Each layer owns its own error enum (`ConfigError`, `MqttError`, `MeshError`,
//! `PayloadError`, `LifecycleError`); this module folds them into [`BridgeError`] and
//! classifies which failures end the process.

use crate::bridge::lifecycle::LifecycleError;
use crate::config::ConfigError;
use crate::mesh::MeshError;
use crate::protocol::PayloadError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Publish to {topic} failed: {message}")]
    PublishFailure { topic: String, message: String },

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[source] LifecycleError),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// Startup failures keep their link's classification
impl From<LifecycleError> for BridgeError {
    fn from(error: LifecycleError) -> Self {
        match error {
            LifecycleError::Broker(source) => BridgeError::Transport(source),
            LifecycleError::Mesh(source) => BridgeError::Mesh(source),
            other => BridgeError::Lifecycle(other),
        }
    }
}

impl BridgeError {
    /// Create publish failure error
    pub fn publish_failure<T: Into<String>, M: Into<String>>(topic: T, message: M) -> Self {
        Self::PublishFailure {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Whether the error must end the process.
    ///
    /// Per-message failures (parse errors, unreachable units, rejected commands,
    /// publish failures) are contained where they happen.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Config(_) => true,
            BridgeError::Transport(_) => true,
            BridgeError::Mesh(e) => e.is_fatal(),
            BridgeError::Payload(_) => false,
            BridgeError::PublishFailure { .. } => false,
            BridgeError::Lifecycle(_) => true,
            BridgeError::Signal(_) => true,
        }
    }

    /// Error text safe to put in logs
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

/// Redact credentials and bound the length of messages before they are logged
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
