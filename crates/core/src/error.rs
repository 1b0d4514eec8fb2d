use std::fmt;

use serde::{Deserialize, Serialize};

/// Result alias that carries the custom [`FramePipeError`] type.
pub type Result<T> = std::result::Result<T, FramePipeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum FramePipeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    /// The external framework refused an operation outside of configuration,
    /// e.g. a state change.
    #[error(transparent)]
    Framework(#[from] FrameworkError),
    /// Free-form message, mostly used for poisoned synchronisation primitives.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl FramePipeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for FramePipeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for FramePipeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Raised synchronously by `configure`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid pipeline description: {0}")]
    InvalidSpecification(String),
    #[error("could not find output stage named '{0}'")]
    OutputStageMissing(String),
}

/// Raised synchronously by `start` and `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("pipeline not configured")]
    NotConfigured,
}

/// Returned to the producer thread by the callback bridge. Never crosses into
/// the application context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("no frame callback registered")]
    NoCallbackRegistered,
    #[error("frame consumer is no longer available")]
    ConsumerUnavailable,
}

/// Errors reported by a [`MediaFramework`](crate::MediaFramework)
/// implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameworkError {
    #[error("failed to initialise media framework: {0}")]
    Init(String),
    #[error("{0}")]
    Parse(String),
    #[error("no stage matches reference {0}")]
    UnknownStage(usize),
    #[error("state change failed: {0}")]
    StateChange(String),
}

/// Diagnostic captured from an error message on the pipeline bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeFault {
    pub message: String,
    #[serde(default)]
    pub debug: Option<String>,
}

impl RuntimeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            debug: None,
        }
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }
}

impl fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.debug {
            Some(debug) => write!(f, "{} ({debug})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RuntimeFault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_component_errors() {
        let err: FramePipeError = ConfigError::OutputStageMissing("sink".into()).into();
        assert!(matches!(
            err,
            FramePipeError::Config(ConfigError::OutputStageMissing(_))
        ));
        assert_eq!(format!("{err}"), "could not find output stage named 'sink'");

        let err: FramePipeError = StateError::NotConfigured.into();
        assert_eq!(format!("{err}"), "pipeline not configured");
    }

    #[test]
    fn fault_display_includes_debug_detail() {
        let fault = RuntimeFault::new("stream stopped").with_debug("reason not-linked");
        assert_eq!(fault.to_string(), "stream stopped (reason not-linked)");
        assert_eq!(RuntimeFault::new("boom").to_string(), "boom");
    }
}
