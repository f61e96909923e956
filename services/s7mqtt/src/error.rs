//! Gateway error types
//!
//! One enum covers the PLC link, the messaging side, configuration and the
//! device engine, so every public operation returns [`Result`].

use thiserror::Error;

/// Errors produced by the gateway
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Session establishment failed, or connect was called on a live session
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Operation submitted while the PLC session is down
    #[error("Not connected")]
    NotConnected,

    /// Operation queue at capacity; the queue was left unchanged
    #[error("Operation queue is full (max size: {0})")]
    QueueFull(usize),

    /// The driver reported a non-busy failure, or a value had the wrong type
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Pending operation abandoned because the session closed
    #[error("S7 service disconnected")]
    Disconnected,

    /// Command addressed a device that was never initialized
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Polling already started")]
    AlreadyStarted,

    #[error("Polling not started")]
    NotStarted,

    /// Payload or command not applicable to the target device
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Messaging error: {0}")]
    MessagingError(String),

    /// Lifecycle operation called in the wrong controller state
    #[error("State error: {0}")]
    StateError(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    pub fn invalid_command(msg: impl Into<String>) -> Self {
        Self::InvalidCommand(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn messaging(msg: impl Into<String>) -> Self {
        Self::MessagingError(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::StateError(msg.into())
    }
}

impl From<figment::Error> for GatewayError {
    fn from(err: figment::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::MessagingError(format!("JSON encoding failed: {}", err))
    }
}

impl From<rumqttc::ClientError> for GatewayError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::MessagingError(err.to_string())
    }
}
