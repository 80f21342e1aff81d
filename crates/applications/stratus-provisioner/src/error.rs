//! Error types for the provisioner

use crate::agent::AgentState;
use std::time::Duration;
use stratus_core::ProviderError;
use thiserror::Error;

/// Provisioner result type
pub type Result<T> = std::result::Result<T, ProvisionerError>;

/// Errors that can occur in the provisioner
#[derive(Error, Debug)]
pub enum ProvisionerError {
    /// Invalid template or pool configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation invoked on an object that is not ready for it
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Lifecycle edge that the state machine does not allow
    #[error("Illegal transition for {node}: {from:?} -> {to:?}")]
    IllegalTransition {
        node: String,
        from: AgentState,
        to: AgentState,
    },

    /// Cloud provider error
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Deadline exceeded
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// No agent registered under this node name
    #[error("Agent {0} not found")]
    AgentNotFound(String),

    /// Agent exists but cannot take the requested action in its state
    #[error("Agent {node} is {state:?}")]
    AgentUnavailable { node: String, state: AgentState },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProvisionerError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }
}
