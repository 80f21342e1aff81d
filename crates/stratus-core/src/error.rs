//! Error types shared by provider adapters and connectors

use thiserror::Error;

/// Failure reported by a cloud provider call
///
/// The variant decides what the lifecycle engine does next: transient
/// errors are retried with backoff, permanent errors fail the agent, and
/// `NotFound` means the server is gone (which `delete_server` treats as
/// success).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limit, timeout, 5xx or network failure
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Quota exceeded, invalid image, rejected input
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The server does not exist (any more)
    #[error("server not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether the call may succeed if retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Failure to bootstrap a remote shell on a reachable server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Refused, reset or timed out; the server may still be starting sshd
    #[error("connect failed (retryable): {0}")]
    Retryable(String),

    /// Wrong protocol, rejected credentials
    #[error("connect failed: {0}")]
    Fatal(String),
}

impl ConnectError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
