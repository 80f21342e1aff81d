//! Core traits for Stratus
//!
//! The provisioner works through these interfaces ONLY - never concrete
//! provider or connector types.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::{ConnectError, ProviderError};
use crate::types::*;

/// Result type for provider operations
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Cloud server API façade.
///
/// Implementations must be safe to call concurrently for different servers;
/// the provisioner never issues two calls for the same server at once.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider identity (for logs)
    fn name(&self) -> &str;

    /// Request a new server. Returns the assigned id and initial status.
    async fn create_server(&self, spec: &ServerSpec) -> ProviderResult<ServerInfo>;

    /// Describe one server.
    async fn get_server(&self, id: &ServerId) -> ProviderResult<ServerInfo>;

    /// Delete a server. Deleting a missing server is not an error.
    async fn delete_server(&self, id: &ServerId) -> ProviderResult<()>;

    /// List the servers visible to this client.
    async fn list_servers(&self) -> ProviderResult<Vec<ServerInfo>>;

    /// Check that a placement attribute exists in the provider catalogue.
    ///
    /// `None` means the provider cannot tell.
    async fn verify_resource(&self, _kind: ResourceKind, _name: &str) -> ProviderResult<Option<bool>> {
        Ok(None)
    }
}

/// An established remote shell session on a worker
pub trait Channel: Send + Sync + Debug {
    /// Address the channel is connected to
    fn peer(&self) -> &str;

    /// Remote identification (e.g. the SSH banner)
    fn remote_id(&self) -> &str;
}

/// Bootstraps a remote shell once a server is network-reachable
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> std::result::Result<Box<dyn Channel>, ConnectError>;
}
