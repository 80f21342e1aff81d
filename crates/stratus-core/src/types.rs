//! Core types shared across Stratus components

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Provider-assigned server identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Initializing,
    Starting,
    Running,
    Stopping,
    Off,
    Deleting,
    Migrating,
    Rebuilding,
    #[serde(other)]
    Unknown,
}

impl ServerStatus {
    /// Check if the server is up (may still lack an address)
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Initializing => "initializing",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Off => "off",
            ServerStatus::Deleting => "deleting",
            ServerStatus::Migrating => "migrating",
            ServerStatus::Rebuilding => "rebuilding",
            ServerStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Provider-side view of one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: ServerId,
    pub name: String,
    pub status: ServerStatus,
    /// Reachable address, absent until the provider assigned one
    pub address: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ServerInfo {
    /// Whether the server can be handed to a connector
    pub fn is_reachable(&self) -> bool {
        self.status.is_running() && self.address.is_some()
    }
}

/// Create request for a new server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub labels: BTreeMap<String, String>,
    /// cloud-init script
    pub user_data: Option<String>,
}

impl ServerSpec {
    pub fn new(
        name: impl Into<String>,
        server_type: impl Into<String>,
        image: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            server_type: server_type.into(),
            image: image.into(),
            location: location.into(),
            labels: BTreeMap::new(),
            user_data: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_user_data(mut self, user_data: Option<String>) -> Self {
        self.user_data = user_data;
        self
    }
}

/// Login material handed to the connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
}

fn default_username() -> String {
    "root".to_string()
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: default_username(),
            private_key_path: None,
        }
    }
}

/// Placement attribute that can be checked against the provider catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Location,
    Image,
    ServerType,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Location => write!(f, "location"),
            ResourceKind::Image => write!(f, "image"),
            ResourceKind::ServerType => write!(f, "server type"),
        }
    }
}
