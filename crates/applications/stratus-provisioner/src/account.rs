//! Cloud account identity shared by a pool, its templates and its agents

use serde::{Deserialize, Serialize};
use stratus_core::Credentials;

/// Server label naming the pool that owns a server
pub const POOL_LABEL: &str = "stratus/pool";

/// Server label naming the template a server was created from
pub const TEMPLATE_LABEL: &str = "stratus/template";

/// The account/credential identity one pool provisions under.
///
/// Every server created through the pool is stamped with
/// `POOL_LABEL=<name>`; orphan reconciliation only ever touches servers
/// carrying that label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudAccount {
    pub name: String,
    pub credentials: Credentials,
}

impl CloudAccount {
    pub fn new(name: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            name: name.into(),
            credentials,
        }
    }

    /// Whether a server's labels mark it as owned by this account
    pub fn owns(&self, labels: &std::collections::BTreeMap<String, String>) -> bool {
        labels.get(POOL_LABEL).is_some_and(|pool| pool == &self.name)
    }

    /// Label selector matching servers owned by this account
    pub fn label_selector(&self) -> String {
        format!("{}=={}", POOL_LABEL, self.name)
    }
}
