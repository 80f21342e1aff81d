//! Worker templates
//!
//! A [`TemplateConfig`] is the persisted, user-edited form of a worker
//! class. [`TemplateConfig::resolve`] validates it and produces a
//! [`Template`]: an immutable value with its label set derived from
//! `label_str` and every numeric default filled in.
//!
//! A resolved template must be bound to a pool's [`CloudAccount`] before it
//! can create agents; the pool does this when the template is registered.

use crate::account::{CloudAccount, POOL_LABEL, TEMPLATE_LABEL};
use crate::agent::{Agent, ProvisioningId};
use crate::error::{ProvisionerError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use stratus_core::{ProviderClient, ResourceKind, ServerSpec};
use tracing::{debug, warn};

/// Executors per worker when the template leaves it at zero
pub const DEFAULT_NUM_EXECUTORS: u32 = 1;

/// Boot deadline when the template leaves it at zero
pub const DEFAULT_BOOT_DEADLINE_SECS: u64 = 60;

/// Upper bound for boot and connect deadlines (one day)
pub const MAX_DEADLINE_SECS: u64 = 86_400;

/// Upper bound for the keep-around period (one week)
pub const MAX_KEEP_AROUND_MINUTES: u64 = 10_080;

/// Port the connector dials when none is configured
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How to reach a worker once it has an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Budget for the remote shell handshake, counted from the moment the
    /// server became reachable. Unset means the boot deadline also covers
    /// connecting.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SSH_PORT,
            connect_timeout_secs: None,
        }
    }
}

impl ConnectorConfig {
    /// `host:port` endpoint for an address, bracketing IPv6 literals
    pub fn endpoint(&self, address: &str) -> String {
        if address.contains(':') && !address.starts_with('[') {
            format!("[{}]:{}", address, self.port)
        } else {
            format!("{}:{}", address, self.port)
        }
    }
}

/// Persisted template definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub name: String,

    /// Space-separated scheduling labels
    #[serde(default)]
    pub label_str: String,

    pub image: String,

    #[serde(default)]
    pub location: String,

    pub server_type: String,

    /// 0 = default
    #[serde(default)]
    pub num_executors: u32,

    /// 0 = default
    #[serde(default)]
    pub boot_deadline_secs: u64,

    /// Idle grace period; unset or 0 = retire as soon as idle
    #[serde(default)]
    pub keep_around_minutes: Option<u64>,

    #[serde(default)]
    pub connector: ConnectorConfig,

    /// Remote working directory for jobs
    #[serde(default)]
    pub work_dir: Option<String>,

    /// cloud-init script passed to the provider
    #[serde(default)]
    pub user_data: Option<String>,
}

impl TemplateConfig {
    /// Create a template config with placement only; everything else defaulted
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        location: impl Into<String>,
        server_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            label_str: String::new(),
            image: image.into(),
            location: location.into(),
            server_type: server_type.into(),
            num_executors: 0,
            boot_deadline_secs: 0,
            keep_around_minutes: None,
            connector: ConnectorConfig::default(),
            work_dir: None,
            user_data: None,
        }
    }

    /// Set labels
    pub fn with_labels(mut self, label_str: impl Into<String>) -> Self {
        self.label_str = label_str.into();
        self
    }

    /// Set executor count
    pub fn with_num_executors(mut self, n: u32) -> Self {
        self.num_executors = n;
        self
    }

    /// Set boot deadline
    pub fn with_boot_deadline_secs(mut self, secs: u64) -> Self {
        self.boot_deadline_secs = secs;
        self
    }

    /// Set keep-around period
    pub fn with_keep_around_minutes(mut self, minutes: u64) -> Self {
        self.keep_around_minutes = Some(minutes);
        self
    }

    /// Set connector config
    pub fn with_connector(mut self, connector: ConnectorConfig) -> Self {
        self.connector = connector;
        self
    }

    /// Validate and derive the immutable template
    pub fn resolve(&self) -> Result<Template> {
        if self.location.trim().is_empty() {
            return Err(ProvisionerError::config(format!(
                "template '{}': location must be specified",
                self.name
            )));
        }

        let num_executors = if self.num_executors == 0 {
            DEFAULT_NUM_EXECUTORS
        } else {
            self.num_executors
        };

        let boot_deadline_secs = if self.boot_deadline_secs == 0 {
            DEFAULT_BOOT_DEADLINE_SECS
        } else {
            self.boot_deadline_secs
        };

        if self.connector.connect_timeout_secs == Some(0) {
            return Err(ProvisionerError::config(format!(
                "template '{}': connect timeout must be positive",
                self.name
            )));
        }

        let keep_around_minutes = self.keep_around_minutes.unwrap_or(0);
        let boot_deadline = self.bounded(
            "boot_deadline_secs",
            boot_deadline_secs,
            MAX_DEADLINE_SECS,
            TimeDelta::try_seconds,
        )?;
        let keep_around = self.bounded(
            "keep_around_minutes",
            keep_around_minutes,
            MAX_KEEP_AROUND_MINUTES,
            TimeDelta::try_minutes,
        )?;
        let connect_timeout = self
            .connector
            .connect_timeout_secs
            .map(|secs| {
                self.bounded(
                    "connect_timeout_secs",
                    secs,
                    MAX_DEADLINE_SECS,
                    TimeDelta::try_seconds,
                )
            })
            .transpose()?;

        debug!(template = %self.name, labels = %self.label_str, "Resolved template");

        Ok(Template {
            name: self.name.clone(),
            labels: parse_labels(&self.label_str),
            label_str: self.label_str.clone(),
            image: self.image.clone(),
            location: self.location.clone(),
            server_type: self.server_type.clone(),
            num_executors,
            boot_deadline_secs,
            keep_around_minutes,
            boot_deadline,
            keep_around,
            connect_timeout,
            connector: self.connector.clone(),
            work_dir: self.work_dir.clone(),
            user_data: self.user_data.clone(),
            account: None,
        })
    }

    /// Convert `value` to a duration, rejecting anything above `max`
    fn bounded(
        &self,
        field: &str,
        value: u64,
        max: u64,
        to_delta: fn(i64) -> Option<TimeDelta>,
    ) -> Result<TimeDelta> {
        if value > max {
            return Err(ProvisionerError::config(format!(
                "template '{}': {} must be at most {}, got {}",
                self.name, field, max, value
            )));
        }
        i64::try_from(value)
            .ok()
            .and_then(to_delta)
            .ok_or_else(|| {
                ProvisionerError::config(format!(
                    "template '{}': {} out of range: {}",
                    self.name, field, value
                ))
            })
    }
}

/// Parse a space-separated label string into a set
pub fn parse_labels(label_str: &str) -> BTreeSet<String> {
    label_str.split_whitespace().map(str::to_string).collect()
}

/// Validated, immutable worker class
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    label_str: String,
    labels: BTreeSet<String>,
    image: String,
    location: String,
    server_type: String,
    num_executors: u32,
    boot_deadline_secs: u64,
    keep_around_minutes: u64,
    boot_deadline: TimeDelta,
    keep_around: TimeDelta,
    connect_timeout: Option<TimeDelta>,
    connector: ConnectorConfig,
    work_dir: Option<String>,
    user_data: Option<String>,
    account: Option<Arc<CloudAccount>>,
}

impl Template {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label_str(&self) -> &str {
        &self.label_str
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn server_type(&self) -> &str {
        &self.server_type
    }

    pub fn num_executors(&self) -> u32 {
        self.num_executors
    }

    pub fn boot_deadline_secs(&self) -> u64 {
        self.boot_deadline_secs
    }

    pub fn keep_around_minutes(&self) -> u64 {
        self.keep_around_minutes
    }

    pub fn boot_deadline(&self) -> TimeDelta {
        self.boot_deadline
    }

    pub fn keep_around(&self) -> TimeDelta {
        self.keep_around
    }

    /// Separate connect budget, if the connector sets one
    pub fn connect_timeout(&self) -> Option<TimeDelta> {
        self.connect_timeout
    }

    pub fn connector(&self) -> &ConnectorConfig {
        &self.connector
    }

    pub fn work_dir(&self) -> Option<&str> {
        self.work_dir.as_deref()
    }

    /// Account this template is bound to, if any
    pub fn account(&self) -> Option<&Arc<CloudAccount>> {
        self.account.as_ref()
    }

    /// Bind the template to the account of the pool that owns it
    pub fn bind(mut self, account: Arc<CloudAccount>) -> Self {
        self.account = Some(account);
        self
    }

    /// Whether this template can run work requiring `label`.
    ///
    /// Unlabeled work runs anywhere.
    pub fn can_serve(&self, label: Option<&str>) -> bool {
        match label {
            None => true,
            Some(label) => self.labels.contains(label),
        }
    }

    /// Create request for a server backing `node_name`
    pub fn server_spec(&self, node_name: &str) -> ServerSpec {
        let mut spec = ServerSpec::new(node_name, &self.server_type, &self.image, &self.location)
            .with_label(TEMPLATE_LABEL, &self.name)
            .with_user_data(self.user_data.clone());
        if let Some(account) = &self.account {
            spec = spec.with_label(POOL_LABEL, &account.name);
        }
        spec
    }

    /// Create a new agent in `Requested` state bound to this template.
    ///
    /// Fails with [`ProvisionerError::IllegalState`] if the template has not
    /// been bound to a pool.
    pub fn create_agent(
        self: &Arc<Self>,
        provisioning_id: ProvisioningId,
        node_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Agent> {
        let account = self.account.clone().ok_or_else(|| {
            ProvisionerError::illegal_state(format!(
                "template '{}' is not bound to a pool",
                self.name
            ))
        })?;

        Ok(Agent::new(
            provisioning_id,
            node_name.into(),
            Arc::clone(self),
            account,
            now,
        ))
    }
}

/// Outcome of checking one placement attribute against the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceCheck {
    pub kind: ResourceKind,
    pub name: String,
    /// `None` when the provider cannot tell or the check failed
    pub exists: Option<bool>,
}

/// Check the template's location, image and server type with the provider.
///
/// Errors from the provider are logged and reported as unknown.
pub async fn verify_template(provider: &dyn ProviderClient, template: &Template) -> Vec<ResourceCheck> {
    let checks = [
        (ResourceKind::Location, template.location()),
        (ResourceKind::Image, template.image()),
        (ResourceKind::ServerType, template.server_type()),
    ];

    let mut results = Vec::with_capacity(checks.len());
    for (kind, name) in checks {
        let exists = match provider.verify_resource(kind, name).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(template = %template.name(), %kind, name, error = %e, "Verification failed");
                None
            }
        };
        results.push(ResourceCheck {
            kind,
            name: name.to_string(),
            exists,
        });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentState;
    use crate::testing::MockProvider;
    use stratus_core::Credentials;

    fn config() -> TemplateConfig {
        TemplateConfig::new("ubuntu-small", "ubuntu-22.04", "fsn1", "cx22")
            .with_labels("linux  docker linux")
    }

    #[test]
    fn test_resolve_requires_location() {
        let mut cfg = config();
        cfg.location = "  ".to_string();

        let err = cfg.resolve().unwrap_err();
        assert!(matches!(err, ProvisionerError::Configuration(_)));
        assert!(err.to_string().contains("location"));
    }

    #[test]
    fn test_resolve_fills_defaults() {
        let template = config().resolve().unwrap();

        assert_eq!(template.num_executors(), DEFAULT_NUM_EXECUTORS);
        assert_eq!(template.boot_deadline_secs(), DEFAULT_BOOT_DEADLINE_SECS);
        assert_eq!(template.keep_around_minutes(), 0);
        assert_eq!(template.connector().port, DEFAULT_SSH_PORT);
    }

    #[test]
    fn test_resolve_keeps_explicit_values() {
        let template = config()
            .with_num_executors(4)
            .with_boot_deadline_secs(300)
            .with_keep_around_minutes(10)
            .resolve()
            .unwrap();

        assert_eq!(template.num_executors(), 4);
        assert_eq!(template.boot_deadline_secs(), 300);
        assert_eq!(template.keep_around_minutes(), 10);
    }

    #[test]
    fn test_resolve_rejects_zero_connect_timeout() {
        let cfg = config().with_connector(ConnectorConfig {
            port: 22,
            connect_timeout_secs: Some(0),
        });
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn test_resolve_rejects_oversized_durations() {
        let err = config()
            .with_boot_deadline_secs(10_000_000_000_000)
            .resolve()
            .unwrap_err();
        assert!(matches!(err, ProvisionerError::Configuration(_)));
        assert!(err.to_string().contains("boot_deadline_secs"));

        let err = config().with_keep_around_minutes(1 << 60).resolve().unwrap_err();
        assert!(err.to_string().contains("keep_around_minutes"));

        let err = config()
            .with_connector(ConnectorConfig {
                port: 22,
                connect_timeout_secs: Some(u64::MAX),
            })
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("connect_timeout_secs"));
    }

    #[test]
    fn test_resolve_accepts_upper_bounds() {
        let template = config()
            .with_boot_deadline_secs(MAX_DEADLINE_SECS)
            .with_keep_around_minutes(MAX_KEEP_AROUND_MINUTES)
            .with_connector(ConnectorConfig {
                port: 22,
                connect_timeout_secs: Some(MAX_DEADLINE_SECS),
            })
            .resolve()
            .unwrap();

        assert_eq!(template.boot_deadline(), TimeDelta::days(1));
        assert_eq!(template.keep_around(), TimeDelta::weeks(1));
        assert_eq!(template.connect_timeout(), Some(TimeDelta::days(1)));

        let account = Arc::new(CloudAccount::new("ci", Credentials::default()));
        let template = Arc::new(template.bind(account));
        let now = Utc::now();
        let agent = template
            .create_agent(ProvisioningId::new("ci", "ubuntu-small"), "node-1", now)
            .unwrap();
        assert_eq!(agent.deadline_at(), now + TimeDelta::days(1));
    }

    #[test]
    fn test_labels_derived_from_label_str() {
        let template = config().resolve().unwrap();

        let labels: Vec<_> = template.labels().iter().map(String::as_str).collect();
        assert_eq!(labels, vec!["docker", "linux"]);

        let mut cfg = config();
        cfg.label_str = "arm64".to_string();
        let template = cfg.resolve().unwrap();
        assert!(template.labels().contains("arm64"));
        assert!(!template.labels().contains("linux"));
    }

    #[test]
    fn test_can_serve() {
        let template = config().resolve().unwrap();

        assert!(template.can_serve(None));
        assert!(template.can_serve(Some("docker")));
        assert!(!template.can_serve(Some("windows")));
    }

    #[test]
    fn test_create_agent_requires_binding() {
        let template = Arc::new(config().resolve().unwrap());

        let err = template
            .create_agent(ProvisioningId::new("ci", "ubuntu-small"), "node-1", Utc::now())
            .unwrap_err();
        assert!(matches!(err, ProvisionerError::IllegalState(_)));
    }

    #[test]
    fn test_create_agent_starts_requested() {
        let account = Arc::new(CloudAccount::new("ci", Credentials::default()));
        let template = Arc::new(config().resolve().unwrap().bind(account));
        let now = Utc::now();

        let agent = template
            .create_agent(ProvisioningId::new("ci", "ubuntu-small"), "node-1", now)
            .unwrap();

        assert_eq!(agent.state(), AgentState::Requested);
        assert_eq!(agent.node_name(), "node-1");
        assert!(agent.server_id().is_none());
        assert_eq!(
            agent.deadline_at(),
            now + chrono::Duration::seconds(DEFAULT_BOOT_DEADLINE_SECS as i64)
        );
    }

    #[test]
    fn test_server_spec_carries_ownership_labels() {
        let account = Arc::new(CloudAccount::new("ci", Credentials::default()));
        let template = config().resolve().unwrap().bind(account);

        let spec = template.server_spec("ubuntu-small-1a2b3c4d");

        assert_eq!(spec.name, "ubuntu-small-1a2b3c4d");
        assert_eq!(spec.labels.get(POOL_LABEL).map(String::as_str), Some("ci"));
        assert_eq!(
            spec.labels.get(TEMPLATE_LABEL).map(String::as_str),
            Some("ubuntu-small")
        );
    }

    #[test]
    fn test_connector_endpoint() {
        let connector = ConnectorConfig::default();
        assert_eq!(connector.endpoint("10.0.0.2"), "10.0.0.2:22");
        assert_eq!(connector.endpoint("2001:db8::1"), "[2001:db8::1]:22");
    }

    #[tokio::test]
    async fn test_verify_template_reports_unknown_by_default() {
        let provider = MockProvider::new();
        let template = config().resolve().unwrap();

        let checks = verify_template(&provider, &template).await;

        assert_eq!(checks.len(), 3);
        assert!(checks.iter().all(|c| c.exists.is_none()));
        assert_eq!(checks[0].kind, ResourceKind::Location);
        assert_eq!(checks[0].name, "fsn1");
    }
}
