//! Pool configuration
//!
//! A pool is described by one JSON file:
//!
//! ```json
//! {
//!   "name": "hcloud-ci",
//!   "token_env": "HCLOUD_TOKEN",
//!   "credentials": { "username": "root", "private_key_path": "~/.ssh/id_ed25519" },
//!   "templates": [
//!     { "name": "ubuntu-small", "label_str": "linux docker", "image": "ubuntu-22.04",
//!       "location": "fsn1", "server_type": "cx22", "keep_around_minutes": 5 }
//!   ]
//! }
//! ```
//!
//! Every other field has a default. The API token itself never lives in the
//! file; `token_env` names the environment variable holding it.

use crate::account::CloudAccount;
use crate::clock::Clock;
use crate::driver::DEFAULT_SWEEP_INTERVAL_SECS;
use crate::error::{ProvisionerError, Result};
use crate::hetzner::DEFAULT_API_URL;
use crate::lifecycle::{DEFAULT_CALL_TIMEOUT_SECS, LifecycleEngine};
use crate::pool::{CloudPool, DEFAULT_MAX_CONCURRENT_CHECKS, PoolSettings};
use crate::retry::RetryPolicy;
use crate::template::{Template, TemplateConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stratus_core::{Connector, Credentials, ProviderClient};
use tracing::info;

/// Environment variable holding the API token unless configured otherwise
pub const DEFAULT_TOKEN_ENV: &str = "HCLOUD_TOKEN";

/// Longest pool name usable as a label value
const MAX_POOL_NAME_LEN: usize = 63;

/// Top-level configuration of one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name, stamped on every server as the ownership label
    pub name: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Environment variable holding the API token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,

    /// Upper bound for a single provider call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Retire agents that stayed IDLE for a whole sweep interval
    #[serde(default = "default_retire_idle")]
    pub retire_idle: bool,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub credentials: Credentials,

    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_max_concurrent_checks() -> usize {
    DEFAULT_MAX_CONCURRENT_CHECKS
}

fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

fn default_retire_idle() -> bool {
    true
}

impl PoolConfig {
    /// Config with the given name and every other field defaulted
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_url: default_api_url(),
            token_env: default_token_env(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_concurrent_checks: default_max_concurrent_checks(),
            call_timeout_secs: default_call_timeout_secs(),
            retire_idle: default_retire_idle(),
            retry: RetryPolicy::default(),
            credentials: Credentials::default(),
            templates: Vec::new(),
        }
    }

    /// Add a template
    pub fn with_template(mut self, template: TemplateConfig) -> Self {
        self.templates.push(template);
        self
    }

    /// Read, parse and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            pool = %config.name,
            templates = config.templates.len(),
            "Loaded pool config"
        );
        Ok(config)
    }

    /// Parse and validate
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProvisionerError::config("pool name must not be empty"));
        }
        if self.name.len() > MAX_POOL_NAME_LEN
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ProvisionerError::config(format!(
                "pool name '{}' must be at most {} characters of [A-Za-z0-9._-]",
                self.name, MAX_POOL_NAME_LEN
            )));
        }
        if self.max_concurrent_checks == 0 {
            return Err(ProvisionerError::config("max_concurrent_checks must be at least 1"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ProvisionerError::config("sweep_interval_secs must be at least 1"));
        }
        if self.call_timeout_secs == 0 {
            return Err(ProvisionerError::config("call_timeout_secs must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ProvisionerError::config("retry.max_attempts must be at least 1"));
        }

        let mut seen = HashSet::new();
        for template in &self.templates {
            if template.name.trim().is_empty() {
                return Err(ProvisionerError::config("template name must not be empty"));
            }
            if !seen.insert(template.name.as_str()) {
                return Err(ProvisionerError::config(format!(
                    "duplicate template name '{}'",
                    template.name
                )));
            }
            template.resolve()?;
        }

        Ok(())
    }

    /// Resolve every template definition
    pub fn resolve_templates(&self) -> Result<Vec<Template>> {
        self.templates.iter().map(TemplateConfig::resolve).collect()
    }

    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            max_concurrent_checks: self.max_concurrent_checks,
            retire_idle: self.retire_idle,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Account identity with `~` expanded in the key path
    pub fn account(&self) -> CloudAccount {
        let mut credentials = self.credentials.clone();
        credentials.private_key_path = credentials
            .private_key_path
            .map(|p| expand_home(&p, dirs::home_dir()));
        CloudAccount::new(&self.name, credentials)
    }

    /// API token from the environment
    pub fn token(&self) -> Result<String> {
        self.token_from(|key| std::env::var(key).ok())
    }

    fn token_from(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
        match lookup(&self.token_env) {
            Some(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(ProvisionerError::config(format!(
                "API token not set: export {}",
                self.token_env
            ))),
        }
    }

    /// Build the pool with every template registered
    pub fn build_pool(
        &self,
        provider: Arc<dyn ProviderClient>,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Result<CloudPool> {
        self.validate()?;

        let engine = LifecycleEngine::new(provider, connector, clock)
            .with_retry(self.retry.clone())
            .with_call_timeout(self.call_timeout());
        let mut pool = CloudPool::new(Arc::new(self.account()), engine, self.settings());
        for template in self.resolve_templates()? {
            pool.add_template(template)?;
        }
        Ok(pool)
    }
}

fn expand_home(path: &Path, home: Option<PathBuf>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
