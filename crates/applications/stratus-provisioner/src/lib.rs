//! # Stratus Provisioner
//!
//! Elastic pool of cloud workers created on demand and torn down when idle.
//!
//! ## Architecture
//!
//! ```text
//! scheduler ──provision/retire──▶ CloudPool ──sweep──▶ LifecycleEngine
//!                                   │                    ├── ProviderClient (Hetzner Cloud)
//!                                   │                    └── Connector (SSH probe)
//!                                   └── orphan reconciliation (list + delete)
//! ```
//!
//! - [`template`]: validated worker classes
//! - [`agent`]: runtime record and state machine of one worker
//! - [`lifecycle`]: drives agents from REQUESTED to GONE
//! - [`pool`]: registry, sweep, orphan reconciliation
//! - [`driver`]: periodic sweep timer
//!
//! Agent state is not persisted. After a crash, reconciliation deletes every
//! server carrying the pool label that no live agent accounts for.

#![warn(clippy::all)]

pub mod account;
pub mod agent;
pub mod clock;
pub mod config;
pub mod connector;
pub mod driver;
pub mod error;
pub mod hetzner;
pub mod lifecycle;
pub mod pool;
pub mod retry;
pub mod template;

#[cfg(test)]
mod testing;

// Error handling
pub use error::{ProvisionerError, Result};

// Templates and agents
pub use account::{CloudAccount, POOL_LABEL, TEMPLATE_LABEL};
pub use agent::{Agent, AgentSnapshot, AgentState, FailureReason, ProvisioningId, Transition};
pub use template::{
    verify_template, ConnectorConfig, ResourceCheck, Template, TemplateConfig,
    DEFAULT_BOOT_DEADLINE_SECS, DEFAULT_NUM_EXECUTORS, MAX_DEADLINE_SECS, MAX_KEEP_AROUND_MINUTES,
};

// Lifecycle and pool
pub use clock::{Clock, SystemClock};
pub use driver::{SweepDriver, DEFAULT_SWEEP_INTERVAL_SECS};
pub use lifecycle::LifecycleEngine;
pub use pool::{AgentHandle, CloudPool, PoolSettings, SweepReport, MAX_PROVISION_DEMAND};
pub use retry::RetryPolicy;

// Configuration
pub use config::PoolConfig;

// Adapters
pub use connector::{SshChannel, SshProbeConnector};
pub use hetzner::{HetznerClient, DEFAULT_API_URL};
