//! Agent runtime records
//!
//! An [`Agent`] tracks one provisioned (or provisioning) server from the
//! moment the pool accepts a request until the server is deleted. State
//! changes go through [`Agent::transition`], which rejects any edge the
//! lifecycle does not allow and publishes the new state on a watch channel.

use crate::account::CloudAccount;
use crate::error::{ProvisionerError, Result};
use crate::template::Template;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stratus_core::{Channel, ServerId};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    /// Registered; create call not yet accepted
    Requested,
    /// Server exists, waiting for running + address
    Booting,
    /// Reachable, bootstrapping the remote shell
    Connecting,
    /// Schedulable
    Ready,
    /// Keep-around period expired with no work
    Idle,
    /// Server deletion pending
    Retiring,
    /// Terminal failure, cleanup pending
    Failed,
    /// Removed
    Gone,
}

impl AgentState {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Requested, Booting)
                | (Requested, Failed)
                | (Requested, Retiring)
                | (Booting, Connecting)
                | (Booting, Failed)
                | (Booting, Gone)
                | (Booting, Retiring)
                | (Connecting, Ready)
                | (Connecting, Failed)
                | (Connecting, Retiring)
                | (Ready, Idle)
                | (Ready, Retiring)
                | (Idle, Ready)
                | (Idle, Retiring)
                | (Failed, Retiring)
                | (Retiring, Gone)
        )
    }

    /// Agent can take jobs
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Ready | Self::Idle)
    }

    /// Agent is on its way out (or already gone)
    pub fn is_winding_down(self) -> bool {
        matches!(self, Self::Retiring | Self::Failed | Self::Gone)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Requested => "REQUESTED",
            AgentState::Booting => "BOOTING",
            AgentState::Connecting => "CONNECTING",
            AgentState::Ready => "READY",
            AgentState::Idle => "IDLE",
            AgentState::Retiring => "RETIRING",
            AgentState::Failed => "FAILED",
            AgentState::Gone => "GONE",
        };
        f.write_str(s)
    }
}

/// Why an agent entered `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Provider refused the create request
    CreateRejected(String),
    /// Create kept failing transiently
    CreateRetriesExhausted(String),
    /// Server did not become reachable before the boot deadline
    BootTimeout,
    /// Remote shell not established before the connect deadline
    ConnectTimeout,
    /// Connector gave up
    ConnectFailed(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::CreateRejected(msg) => write!(f, "create rejected: {}", msg),
            FailureReason::CreateRetriesExhausted(msg) => {
                write!(f, "create retries exhausted: {}", msg)
            }
            FailureReason::BootTimeout => write!(f, "boot timeout"),
            FailureReason::ConnectTimeout => write!(f, "connect timeout"),
            FailureReason::ConnectFailed(msg) => write!(f, "connect failed: {}", msg),
        }
    }
}

/// Tracking handle for one provisioning activity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProvisioningId {
    pub pool: String,
    pub template: String,
    pub id: Uuid,
}

impl ProvisioningId {
    pub fn new(pool: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            template: template.into(),
            id: Uuid::new_v4(),
        }
    }
}

impl std::fmt::Display for ProvisioningId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.pool, self.template, self.id)
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: AgentState,
    pub to: AgentState,
    pub at: DateTime<Utc>,
}

/// Runtime record of one cloud worker
#[derive(Debug)]
pub struct Agent {
    provisioning_id: ProvisioningId,
    node_name: String,
    template: Arc<Template>,
    account: Arc<CloudAccount>,

    state: AgentState,
    state_tx: watch::Sender<AgentState>,

    server_id: Option<ServerId>,
    address: Option<String>,
    channel: Option<Box<dyn Channel>>,

    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    deadline_at: DateTime<Utc>,
    connect_deadline_at: Option<DateTime<Utc>>,

    running_jobs: u32,
    failure: Option<FailureReason>,
    history: Vec<Transition>,
}

impl Agent {
    pub(crate) fn new(
        provisioning_id: ProvisioningId,
        node_name: String,
        template: Arc<Template>,
        account: Arc<CloudAccount>,
        now: DateTime<Utc>,
    ) -> Self {
        let deadline_at = now
            .checked_add_signed(template.boot_deadline())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let (state_tx, _) = watch::channel(AgentState::Requested);

        Self {
            provisioning_id,
            node_name,
            template,
            account,
            state: AgentState::Requested,
            state_tx,
            server_id: None,
            address: None,
            channel: None,
            created_at: now,
            last_activity_at: now,
            deadline_at,
            connect_deadline_at: None,
            running_jobs: 0,
            failure: None,
            history: Vec::new(),
        }
    }

    pub fn provisioning_id(&self) -> &ProvisioningId {
        &self.provisioning_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    pub fn account(&self) -> &Arc<CloudAccount> {
        &self.account
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn server_id(&self) -> Option<&ServerId> {
        self.server_id.as_ref()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn channel(&self) -> Option<&dyn Channel> {
        self.channel.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    /// Boot deadline: creation time plus the template's boot budget
    pub fn deadline_at(&self) -> DateTime<Utc> {
        self.deadline_at
    }

    /// Deadline for the remote shell handshake
    pub fn connect_deadline_at(&self) -> DateTime<Utc> {
        self.connect_deadline_at.unwrap_or(self.deadline_at)
    }

    pub fn running_jobs(&self) -> u32 {
        self.running_jobs
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Watch this agent's state
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    /// Move to `to`, rejecting edges the lifecycle does not allow
    pub(crate) fn transition(&mut self, to: AgentState, now: DateTime<Utc>) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(ProvisionerError::IllegalTransition {
                node: self.node_name.clone(),
                from,
                to,
            });
        }

        self.state = to;
        self.history.push(Transition { from, to, at: now });
        self.state_tx.send_replace(to);

        info!(
            node = %self.node_name,
            server_id = ?self.server_id.as_ref().map(ServerId::as_str),
            %from,
            %to,
            "Agent state changed"
        );
        Ok(())
    }

    pub(crate) fn record_server(&mut self, id: ServerId) {
        self.server_id = Some(id);
    }

    pub(crate) fn record_address(&mut self, address: String, connect_deadline_at: DateTime<Utc>) {
        self.address = Some(address);
        self.connect_deadline_at = Some(connect_deadline_at);
    }

    pub(crate) fn attach_channel(&mut self, channel: Box<dyn Channel>) {
        self.channel = Some(channel);
    }

    pub(crate) fn detach_channel(&mut self) {
        self.channel = None;
    }

    pub(crate) fn record_failure(&mut self, reason: FailureReason) {
        self.failure = Some(reason);
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    pub(crate) fn job_started(&mut self, now: DateTime<Utc>) {
        self.running_jobs += 1;
        self.last_activity_at = now;
    }

    pub(crate) fn job_finished(&mut self, now: DateTime<Utc>) {
        self.running_jobs = self.running_jobs.saturating_sub(1);
        self.last_activity_at = now;
    }

    /// Point-in-time copy for reporting
    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            provisioning_id: self.provisioning_id.clone(),
            node_name: self.node_name.clone(),
            template: self.template.name().to_string(),
            state: self.state,
            server_id: self.server_id.clone(),
            address: self.address.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            deadline_at: self.deadline_at,
            running_jobs: self.running_jobs,
            failure: self.failure.clone(),
            history: self.history.clone(),
        }
    }
}

/// Serializable view of an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub provisioning_id: ProvisioningId,
    pub node_name: String,
    pub template: String,
    pub state: AgentState,
    pub server_id: Option<ServerId>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub running_jobs: u32,
    pub failure: Option<FailureReason>,
    pub history: Vec<Transition>,
}

impl AgentSnapshot {
    /// States visited, in order, starting with `Requested`
    pub fn path(&self) -> Vec<AgentState> {
        std::iter::once(AgentState::Requested)
            .chain(self.history.iter().map(|t| t.to))
            .collect()
    }
}
