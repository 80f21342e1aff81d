//! Cloud pool: agent registry, periodic sweep, orphan reconciliation
//!
//! A [`CloudPool`] owns every [`Agent`] created for one [`CloudAccount`].
//! Membership changes go through the registry lock; state changes go through
//! the [`LifecycleEngine`] while holding the agent's own mutex.
//!
//! ## Sweep
//!
//! ```text
//! sweep()
//!   ├─ snapshot registry (read lock, released)
//!   ├─ advance every agent, at most `max_concurrent_checks` at a time
//!   ├─ remove GONE agents (write lock)
//!   └─ reconcile: list servers labeled for this pool, delete the untracked ones
//! ```
//!
//! Only one sweep runs at a time. A sweep started while another is running
//! returns `None` immediately.

use crate::account::CloudAccount;
use crate::agent::{Agent, AgentSnapshot, AgentState, ProvisioningId};
use crate::error::{ProvisionerError, Result};
use crate::lifecycle::LifecycleEngine;
use crate::template::Template;
use futures::StreamExt;
use futures::stream;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use stratus_core::{ProviderError, ServerId, ServerInfo, ServerStatus};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default bound on agents checked in parallel during a sweep
pub const DEFAULT_MAX_CONCURRENT_CHECKS: usize = 8;

/// Most agents a single `provision` call may request
pub const MAX_PROVISION_DEMAND: usize = 1_000;

/// Runtime knobs of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Agents advanced in parallel during one sweep (>= 1)
    pub max_concurrent_checks: usize,

    /// Retire agents that were already IDLE when a sweep began
    pub retire_idle: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent_checks: DEFAULT_MAX_CONCURRENT_CHECKS,
            retire_idle: true,
        }
    }
}

struct AgentEntry {
    node_name: String,
    template: String,
    retire_requested: AtomicBool,
    agent: Mutex<Agent>,
    state_rx: watch::Receiver<AgentState>,
}

/// Shared handle to a registered agent.
///
/// Cheap to clone. Reading the state never waits on an in-flight provider call.
#[derive(Clone)]
pub struct AgentHandle(Arc<AgentEntry>);

impl AgentHandle {
    fn new(agent: Agent) -> Self {
        Self(Arc::new(AgentEntry {
            node_name: agent.node_name().to_string(),
            template: agent.template().name().to_string(),
            retire_requested: AtomicBool::new(false),
            state_rx: agent.subscribe(),
            agent: Mutex::new(agent),
        }))
    }

    pub fn node_name(&self) -> &str {
        &self.0.node_name
    }

    pub fn template(&self) -> &str {
        &self.0.template
    }

    /// Latest published state
    pub fn state(&self) -> AgentState {
        *self.0.state_rx.borrow()
    }

    /// Whether `retire` has been called for this agent
    pub fn retire_requested(&self) -> bool {
        self.0.retire_requested.load(Ordering::SeqCst)
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.0.state_rx.clone()
    }

    /// Wait until the agent reaches a state matching `pred`
    pub async fn wait_until(&self, pred: impl Fn(AgentState) -> bool) -> AgentState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| pred(*state)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Point-in-time copy of the agent record
    pub async fn snapshot(&self) -> AgentSnapshot {
        self.0.agent.lock().await.snapshot()
    }

    fn same_agent(&self, other: &AgentHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("node_name", &self.0.node_name)
            .field("state", &self.state())
            .finish()
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub visited: usize,
    pub transitions: usize,
    pub removed: usize,
    pub orphans_deleted: usize,
    pub orphan_failures: usize,
    pub duration: Duration,
}

impl SweepReport {
    fn is_quiet(&self) -> bool {
        self.transitions == 0
            && self.removed == 0
            && self.orphans_deleted == 0
            && self.orphan_failures == 0
    }
}

/// Registry of agents for one cloud account
pub struct CloudPool {
    account: Arc<CloudAccount>,
    engine: LifecycleEngine,
    settings: PoolSettings,
    templates: BTreeMap<String, Arc<Template>>,
    agents: RwLock<BTreeMap<String, AgentHandle>>,
    sweep_guard: Mutex<()>,
}

impl CloudPool {
    pub fn new(account: Arc<CloudAccount>, engine: LifecycleEngine, settings: PoolSettings) -> Self {
        Self {
            account,
            engine,
            settings,
            templates: BTreeMap::new(),
            agents: RwLock::new(BTreeMap::new()),
            sweep_guard: Mutex::new(()),
        }
    }

    pub fn account(&self) -> &Arc<CloudAccount> {
        &self.account
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Register a template and bind it to this pool's account
    pub fn add_template(&mut self, template: Template) -> Result<Arc<Template>> {
        if self.templates.contains_key(template.name()) {
            return Err(ProvisionerError::config(format!(
                "duplicate template '{}' in pool '{}'",
                template.name(),
                self.account.name
            )));
        }
        let template = Arc::new(template.bind(Arc::clone(&self.account)));
        self.templates
            .insert(template.name().to_string(), Arc::clone(&template));
        Ok(template)
    }

    pub fn template(&self, name: &str) -> Option<&Arc<Template>> {
        self.templates.get(name)
    }

    pub fn templates(&self) -> impl Iterator<Item = &Arc<Template>> {
        self.templates.values()
    }

    /// Templates able to run work requiring `label`
    pub fn templates_for(&self, label: Option<&str>) -> Vec<Arc<Template>> {
        self.templates
            .values()
            .filter(|t| t.can_serve(label))
            .cloned()
            .collect()
    }

    /// Register `demand` new agents for `template_name`.
    ///
    /// Agents start in REQUESTED; the server is created by the next sweep.
    pub async fn provision(&self, template_name: &str, demand: usize) -> Result<Vec<AgentHandle>> {
        let template = self.templates.get(template_name).ok_or_else(|| {
            ProvisionerError::config(format!(
                "unknown template '{}' in pool '{}'",
                template_name, self.account.name
            ))
        })?;
        if demand > MAX_PROVISION_DEMAND {
            return Err(ProvisionerError::config(format!(
                "demand {} for template '{}' exceeds the limit of {}",
                demand, template_name, MAX_PROVISION_DEMAND
            )));
        }

        let now = self.engine.clock().now();
        let mut agents = self.agents.write().await;
        let mut handles = Vec::with_capacity(demand);

        for _ in 0..demand {
            let node_name = loop {
                let candidate = node_name_for(template.name());
                if !agents.contains_key(&candidate) {
                    break candidate;
                }
            };
            let provisioning_id = ProvisioningId::new(&self.account.name, template.name());
            let agent = template.create_agent(provisioning_id, node_name, now)?;

            info!(
                pool = %self.account.name,
                template = %template.name(),
                node = %agent.node_name(),
                provisioning_id = %agent.provisioning_id(),
                "Agent requested"
            );

            let handle = AgentHandle::new(agent);
            agents.insert(handle.node_name().to_string(), handle.clone());
            handles.push(handle);
        }

        Ok(handles)
    }

    /// Ask for an agent to be retired.
    ///
    /// Returns `true` the first time it is called for the agent. The change
    /// is applied at once if nothing is in flight for the agent, otherwise
    /// by the sweep that holds it.
    pub fn retire(&self, handle: &AgentHandle) -> bool {
        let first = !handle.0.retire_requested.swap(true, Ordering::SeqCst);
        if first {
            info!(node = %handle.node_name(), state = %handle.state(), "Retire requested");
        }

        if let Ok(mut agent) = handle.0.agent.try_lock() {
            if let Err(e) = self.engine.request_retire(&mut agent) {
                warn!(node = %handle.node_name(), error = %e, "Retire rejected");
            }
        }

        first
    }

    /// Retire by node name
    pub async fn retire_node(&self, node_name: &str) -> Result<bool> {
        let handle = self.require(node_name).await?;
        Ok(self.retire(&handle))
    }

    /// Record a job starting on `node_name`
    pub async fn assign_job(&self, node_name: &str) -> Result<()> {
        let handle = self.require(node_name).await?;
        if handle.retire_requested() {
            return Err(ProvisionerError::AgentUnavailable {
                node: node_name.to_string(),
                state: handle.state(),
            });
        }
        let mut agent = handle.0.agent.lock().await;
        self.engine.assign_job(&mut agent)
    }

    /// Record a job finishing on `node_name`
    pub async fn finish_job(&self, node_name: &str) -> Result<()> {
        let handle = self.require(node_name).await?;
        let mut agent = handle.0.agent.lock().await;
        self.engine.finish_job(&mut agent);
        Ok(())
    }

    pub async fn agent(&self, node_name: &str) -> Option<AgentHandle> {
        self.agents.read().await.get(node_name).cloned()
    }

    /// Registered agents in node-name order
    pub async fn handles(&self) -> Vec<AgentHandle> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Snapshots of every registered agent in node-name order
    pub async fn agents(&self) -> Vec<AgentSnapshot> {
        let mut snapshots = Vec::new();
        for handle in self.handles().await {
            snapshots.push(handle.snapshot().await);
        }
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Servers carrying this pool's label
    pub async fn owned_servers(&self) -> Result<Vec<ServerInfo>> {
        let engine = &self.engine;
        let servers = engine
            .retry()
            .run("list_servers", move || engine.call(engine.provider().list_servers()))
            .await?;
        Ok(servers
            .into_iter()
            .filter(|s| self.account.owns(&s.labels))
            .collect())
    }

    async fn require(&self, node_name: &str) -> Result<AgentHandle> {
        self.agent(node_name)
            .await
            .ok_or_else(|| ProvisionerError::AgentNotFound(node_name.to_string()))
    }

    /// Advance every agent, drop GONE ones, delete orphaned servers.
    ///
    /// Returns `None` if another sweep is already running.
    pub async fn sweep(&self) -> Option<SweepReport> {
        let Ok(_guard) = self.sweep_guard.try_lock() else {
            debug!(pool = %self.account.name, "Sweep already running, skipping");
            return None;
        };
        let started = Instant::now();
        let mut report = SweepReport::default();

        let handles = self.handles().await;
        report.visited = handles.len();

        let checks = handles.into_iter().map(move |handle| {
            let was_idle = self.settings.retire_idle && handle.state() == AgentState::Idle;
            async move {
                let (transitions, gone) = self.check(&handle, was_idle).await;
                (handle, transitions, gone)
            }
        });
        let results: Vec<(AgentHandle, usize, bool)> = stream::iter(checks)
            .buffer_unordered(self.settings.max_concurrent_checks.max(1))
            .collect()
            .await;

        let mut gone = Vec::new();
        for (handle, transitions, is_gone) in results {
            report.transitions += transitions;
            if is_gone {
                gone.push(handle);
            }
        }
        report.removed = self.remove_gone(gone).await;

        let (deleted, failed) = self.reconcile_orphans().await;
        report.orphans_deleted = deleted;
        report.orphan_failures = failed;
        report.duration = started.elapsed();

        if report.is_quiet() {
            debug!(pool = %self.account.name, visited = report.visited, "Sweep complete");
        } else {
            info!(
                pool = %self.account.name,
                visited = report.visited,
                transitions = report.transitions,
                removed = report.removed,
                orphans_deleted = report.orphans_deleted,
                orphan_failures = report.orphan_failures,
                duration_ms = report.duration.as_millis() as u64,
                "Sweep complete"
            );
        }

        Some(report)
    }

    /// Sweep every `interval` until each of `handles` is READY, IDLE or GONE.
    ///
    /// Fails with [`ProvisionerError::Timeout`] once `timeout` has elapsed.
    pub async fn sweep_until_settled(
        &self,
        handles: &[AgentHandle],
        interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let settled = |handle: &AgentHandle| {
            matches!(
                handle.state(),
                AgentState::Ready | AgentState::Idle | AgentState::Gone
            )
        };

        let sweeps = async {
            loop {
                self.sweep().await;
                if handles.iter().all(settled) {
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        };

        tokio::time::timeout(timeout, sweeps)
            .await
            .map_err(|_| ProvisionerError::Timeout(timeout))
    }

    /// Advance one agent. Returns transitions made and whether it is GONE.
    async fn check(&self, handle: &AgentHandle, was_idle: bool) -> (usize, bool) {
        let mut agent = handle.0.agent.lock().await;

        if was_idle && agent.state() == AgentState::Idle && agent.running_jobs() == 0 {
            info!(node = %handle.node_name(), "Retiring idle agent");
            handle.0.retire_requested.store(true, Ordering::SeqCst);
        }

        let transitions = self
            .engine
            .advance(&mut agent, &handle.0.retire_requested)
            .await;
        (transitions, agent.state() == AgentState::Gone)
    }

    async fn remove_gone(&self, gone: Vec<AgentHandle>) -> usize {
        if gone.is_empty() {
            return 0;
        }

        let mut agents = self.agents.write().await;
        let mut removed = 0;
        for handle in gone {
            let registered = agents
                .get(handle.node_name())
                .is_some_and(|current| current.same_agent(&handle));
            if registered {
                agents.remove(handle.node_name());
                debug!(node = %handle.node_name(), "Agent removed");
                removed += 1;
            }
        }
        removed
    }

    /// Delete servers labeled for this pool that no agent accounts for.
    ///
    /// Returns `(deleted, failed)`.
    async fn reconcile_orphans(&self) -> (usize, usize) {
        let servers = match self.owned_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(pool = %self.account.name, error = %e, "Orphan reconciliation skipped");
                return (0, 0);
            }
        };

        // Taken after listing so a server created during the list call is known
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for handle in self.handles().await {
            names.insert(handle.node_name().to_string());
            if let Some(id) = handle.0.agent.lock().await.server_id() {
                ids.insert(id.clone());
            }
        }

        let orphans: Vec<ServerInfo> = servers
            .into_iter()
            .filter(|s| s.status != ServerStatus::Deleting)
            .filter(|s| !names.contains(&s.name) && !ids.contains(&s.id))
            .collect();

        if orphans.is_empty() {
            return (0, 0);
        }

        let outcomes: Vec<bool> = stream::iter(orphans)
            .map(move |server| async move { self.delete_orphan(&server.id, &server.name).await })
            .buffer_unordered(self.settings.max_concurrent_checks.max(1))
            .collect()
            .await;

        let deleted = outcomes.iter().filter(|ok| **ok).count();
        (deleted, outcomes.len() - deleted)
    }

    async fn delete_orphan(&self, id: &ServerId, name: &str) -> bool {
        info!(pool = %self.account.name, server_id = %id, server = name, "Deleting orphaned server");
        let engine = &self.engine;
        match engine
            .retry()
            .run("delete_server", move || engine.call(engine.provider().delete_server(id)))
            .await
        {
            Ok(()) | Err(ProviderError::NotFound(_)) => true,
            Err(e) => {
                warn!(server_id = %id, server = name, error = %e, "Orphan delete failed");
                false
            }
        }
    }
}

/// `<template>-<8 hex>`, lowercased and restricted to hostname characters
fn node_name_for(template: &str) -> String {
    let base: String = template
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let base = base.trim_matches('-');
    let base = if base.is_empty() { "agent" } else { base };
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}
