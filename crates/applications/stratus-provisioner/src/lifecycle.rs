//! Agent lifecycle engine
//!
//! Drives an [`Agent`] through its state machine:
//!
//! ```text
//! REQUESTED ──create──▶ BOOTING ──running+address──▶ CONNECTING ──connect──▶ READY ◀──job──┐
//!     │                  │  │                            │                     │            │
//!     │ permanent /      │  └──not found──▶ GONE         │ fatal / deadline    │ keep-around│
//!     │ retries exhausted│ deadline                      ▼                     ▼ expired    │
//!     └──────────────────┴──────────────▶ FAILED ──▶ RETIRING ──delete──▶ GONE   IDLE ───────┘
//!                                                        ▲                        │
//!                       explicit retire (any live state) ┴────────────────────────┘
//! ```
//!
//! ## Key Design Decisions
//!
//! - **Chained steps**: one [`LifecycleEngine::advance`] call keeps stepping
//!   while observations allow, so a server that boots instantly is READY
//!   after a single sweep. Calls for one agent are strictly sequential.
//! - **Deadlines first**: BOOTING and CONNECTING check their wall-clock
//!   deadline before talking to the provider or connector.
//! - **Retire wins**: the retire flag is read before every step, so a create
//!   that completes for an agent already being retired goes straight to
//!   deletion.
//! - **Cleanup never blocks removal**: failed agents get exactly one delete
//!   attempt; whatever it leaves behind is reclaimed by orphan reconciliation.

use crate::agent::{Agent, AgentState, FailureReason};
use crate::clock::Clock;
use crate::error::{ProvisionerError, Result};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stratus_core::{Connector, ProviderClient, ProviderError, ProviderResult};
use tracing::{debug, error, info, warn};

/// Default upper bound for a single provider call
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// State machine driver shared by every agent of a pool
pub struct LifecycleEngine {
    provider: Arc<dyn ProviderClient>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl LifecycleEngine {
    /// Create an engine with default retry policy and call timeout
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            connector,
            clock,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }

    /// Set retry policy for transient provider errors
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set per-call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn provider(&self) -> &Arc<dyn ProviderClient> {
        &self.provider
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Advance `agent` as far as current observations allow.
    ///
    /// Returns the number of transitions made. Never fails: provider and
    /// connector errors become state changes or are logged, and an illegal
    /// transition (a bug) stops the pass.
    pub async fn advance(&self, agent: &mut Agent, retire: &AtomicBool) -> usize {
        let mut transitions = 0;

        while agent.state() != AgentState::Gone {
            match self.step(agent, retire).await {
                Ok(true) => transitions += 1,
                Ok(false) => break,
                Err(e) => {
                    error!(node = %agent.node_name(), error = %e, "Lifecycle step rejected");
                    break;
                }
            }
        }

        transitions
    }

    /// Perform at most one transition. `Ok(true)` if the state changed.
    async fn step(&self, agent: &mut Agent, retire: &AtomicBool) -> Result<bool> {
        let now = self.clock.now();
        let retire_requested = retire.load(Ordering::SeqCst);

        match agent.state() {
            AgentState::Requested => {
                if retire_requested {
                    info!(node = %agent.node_name(), "Retired before creation");
                    return self.move_to(agent, AgentState::Retiring);
                }
                self.create(agent).await
            }

            AgentState::Booting => {
                if retire_requested {
                    return self.move_to(agent, AgentState::Retiring);
                }
                if now > agent.deadline_at() {
                    warn!(
                        node = %agent.node_name(),
                        deadline = %agent.deadline_at(),
                        "Boot deadline exceeded"
                    );
                    return self.fail(agent, FailureReason::BootTimeout);
                }
                self.poll_boot(agent).await
            }

            AgentState::Connecting => {
                if retire_requested {
                    return self.move_to(agent, AgentState::Retiring);
                }
                if now > agent.connect_deadline_at() {
                    warn!(
                        node = %agent.node_name(),
                        deadline = %agent.connect_deadline_at(),
                        "Connect deadline exceeded"
                    );
                    return self.fail(agent, FailureReason::ConnectTimeout);
                }
                self.connect(agent).await
            }

            AgentState::Ready => {
                if retire_requested {
                    return self.move_to(agent, AgentState::Retiring);
                }
                if idle_expired(agent, now) {
                    debug!(
                        node = %agent.node_name(),
                        last_activity = %agent.last_activity_at(),
                        "Keep-around period expired"
                    );
                    return self.move_to(agent, AgentState::Idle);
                }
                Ok(false)
            }

            AgentState::Idle => {
                if retire_requested {
                    return self.move_to(agent, AgentState::Retiring);
                }
                if agent.running_jobs() > 0 {
                    return self.move_to(agent, AgentState::Ready);
                }
                Ok(false)
            }

            AgentState::Failed => self.move_to(agent, AgentState::Retiring),

            AgentState::Retiring => self.delete(agent).await,

            AgentState::Gone => Ok(false),
        }
    }

    /// REQUESTED: ask the provider for a server
    async fn create(&self, agent: &mut Agent) -> Result<bool> {
        let spec = agent.template().server_spec(agent.node_name());
        let spec = &spec;

        info!(
            node = %agent.node_name(),
            provisioning_id = %agent.provisioning_id(),
            server_type = %spec.server_type,
            location = %spec.location,
            "Creating server"
        );

        let result = self
            .retry
            .run("create_server", move || self.call(self.provider.create_server(spec)))
            .await;

        match result {
            Ok(info) => {
                info!(node = %agent.node_name(), server_id = %info.id, status = %info.status, "Server created");
                agent.record_server(info.id);
                self.move_to(agent, AgentState::Booting)
            }
            Err(ProviderError::Transient(msg)) => {
                self.fail(agent, FailureReason::CreateRetriesExhausted(msg))
            }
            Err(e) => {
                warn!(node = %agent.node_name(), error = %e, "Server create rejected");
                self.fail(agent, FailureReason::CreateRejected(e.to_string()))
            }
        }
    }

    /// BOOTING: wait for running + address
    async fn poll_boot(&self, agent: &mut Agent) -> Result<bool> {
        let Some(id) = agent.server_id().cloned() else {
            return Err(ProvisionerError::illegal_state(format!(
                "{} is booting without a server id",
                agent.node_name()
            )));
        };
        let id = &id;

        let result = self
            .retry
            .run("get_server", move || self.call(self.provider.get_server(id)))
            .await;

        match result {
            Ok(info) if info.is_reachable() => {
                let now = self.clock.now();
                let connect_deadline = match agent.template().connect_timeout() {
                    Some(timeout) => now
                        .checked_add_signed(timeout)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    None => agent.deadline_at(),
                };
                let address = info.address.unwrap_or_default();
                info!(node = %agent.node_name(), server_id = %id, %address, "Server reachable");
                agent.record_address(address, connect_deadline);
                self.move_to(agent, AgentState::Connecting)
            }
            Ok(info) => {
                debug!(node = %agent.node_name(), server_id = %id, status = %info.status, "Still booting");
                Ok(false)
            }
            Err(ProviderError::NotFound(_)) => {
                warn!(node = %agent.node_name(), server_id = %id, "Server vanished while booting");
                self.move_to(agent, AgentState::Gone)
            }
            Err(e) => {
                warn!(node = %agent.node_name(), server_id = %id, error = %e, "Boot poll failed");
                Ok(false)
            }
        }
    }

    /// CONNECTING: bootstrap the remote shell
    async fn connect(&self, agent: &mut Agent) -> Result<bool> {
        let Some(address) = agent.address() else {
            return Err(ProvisionerError::illegal_state(format!(
                "{} is connecting without an address",
                agent.node_name()
            )));
        };
        let endpoint = agent.template().connector().endpoint(address);
        let deadline = agent.connect_deadline_at();
        let budget = remaining(deadline, self.clock.now());

        debug!(node = %agent.node_name(), %endpoint, budget_ms = budget.as_millis() as u64, "Connecting");

        let attempt = tokio::time::timeout(
            budget,
            self.connector.connect(&endpoint, &agent.account().credentials),
        )
        .await;

        match attempt {
            Ok(Ok(channel)) => {
                info!(node = %agent.node_name(), %endpoint, remote = %channel.remote_id(), "Connected");
                agent.attach_channel(channel);
                agent.touch(self.clock.now());
                self.move_to(agent, AgentState::Ready)
            }
            Ok(Err(e)) if e.is_retryable() => {
                debug!(node = %agent.node_name(), %endpoint, error = %e, "Connect not possible yet");
                Ok(false)
            }
            Ok(Err(e)) => {
                warn!(node = %agent.node_name(), %endpoint, error = %e, "Connect failed");
                self.fail(agent, FailureReason::ConnectFailed(e.to_string()))
            }
            Err(_) => {
                if self.clock.now() > deadline {
                    return self.fail(agent, FailureReason::ConnectTimeout);
                }
                debug!(node = %agent.node_name(), %endpoint, "Connect attempt timed out");
                Ok(false)
            }
        }
    }

    /// RETIRING: delete the server, then GONE
    async fn delete(&self, agent: &mut Agent) -> Result<bool> {
        agent.detach_channel();

        if let Some(id) = agent.server_id().cloned() {
            // A failed agent gets a single attempt; leftovers are reconciled.
            let policy = if agent.failure().is_some() {
                RetryPolicy::no_retry()
            } else {
                self.retry.clone()
            };
            let id = &id;

            match policy
                .run("delete_server", move || self.call(self.provider.delete_server(id)))
                .await
            {
                Ok(()) | Err(ProviderError::NotFound(_)) => {
                    info!(node = %agent.node_name(), server_id = %id, "Server deleted");
                }
                Err(e) => {
                    warn!(
                        node = %agent.node_name(),
                        server_id = %id,
                        error = %e,
                        "Server delete failed, leaving it to orphan reconciliation"
                    );
                }
            }
        }

        self.move_to(agent, AgentState::Gone)
    }

    /// Record a job on a READY or IDLE agent
    pub fn assign_job(&self, agent: &mut Agent) -> Result<()> {
        let now = self.clock.now();
        match agent.state() {
            AgentState::Ready => {
                agent.job_started(now);
                Ok(())
            }
            AgentState::Idle => {
                agent.job_started(now);
                agent.transition(AgentState::Ready, now)
            }
            state => Err(ProvisionerError::AgentUnavailable {
                node: agent.node_name().to_string(),
                state,
            }),
        }
    }

    /// Record the end of a job
    pub fn finish_job(&self, agent: &mut Agent) {
        agent.job_finished(self.clock.now());
    }

    /// Move a live agent to RETIRING without touching the provider.
    ///
    /// Returns `false` if the agent is already winding down.
    pub fn request_retire(&self, agent: &mut Agent) -> Result<bool> {
        if agent.state().is_winding_down() {
            return Ok(false);
        }
        self.move_to(agent, AgentState::Retiring)
    }

    fn move_to(&self, agent: &mut Agent, to: AgentState) -> Result<bool> {
        agent.transition(to, self.clock.now())?;
        Ok(true)
    }

    fn fail(&self, agent: &mut Agent, reason: FailureReason) -> Result<bool> {
        warn!(node = %agent.node_name(), %reason, "Agent failed");
        agent.record_failure(reason);
        self.move_to(agent, AgentState::Failed)
    }

    /// Bound a provider call by the call timeout
    pub(crate) async fn call<T>(
        &self,
        fut: impl Future<Output = ProviderResult<T>>,
    ) -> ProviderResult<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::transient(format!(
                "{} call timed out after {:?}",
                self.provider.name(),
                self.call_timeout
            ))),
        }
    }
}

/// READY agent with no running jobs whose keep-around period has passed
fn idle_expired(agent: &Agent, now: DateTime<Utc>) -> bool {
    if agent.running_jobs() > 0 {
        return false;
    }
    let keep_around = agent.template().keep_around();
    if keep_around.is_zero() {
        return true;
    }
    now.signed_duration_since(agent.last_activity_at()) > keep_around
}

/// Time left until `deadline`, zero if already past
fn remaining(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}
