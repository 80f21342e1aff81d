//! In-memory provider, connector and clock for tests

use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use stratus_core::{
    Channel, ConnectError, Connector, Credentials, ProviderClient, ProviderError, ProviderResult,
    ServerId, ServerInfo, ServerSpec, ServerStatus,
};
use tokio::sync::Notify;

/// Manually advanced clock
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Provider call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub create: u32,
    pub get: u32,
    pub delete: u32,
    pub list: u32,
}

/// Pauses `create_server` until released
#[derive(Clone, Default)]
pub struct CreateGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
struct MockState {
    servers: BTreeMap<ServerId, ServerInfo>,
    polls: BTreeMap<ServerId, u32>,
    next_id: u64,
    boot_polls: u32,
    create_errors: VecDeque<ProviderError>,
    get_errors: VecDeque<ProviderError>,
    delete_errors: VecDeque<ProviderError>,
    list_errors: VecDeque<ProviderError>,
    calls: Calls,
    deleted: Vec<ServerId>,
    in_flight: HashSet<String>,
    overlapping_calls: u32,
    hang_gets: bool,
    gate: Option<CreateGate>,
}

/// In-memory cloud: servers boot after a configurable number of polls
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_id: 100,
                boot_polls: 1,
                ..Default::default()
            }),
        }
    }

    /// Number of `get_server` polls before a server reports running
    pub fn set_boot_polls(&self, polls: u32) {
        self.state.lock().unwrap().boot_polls = polls;
    }

    pub fn fail_next_create(&self, err: ProviderError) {
        self.state.lock().unwrap().create_errors.push_back(err);
    }

    pub fn fail_next_get(&self, err: ProviderError) {
        self.state.lock().unwrap().get_errors.push_back(err);
    }

    pub fn fail_next_delete(&self, err: ProviderError) {
        self.state.lock().unwrap().delete_errors.push_back(err);
    }

    pub fn fail_next_list(&self, err: ProviderError) {
        self.state.lock().unwrap().list_errors.push_back(err);
    }

    /// Make every `get_server` call hang forever
    pub fn hang_gets(&self) {
        self.state.lock().unwrap().hang_gets = true;
    }

    /// Hold every `create_server` call until `release` is notified
    pub fn gate_creates(&self) -> CreateGate {
        let gate = CreateGate::default();
        self.state.lock().unwrap().gate = Some(gate.clone());
        gate
    }

    /// Add a server that no agent knows about
    pub fn insert_server(&self, info: ServerInfo) {
        self.state.lock().unwrap().servers.insert(info.id.clone(), info);
    }

    /// Delete a server behind the provisioner's back
    pub fn vanish(&self, id: &ServerId) {
        self.state.lock().unwrap().servers.remove(id);
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().unwrap().calls
    }

    pub fn deleted(&self) -> Vec<ServerId> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn server_count(&self) -> usize {
        self.state.lock().unwrap().servers.len()
    }

    /// Calls issued for a server while another call for it was in flight
    pub fn overlapping_calls(&self) -> u32 {
        self.state.lock().unwrap().overlapping_calls
    }

    fn enter(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if !state.in_flight.insert(key.to_string()) {
            state.overlapping_calls += 1;
        }
    }

    fn leave(&self, key: &str) {
        self.state.lock().unwrap().in_flight.remove(key);
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_server(&self, spec: &ServerSpec) -> ProviderResult<ServerInfo> {
        self.enter(&spec.name);
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.calls.create += 1;
            state.gate.clone()
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let result = {
            let mut state = self.state.lock().unwrap();
            match state.create_errors.pop_front() {
                Some(err) => Err(err),
                None => {
                    state.next_id += 1;
                    let info = ServerInfo {
                        id: ServerId::new(state.next_id.to_string()),
                        name: spec.name.clone(),
                        status: ServerStatus::Initializing,
                        address: None,
                        labels: spec.labels.clone(),
                    };
                    state.servers.insert(info.id.clone(), info.clone());
                    Ok(info)
                }
            }
        };
        self.leave(&spec.name);
        result
    }

    async fn get_server(&self, id: &ServerId) -> ProviderResult<ServerInfo> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.calls.get += 1;
            state.hang_gets
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.get_errors.pop_front() {
            return Err(err);
        }
        let boot_polls = state.boot_polls;
        let polls = {
            let polls = state.polls.entry(id.clone()).or_insert(0);
            *polls += 1;
            *polls
        };
        let server = state
            .servers
            .get_mut(id)
            .ok_or_else(|| ProviderError::not_found(id.to_string()))?;
        if polls >= boot_polls {
            server.status = ServerStatus::Running;
            server.address = Some(format!("10.0.0.{}", id));
        } else {
            server.status = ServerStatus::Starting;
        }
        Ok(server.clone())
    }

    async fn delete_server(&self, id: &ServerId) -> ProviderResult<()> {
        self.enter(id.as_str());
        let result = {
            let mut state = self.state.lock().unwrap();
            state.calls.delete += 1;
            state.deleted.push(id.clone());
            match state.delete_errors.pop_front() {
                Some(err) => Err(err),
                None => {
                    state.servers.remove(id);
                    Ok(())
                }
            }
        };
        self.leave(id.as_str());
        result
    }

    async fn list_servers(&self) -> ProviderResult<Vec<ServerInfo>> {
        let mut state = self.state.lock().unwrap();
        state.calls.list += 1;
        if let Some(err) = state.list_errors.pop_front() {
            return Err(err);
        }
        Ok(state.servers.values().cloned().collect())
    }
}

/// Channel handed out by [`MockConnector`]
#[derive(Debug)]
pub struct MockChannel {
    peer: String,
}

impl Channel for MockChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn remote_id(&self) -> &str {
        "SSH-2.0-mock"
    }
}

/// Connector that succeeds unless told otherwise
pub struct MockConnector {
    errors: Mutex<VecDeque<ConnectError>>,
    always: Mutex<Option<ConnectError>>,
    calls: AtomicU32,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            errors: Mutex::new(VecDeque::new()),
            always: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, err: ConnectError) {
        self.errors.lock().unwrap().push_back(err);
    }

    pub fn fail_always(&self, err: ConnectError) {
        *self.always.lock().unwrap() = Some(err);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        address: &str,
        _credentials: &Credentials,
    ) -> Result<Box<dyn Channel>, ConnectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.always.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(Box::new(MockChannel {
            peer: address.to_string(),
        }))
    }
}
