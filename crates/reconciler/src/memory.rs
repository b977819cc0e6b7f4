//! In-memory implementations of the remote boundaries.
//!
//! [`InMemoryBackendServices`] behaves like the compute API for backend
//! services: it assigns self-links, fingerprints, and creation timestamps,
//! rejects stale fingerprints, and can be told to fail calls or to keep a
//! deleted resource visible for a number of reads. [`InMemoryReferenceStore`]
//! holds the health checks and instance groups services point at.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::debug;

use crate::client::{ApiError, BackendServiceClient, WriteOutcome};
use crate::diff::ServicePatch;
use crate::resolver::{ReferenceStore, ResourceRecord};
use crate::types::{
    Backend, BalancingMode, HTTP_HEALTH_CHECK_KIND, INSTANCE_GROUP, INSTANCE_GROUP_MANAGER_KIND,
    ObservedState, ResolvedState, SELF_LINK,
};

const COMPUTE_BASE: &str = "https://www.googleapis.com/compute/v1/projects";
const DEFAULT_PORT_NAME: &str = "http";
const DEFAULT_TIMEOUT_SEC: u32 = 30;

/// A client operation, for fault injection and the call journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientOp {
    Get,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ClientOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "get"),
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One recorded client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: ClientOp,
    pub name: String,
}

#[derive(Debug, Default)]
struct State {
    services: BTreeMap<String, ObservedState>,
    /// Deleted services still served by `get`, with reads remaining.
    lingering: HashMap<String, (ObservedState, u32)>,
    faults: HashMap<ClientOp, VecDeque<ApiError>>,
    /// Read failures armed by the next successful delete.
    post_delete_faults: Vec<ApiError>,
    calls: Vec<Call>,
    generation: u64,
    accepted_writes: bool,
    delete_visibility: u32,
    latency: Option<Duration>,
}

impl State {
    fn record(&mut self, op: ClientOp, name: &str) -> Result<(), ApiError> {
        self.calls.push(Call {
            op,
            name: name.to_string(),
        });
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(fault) => {
                debug!(op = %op, name = %name, error = %fault, "Injected fault");
                Err(fault)
            }
            None => Ok(()),
        }
    }

    fn next_fingerprint(&mut self, observed: &ObservedState) -> String {
        self.generation = self.generation.wrapping_add(1);
        let mut hasher = Sha256::new();
        hasher.update(self.generation.to_be_bytes());
        hasher.update(serde_json::to_vec(observed).unwrap_or_default());
        let digest = format!("{:x}", hasher.finalize());
        digest.chars().take(16).collect()
    }

    fn write_outcome(&self, observed: &ObservedState) -> WriteOutcome {
        if self.accepted_writes {
            WriteOutcome::Accepted
        } else {
            WriteOutcome::Observed(Box::new(observed.clone()))
        }
    }
}

/// Fill the balancing parameters the API defaults when omitted.
fn with_server_defaults(backend: &Backend<String>) -> Backend<String> {
    let mut backend = backend.clone();
    backend.balancing_mode.get_or_insert(BalancingMode::Utilization);
    backend.capacity_scaler.get_or_insert(1.0);
    if backend.balancing_mode == Some(BalancingMode::Utilization) {
        backend.max_utilization.get_or_insert(0.8);
    }
    backend
}

/// In-process stand-in for the backend services API of one project.
#[derive(Debug)]
pub struct InMemoryBackendServices {
    project: String,
    state: Mutex<State>,
}

impl InMemoryBackendServices {
    /// Create an empty project.
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Make writes return only an acknowledgement, like an operation handle.
    #[must_use]
    pub fn with_accepted_writes(mut self) -> Self {
        self.state.get_mut().accepted_writes = true;
        self
    }

    /// Keep deleted services visible for `reads` further `get` calls.
    #[must_use]
    pub fn with_delete_visibility(mut self, reads: u32) -> Self {
        self.state.get_mut().delete_visibility = reads;
        self
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.state.get_mut().latency = Some(latency);
        self
    }

    /// The canonical URL of a service in this project.
    pub fn self_link(&self, name: &str, region: Option<&str>) -> String {
        match region {
            Some(region) => format!(
                "{COMPUTE_BASE}/{}/regions/{region}/backendServices/{name}",
                self.project
            ),
            None => format!("{COMPUTE_BASE}/{}/global/backendServices/{name}", self.project),
        }
    }

    /// Queue a failure for the next call of `op`.
    pub async fn fail_next(&self, op: ClientOp, error: ApiError) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Fail the first `reads` gets after the next successful delete.
    pub async fn fail_reads_after_delete(&self, reads: usize, error: ApiError) {
        self.state
            .lock()
            .await
            .post_delete_faults
            .extend(std::iter::repeat_n(error, reads));
    }

    /// Create a service directly, bypassing fault injection and the journal.
    pub async fn seed(&self, desired: ResolvedState) -> ObservedState {
        let mut state = self.state.lock().await;
        let observed = self.materialize(&mut state, &desired);
        state.services.insert(observed.name.clone(), observed.clone());
        observed
    }

    /// Change a service as another writer would, bumping its fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] when the service does not exist.
    pub async fn modify_out_of_band<F>(&self, name: &str, f: F) -> Result<ObservedState, ApiError>
    where
        F: FnOnce(&mut ObservedState),
    {
        let mut state = self.state.lock().await;
        let mut observed = state
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::not_found(name))?;
        f(&mut observed);
        observed.fingerprint = state.next_fingerprint(&observed);
        state.services.insert(name.to_string(), observed.clone());
        Ok(observed)
    }

    /// Current services, keyed by name.
    pub async fn services(&self) -> BTreeMap<String, ObservedState> {
        self.state.lock().await.services.clone()
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    /// Number of calls of `op` made so far.
    pub async fn count(&self, op: ClientOp) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    /// Forget the call journal.
    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    fn materialize(&self, state: &mut State, desired: &ResolvedState) -> ObservedState {
        let mut observed = ObservedState {
            name: desired.name.clone(),
            description: desired.description.clone().unwrap_or_default(),
            port_name: desired
                .port_name
                .clone()
                .unwrap_or_else(|| DEFAULT_PORT_NAME.to_string()),
            protocol: desired.protocol.unwrap_or_default(),
            timeout_sec: desired.timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SEC),
            enable_cdn: desired.enable_cdn.unwrap_or(false),
            region: desired.region.clone(),
            backends: desired
                .backends
                .iter()
                .flatten()
                .map(with_server_defaults)
                .collect(),
            health_checks: desired.health_checks.clone(),
            creation_timestamp: Utc::now(),
            fingerprint: String::new(),
            self_link: self.self_link(&desired.name, desired.region.as_deref()),
        };
        observed.fingerprint = state.next_fingerprint(&observed);
        observed
    }

    async fn enter(&self, op: ClientOp, name: &str) -> Result<MutexGuard<'_, State>, ApiError> {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().await;
        state.record(op, name)?;
        Ok(state)
    }
}

#[async_trait]
impl BackendServiceClient for InMemoryBackendServices {
    async fn get(&self, name: &str) -> Result<ObservedState, ApiError> {
        let mut state = self.enter(ClientOp::Get, name).await?;

        if let Some((observed, reads)) = state.lingering.get_mut(name) {
            let observed = observed.clone();
            *reads = reads.saturating_sub(1);
            if *reads == 0 {
                state.lingering.remove(name);
            }
            return Ok(observed);
        }

        state
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::not_found(name))
    }

    async fn insert(&self, desired: &ResolvedState) -> Result<WriteOutcome, ApiError> {
        let mut state = self.enter(ClientOp::Insert, &desired.name).await?;

        if state.services.contains_key(&desired.name) {
            return Err(ApiError::conflict(format!(
                "backend service '{}' already exists",
                desired.name
            )));
        }
        if desired.health_checks.is_empty() {
            return Err(ApiError::permanent("at least one health check is required"));
        }

        let observed = self.materialize(&mut state, desired);
        state.services.insert(observed.name.clone(), observed.clone());
        Ok(state.write_outcome(&observed))
    }

    async fn update(&self, name: &str, patch: &ServicePatch) -> Result<WriteOutcome, ApiError> {
        let mut state = self.enter(ClientOp::Update, name).await?;

        let mut observed = state
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::not_found(name))?;
        if observed.fingerprint != patch.fingerprint {
            return Err(ApiError::conflict(format!(
                "fingerprint '{}' is stale for '{name}'",
                patch.fingerprint
            )));
        }

        patch.apply_to(&mut observed);
        observed.backends = observed.backends.iter().map(with_server_defaults).collect();
        observed.fingerprint = state.next_fingerprint(&observed);
        state.services.insert(name.to_string(), observed.clone());
        Ok(state.write_outcome(&observed))
    }

    async fn delete(&self, name: &str) -> Result<(), ApiError> {
        let mut state = self.enter(ClientOp::Delete, name).await?;

        let observed = state
            .services
            .remove(name)
            .ok_or_else(|| ApiError::not_found(name))?;
        let armed = std::mem::take(&mut state.post_delete_faults);
        state.faults.entry(ClientOp::Get).or_default().extend(armed);
        if state.delete_visibility > 0 {
            let reads = state.delete_visibility;
            state.lingering.insert(name.to_string(), (observed, reads));
        }
        Ok(())
    }
}

/// In-process store of the resources backend services reference.
#[derive(Debug)]
pub struct InMemoryReferenceStore {
    project: String,
    records: RwLock<Vec<ResourceRecord>>,
    faults: Mutex<VecDeque<ApiError>>,
}

impl InMemoryReferenceStore {
    /// Create an empty store for a project.
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            records: RwLock::new(Vec::new()),
            faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Add a record.
    pub async fn insert(&self, record: ResourceRecord) {
        self.records.write().await.push(record);
    }

    /// Remove every record of `(kind, name)`.
    pub async fn remove(&self, kind: &str, name: &str) {
        self.records
            .write()
            .await
            .retain(|r| !(r.kind == kind && r.name == name));
    }

    /// Queue a failure for the next lookup.
    pub async fn fail_next_lookup(&self, error: ApiError) {
        self.faults.lock().await.push_back(error);
    }

    /// Register an HTTP health check and return its self-link.
    pub async fn add_http_health_check(&self, name: &str) -> String {
        let link = format!(
            "{COMPUTE_BASE}/{}/global/httpHealthChecks/{name}",
            self.project
        );
        self.insert(
            ResourceRecord::new(HTTP_HEALTH_CHECK_KIND, name).with_attribute(SELF_LINK, &link),
        )
        .await;
        link
    }

    /// Register an instance group manager and return its group's URL.
    pub async fn add_instance_group_manager(&self, name: &str, zone: &str) -> String {
        let base = format!("{COMPUTE_BASE}/{}/zones/{zone}", self.project);
        let group = format!("{base}/instanceGroups/{name}");
        self.insert(
            ResourceRecord::new(INSTANCE_GROUP_MANAGER_KIND, name)
                .with_attribute(SELF_LINK, format!("{base}/instanceGroupManagers/{name}"))
                .with_attribute(INSTANCE_GROUP, &group),
        )
        .await;
        group
    }
}

#[async_trait]
impl ReferenceStore for InMemoryReferenceStore {
    async fn lookup(&self, kind: &str, name: &str) -> Result<Vec<ResourceRecord>, ApiError> {
        if let Some(fault) = self.faults.lock().await.pop_front() {
            return Err(fault);
        }
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.kind == kind && r.name == name)
            .cloned()
            .collect())
    }
}
