//! In-memory provider for development and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{
    generate_password, region_to_location, Bucket, BucketSpec, CloudProvider, ClusterSpec,
    Preset, ProviderCluster, ProviderDatabase, ProviderError, ProviderResult,
};
use crate::status::{map_provider_status, ProvisionStatus};

/// Provider operation, used to count calls and inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateCluster,
    GetCluster,
    ResizeCluster,
    DeleteCluster,
    AddDatabase,
    GetDatabase,
    DeleteDatabase,
    ListPresets,
    CreateBucket,
    GetBucket,
    UpdateBucket,
    DeleteBucket,
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Next(usize),
    Always,
}

#[derive(Debug)]
struct MockCluster {
    preset_id: i64,
    login: String,
    password: String,
    /// Raw provider status string.
    status: String,
    /// Statuses returned by successive reads before `status` settles.
    script: VecDeque<String>,
    databases: BTreeMap<i64, String>,
}

#[derive(Debug)]
struct State {
    next_id: i64,
    clusters: HashMap<i64, MockCluster>,
    buckets: HashMap<i64, Bucket>,
    calls: HashMap<MockOp, usize>,
    failures: HashMap<MockOp, Failure>,
    initial_status: String,
    resize_status: String,
    last_cluster_id: Option<i64>,
    hide_passwords: bool,
}

/// Provider that keeps clusters in memory.
///
/// New clusters report `started` unless [`MockProvider::set_initial_status`]
/// says otherwise. Per-cluster status sequences, per-operation failures and
/// call counters make provider behaviour scriptable from tests.
#[derive(Debug)]
pub struct MockProvider {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 100,
                clusters: HashMap::new(),
                buckets: HashMap::new(),
                calls: HashMap::new(),
                failures: HashMap::new(),
                initial_status: "started".to_string(),
                resize_status: "started".to_string(),
                last_cluster_id: None,
                hide_passwords: false,
            }),
            latency: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw status reported by clusters created from now on.
    pub fn set_initial_status(&self, raw: &str) {
        self.state().initial_status = raw.to_string();
    }

    /// Raw status a cluster reports right after a resize.
    pub fn set_resize_status(&self, raw: &str) {
        self.state().resize_status = raw.to_string();
    }

    /// Overwrite the current status of a cluster and drop its script.
    pub fn set_status(&self, cluster_id: i64, raw: &str) {
        if let Some(cluster) = self.state().clusters.get_mut(&cluster_id) {
            cluster.script.clear();
            cluster.status = raw.to_string();
        }
    }

    /// Queue statuses returned by successive reads; the last one sticks.
    pub fn script_status(&self, cluster_id: i64, raw: &[&str]) {
        if let Some(cluster) = self.state().clusters.get_mut(&cluster_id) {
            cluster.script = raw.iter().map(|s| s.to_string()).collect();
        }
    }

    /// Leave the password blank on cluster reads; creation still returns it.
    pub fn hide_passwords_on_read(&self, hide: bool) {
        self.state().hide_passwords = hide;
    }

    /// Fail the next `times` calls of `op` with HTTP 500.
    pub fn fail_next(&self, op: MockOp, times: usize) {
        self.state().failures.insert(op, Failure::Next(times));
    }

    pub fn fail_always(&self, op: MockOp) {
        self.state().failures.insert(op, Failure::Always);
    }

    pub fn clear_failure(&self, op: MockOp) {
        self.state().failures.remove(&op);
    }

    /// Delay every call, so concurrent callers interleave.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }

    pub fn calls(&self, op: MockOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn cluster_count(&self) -> usize {
        self.state().clusters.len()
    }

    pub fn cluster_exists(&self, cluster_id: i64) -> bool {
        self.state().clusters.contains_key(&cluster_id)
    }

    pub fn database_count(&self, cluster_id: i64) -> usize {
        self.state()
            .clusters
            .get(&cluster_id)
            .map(|c| c.databases.len())
            .unwrap_or(0)
    }

    pub fn preset_of(&self, cluster_id: i64) -> Option<i64> {
        self.state().clusters.get(&cluster_id).map(|c| c.preset_id)
    }

    pub fn last_cluster_id(&self) -> Option<i64> {
        self.state().last_cluster_id
    }

    /// Count the call, apply latency and any injected failure.
    async fn enter(&self, op: MockOp) -> ProviderResult<()> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;

        let fail = match state.failures.get(&op).copied() {
            Some(Failure::Always) => true,
            Some(Failure::Next(n)) if n > 0 => {
                if n == 1 {
                    state.failures.remove(&op);
                } else {
                    state.failures.insert(op, Failure::Next(n - 1));
                }
                true
            }
            _ => false,
        };

        if fail {
            debug!(?op, "Injected provider failure");
            return Err(ProviderError::new(Some(500), format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

fn not_found(what: &str, id: i64) -> ProviderError {
    ProviderError::new(Some(404), format!("{what} {id} not found"))
}

fn cluster_view(cluster_id: i64, cluster: &MockCluster) -> ProviderCluster {
    ProviderCluster {
        cluster_id,
        host: format!("c{cluster_id}.mock-db.internal"),
        port: 5432,
        login: cluster.login.clone(),
        password: cluster.password.clone(),
        status: map_provider_status(&cluster.status),
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn create_cluster(&self, spec: &ClusterSpec) -> ProviderResult<ProviderCluster> {
        self.enter(MockOp::CreateCluster).await?;
        let mut state = self.state();
        let cluster_id = state.next_id;
        state.next_id += 1;
        state.last_cluster_id = Some(cluster_id);

        let cluster = MockCluster {
            preset_id: spec.preset_id,
            login: spec.login.clone(),
            password: generate_password(),
            status: state.initial_status.clone(),
            script: VecDeque::new(),
            databases: BTreeMap::new(),
        };
        let view = cluster_view(cluster_id, &cluster);
        state.clusters.insert(cluster_id, cluster);
        debug!(cluster_id, name = %spec.name, "Mock cluster created");
        Ok(view)
    }

    async fn get_cluster(&self, cluster_id: i64) -> ProviderResult<ProviderCluster> {
        self.enter(MockOp::GetCluster).await?;
        let mut state = self.state();
        let cluster = state
            .clusters
            .get_mut(&cluster_id)
            .ok_or_else(|| not_found("cluster", cluster_id))?;
        if let Some(next) = cluster.script.pop_front() {
            cluster.status = next;
        }
        let mut view = cluster_view(cluster_id, cluster);
        if state.hide_passwords {
            view.password.clear();
        }
        Ok(view)
    }

    async fn resize_cluster(&self, cluster_id: i64, preset_id: i64) -> ProviderResult<ProvisionStatus> {
        self.enter(MockOp::ResizeCluster).await?;
        let mut state = self.state();
        let resize_status = state.resize_status.clone();
        let cluster = state
            .clusters
            .get_mut(&cluster_id)
            .ok_or_else(|| not_found("cluster", cluster_id))?;
        cluster.preset_id = preset_id;
        cluster.script.clear();
        cluster.status = resize_status;
        Ok(map_provider_status(&cluster.status))
    }

    async fn delete_cluster(&self, cluster_id: i64) -> ProviderResult<()> {
        self.enter(MockOp::DeleteCluster).await?;
        self.state()
            .clusters
            .remove(&cluster_id)
            .map(|_| ())
            .ok_or_else(|| not_found("cluster", cluster_id))
    }

    async fn add_database(&self, cluster_id: i64, name: &str) -> ProviderResult<ProviderDatabase> {
        self.enter(MockOp::AddDatabase).await?;
        let mut state = self.state();
        let db_id = state.next_id;
        state.next_id += 1;
        let cluster = state
            .clusters
            .get_mut(&cluster_id)
            .ok_or_else(|| not_found("cluster", cluster_id))?;
        cluster.databases.insert(db_id, name.to_string());
        Ok(ProviderDatabase {
            db_id,
            name: name.to_string(),
        })
    }

    async fn get_database(&self, cluster_id: i64, db_id: i64) -> ProviderResult<ProviderDatabase> {
        self.enter(MockOp::GetDatabase).await?;
        let state = self.state();
        state
            .clusters
            .get(&cluster_id)
            .and_then(|c| c.databases.get(&db_id))
            .map(|name| ProviderDatabase {
                db_id,
                name: name.clone(),
            })
            .ok_or_else(|| not_found("database", db_id))
    }

    async fn delete_database(&self, cluster_id: i64, db_id: i64) -> ProviderResult<()> {
        self.enter(MockOp::DeleteDatabase).await?;
        let mut state = self.state();
        state
            .clusters
            .get_mut(&cluster_id)
            .and_then(|c| c.databases.remove(&db_id))
            .map(|_| ())
            .ok_or_else(|| not_found("database", db_id))
    }

    async fn list_presets(&self, region: &str) -> ProviderResult<Vec<Preset>> {
        self.enter(MockOp::ListPresets).await?;
        let location = region_to_location(region).to_string();
        Ok([(1, 1, 1024, 8_192), (2, 2, 2048, 20_480), (3, 4, 8192, 81_920)]
            .into_iter()
            .map(|(id, cpu, ram_mb, disk_mb)| Preset {
                id,
                description: format!("{cpu} vCPU / {ram_mb} MB"),
                disk_mb,
                cpu,
                ram_mb,
                price_monthly: id * 50_000,
                location: location.clone(),
            })
            .collect())
    }

    async fn create_bucket(&self, spec: &BucketSpec) -> ProviderResult<Bucket> {
        self.enter(MockOp::CreateBucket).await?;
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        let bucket = Bucket {
            id,
            name: spec.name.clone(),
            public: spec.public,
            access_key: format!("AK{id}"),
            secret_key: generate_password(),
            endpoint: "https://s3.mock.internal".to_string(),
            used_space: Some(0),
        };
        state.buckets.insert(id, bucket.clone());
        Ok(bucket)
    }

    async fn get_bucket(&self, bucket_id: i64) -> ProviderResult<Bucket> {
        self.enter(MockOp::GetBucket).await?;
        self.state()
            .buckets
            .get(&bucket_id)
            .cloned()
            .ok_or_else(|| not_found("bucket", bucket_id))
    }

    async fn update_bucket(&self, bucket_id: i64, public: bool) -> ProviderResult<()> {
        self.enter(MockOp::UpdateBucket).await?;
        let mut state = self.state();
        let bucket = state
            .buckets
            .get_mut(&bucket_id)
            .ok_or_else(|| not_found("bucket", bucket_id))?;
        bucket.public = public;
        Ok(())
    }

    async fn delete_bucket(&self, bucket_id: i64) -> ProviderResult<()> {
        self.enter(MockOp::DeleteBucket).await?;
        self.state()
            .buckets
            .remove(&bucket_id)
            .map(|_| ())
            .ok_or_else(|| not_found("bucket", bucket_id))
    }
}
