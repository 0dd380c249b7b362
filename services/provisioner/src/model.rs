//! Records owned by the provisioner.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use pgfleet_id::{ClusterId, ExternalDbRef, ProjectId, TaskId};
use serde::{Deserialize, Serialize};

use crate::plans::{Plan, PoolType};
use crate::status::{ClusterStatus, ProvisionStatus, UnknownStatus};

/// Connection parameters for one tenant database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseCredentials {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl DatabaseCredentials {
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }

    /// Take the password from `known` when this one came back blank.
    ///
    /// Provider reads may omit the password that was returned at creation.
    pub fn or_known_password(mut self, known: Option<&DatabaseCredentials>) -> Self {
        if self.password.is_empty() {
            if let Some(known) = known {
                self.password = known.password.clone();
            }
        }
        self
    }
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A tenant project and its database binding.
///
/// Once provisioned, exactly one of `shared_cluster_id` and `external_ref`
/// is set. `shared_db_id` is only present together with `shared_cluster_id`
/// and may lag behind it while the shared cluster is still booting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub slug: String,
    pub region: String,
    pub plan_id: String,
    pub provision_status: ProvisionStatus,
    pub shared_cluster_id: Option<ClusterId>,
    pub shared_db_id: Option<i64>,
    pub external_ref: Option<ExternalDbRef>,
    pub preset_id: Option<i64>,
    pub credentials: Option<DatabaseCredentials>,
    pub db_size_mb: i32,
    pub storage_mb: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// A fresh `pending` project on `plan`.
    pub fn new(slug: impl Into<String>, region: impl Into<String>, plan: &Plan) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            slug: slug.into(),
            region: region.into(),
            plan_id: plan.id.clone(),
            provision_status: ProvisionStatus::Pending,
            shared_cluster_id: None,
            shared_db_id: None,
            external_ref: None,
            preset_id: None,
            credentials: None,
            db_size_mb: plan.db_size_mb,
            storage_mb: plan.storage_mb,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared_cluster_id.is_some()
    }

    pub fn is_dedicated(&self) -> bool {
        self.external_ref.is_some()
    }

    /// Copy plan-derived quota fields onto the record.
    pub fn apply_plan(&mut self, plan: &Plan) {
        self.plan_id = plan.id.clone();
        self.db_size_mb = plan.db_size_mb;
        self.storage_mb = plan.storage_mb;
    }

    /// Drop every infrastructure binding and credential.
    pub fn clear_binding(&mut self) {
        self.shared_cluster_id = None;
        self.shared_db_id = None;
        self.external_ref = None;
        self.preset_id = None;
        self.credentials = None;
    }
}

/// One physical cluster hosting many tenant databases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedCluster {
    pub id: ClusterId,
    /// Provider cluster id; `None` only while the creation claim is in flight.
    pub external_id: Option<i64>,
    pub region: String,
    pub pool_type: PoolType,
    pub preset_id: i64,
    pub status: ClusterStatus,
    pub db_count: i32,
    pub max_databases: i32,
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub admin_password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SharedCluster {
    /// A `provisioning` placeholder claimed before the provider is called.
    pub fn claim(
        region: impl Into<String>,
        pool_type: PoolType,
        preset_id: i64,
        max_databases: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ClusterId::new(),
            external_id: None,
            region: region.into(),
            pool_type,
            preset_id,
            status: ClusterStatus::Provisioning,
            db_count: 0,
            max_databases,
            host: String::new(),
            port: 0,
            admin_user: String::new(),
            admin_password: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.db_count < self.max_databases
    }

    /// Credentials for a tenant database on this cluster.
    ///
    /// Shared clusters have one login; tenants are separated by database.
    pub fn credentials_for(&self, db_name: &str) -> DatabaseCredentials {
        DatabaseCredentials {
            host: self.host.clone(),
            port: self.port,
            name: db_name.to_string(),
            user: self.admin_user.clone(),
            password: self.admin_password.clone(),
        }
    }
}

/// Kind of background work tracked by a [`TaskRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Provision,
    Upgrade,
    Deprovision,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Upgrade => "upgrade",
            Self::Deprovision => "deprovision",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(Self::Provision),
            "upgrade" => Ok(Self::Upgrade),
            "deprovision" => Ok(Self::Deprovision),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Durable state of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Succeeded,
    Failed,
    /// The task outlived its deadline without reporting; its process is presumed dead.
    Abandoned,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// In-flight marker for one background operation on a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn start(project_id: ProjectId, kind: TaskKind, max_duration: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            project_id,
            kind,
            state: TaskState::Running,
            error: None,
            started_at: now,
            deadline: now + max_duration,
            finished_at: None,
        }
    }

    /// Still marked running after its deadline.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Running && now > self.deadline
    }
}
