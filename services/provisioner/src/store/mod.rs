//! Persistence boundary for projects, shared clusters and tasks.
//!
//! Every operation that races with other workers is a single conditional
//! write: status transitions are compare-and-set, `db_count` only moves via
//! [`Store::reserve_slot`]/[`Store::release_slot`], and new shared clusters
//! are claimed with [`Store::claim_cluster_slot`] before the provider is
//! called. Callers never read-modify-write those fields.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgfleet_id::{ClusterId, ProjectId, TaskId};
use thiserror::Error;

use crate::model::{DatabaseCredentials, Project, SharedCluster, TaskRecord, TaskState};
use crate::plans::PoolType;
use crate::status::{ClusterStatus, ProvisionStatus};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn project_not_found(id: ProjectId) -> Self {
        Self::NotFound {
            entity: "project",
            id: id.to_string(),
        }
    }

    pub fn cluster_not_found(id: ClusterId) -> Self {
        Self::NotFound {
            entity: "shared cluster",
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Outcome of [`Store::claim_cluster_slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterClaim {
    /// The placeholder was inserted; the caller must create the cluster.
    Claimed(SharedCluster),
    /// Another caller is already creating a cluster for this region and pool.
    Existing(SharedCluster),
}

/// Provider-side details filled into a claimed placeholder.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterAttachment {
    pub external_id: i64,
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub admin_password: String,
}

impl std::fmt::Debug for ClusterAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAttachment")
            .field("external_id", &self.external_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_user", &self.admin_user)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // Projects

    async fn insert_project(&self, project: &Project) -> StoreResult<()>;

    async fn get_project(&self, id: ProjectId) -> StoreResult<Project>;

    /// Overwrite the whole record.
    ///
    /// Only called by the holder of the project's transient status.
    async fn update_project(&self, project: &Project) -> StoreResult<()>;

    /// Set `next` if the current status is one of `expected`.
    ///
    /// Returns `false` when the project is missing or in another status.
    async fn transition_status(
        &self,
        id: ProjectId,
        expected: &[ProvisionStatus],
        next: ProvisionStatus,
    ) -> StoreResult<bool>;

    /// Bind a shared database and mark the project `ready`.
    ///
    /// Succeeds only while the project is `provisioning` and has no database
    /// bound, so concurrent pollers cannot both bind one.
    async fn bind_shared_database(
        &self,
        id: ProjectId,
        cluster_id: ClusterId,
        db_id: i64,
        credentials: &DatabaseCredentials,
    ) -> StoreResult<bool>;

    async fn list_projects_in_status(
        &self,
        statuses: &[ProvisionStatus],
    ) -> StoreResult<Vec<Project>>;

    // Shared clusters

    async fn get_cluster(&self, id: ClusterId) -> StoreResult<SharedCluster>;

    async fn list_clusters(&self) -> StoreResult<Vec<SharedCluster>>;

    /// The `ready` cluster with the highest `db_count` below capacity.
    async fn find_available_cluster(
        &self,
        region: &str,
        pool_type: PoolType,
    ) -> StoreResult<Option<SharedCluster>>;

    /// Insert `placeholder` unless a `provisioning` cluster already exists
    /// for its region and pool; in that case return the newest one.
    async fn claim_cluster_slot(&self, placeholder: &SharedCluster) -> StoreResult<ClusterClaim>;

    /// Record the provider cluster behind a claimed placeholder.
    async fn attach_cluster_resource(
        &self,
        id: ClusterId,
        attachment: &ClusterAttachment,
    ) -> StoreResult<SharedCluster>;

    /// Set `to` if the current status is one of `from`.
    async fn set_cluster_status(
        &self,
        id: ClusterId,
        from: &[ClusterStatus],
        to: ClusterStatus,
    ) -> StoreResult<bool>;

    /// Take one database slot on a `ready` cluster below capacity.
    ///
    /// The cluster flips to `full` when the last slot is taken. Returns the
    /// updated cluster, or `None` if no slot was taken.
    async fn reserve_slot(&self, id: ClusterId) -> StoreResult<Option<SharedCluster>>;

    /// Give back one slot. A `full` cluster becomes `ready` again; a
    /// `draining` one stays draining. Never goes below zero.
    async fn release_slot(&self, id: ClusterId) -> StoreResult<Option<SharedCluster>>;

    async fn delete_cluster(&self, id: ClusterId) -> StoreResult<()>;

    // Tasks

    async fn insert_task(&self, task: &TaskRecord) -> StoreResult<()>;

    /// Record the outcome of a task still marked `running`.
    ///
    /// Returns `false` if the task already left `running` (for example it
    /// was abandoned).
    async fn finish_task(
        &self,
        id: TaskId,
        state: TaskState,
        error: Option<&str>,
    ) -> StoreResult<bool>;

    async fn latest_task_for_project(&self, project_id: ProjectId)
        -> StoreResult<Option<TaskRecord>>;

    /// `running` tasks whose deadline is before `now`.
    async fn stale_tasks(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>>;
}
