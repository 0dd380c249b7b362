//! Error taxonomy for provisioning operations.

use std::time::Duration;

use pgfleet_id::{ClusterId, ProjectId};
use thiserror::Error;

use crate::provider::ProviderError;
use crate::status::{ClusterStatus, ProvisionStatus};
use crate::store::StoreError;

/// Shared cluster pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The cluster has no free database slot.
    #[error("shared cluster {cluster_id} is at capacity ({max_databases} databases)")]
    Capacity {
        cluster_id: ClusterId,
        max_databases: i32,
    },

    /// The cluster cannot take databases in its current state.
    #[error("shared cluster {cluster_id} is {status}")]
    ClusterNotReady {
        cluster_id: ClusterId,
        status: ClusterStatus,
    },

    #[error("shared cluster not found: {0}")]
    ClusterNotFound(ClusterId),

    /// The plan catalogue has no sizing for the requested pool.
    #[error("no pool configuration for '{0}'")]
    UnknownPool(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for PoolError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound {
                entity: "shared cluster",
                id,
            } => match id.parse() {
                Ok(cluster_id) => Self::ClusterNotFound(cluster_id),
                Err(_) => Self::Store(StoreError::NotFound {
                    entity: "shared cluster",
                    id,
                }),
            },
            other => Self::Store(other),
        }
    }
}

impl PoolError {
    /// Whether picking another cluster may succeed.
    pub fn is_retryable_placement(&self) -> bool {
        matches!(self, Self::Capacity { .. } | Self::ClusterNotReady { .. })
    }
}

/// Failures of the shared-to-dedicated migration and of plan resizes.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The new instance did not become ready within the poll budget.
    #[error("cluster {cluster_id} not ready after {attempts} polls ({elapsed:?})")]
    Timeout {
        cluster_id: i64,
        attempts: u32,
        elapsed: Duration,
    },

    /// Dump or restore failed.
    #[error("data migration failed: {0}")]
    DataMigration(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to run migration tool: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by caller-facing operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    #[error("project not found: {0}")]
    ProjectNotFound(ProjectId),

    /// Another operation holds the project, or it is in the wrong state.
    #[error("project {project_id} is {current}")]
    Conflict {
        project_id: ProjectId,
        current: ProvisionStatus,
    },

    /// The target plan does not rank above the current one.
    #[error("cannot upgrade from '{from}' to '{to}'")]
    InvalidUpgrade { from: String, to: String },

    #[error("upgrade from '{from}' to '{to}' is not supported")]
    UnsupportedTransition { from: String, to: String },

    /// The project has no database binding to operate on.
    #[error("project {0} has no database")]
    NotBound(ProjectId),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity: "project", id } => match id.parse() {
                Ok(project_id) => Self::ProjectNotFound(project_id),
                Err(_) => Self::Store(StoreError::NotFound {
                    entity: "project",
                    id,
                }),
            },
            other => Self::Store(other),
        }
    }
}

impl OrchestratorError {
    /// Whether the request was rejected without touching the project.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownPlan(_)
                | Self::ProjectNotFound(_)
                | Self::Conflict { .. }
                | Self::InvalidUpgrade { .. }
                | Self::UnsupportedTransition { .. }
                | Self::NotBound(_)
        )
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
