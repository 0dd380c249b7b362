//! Initial provisioning and teardown of project databases.
//!
//! ```text
//! pending -> provisioning -> ready | error
//! ready | error -> deleting -> deleted
//! ```
//!
//! Entering `provisioning` or `deleting` is a compare-and-set, which makes
//! the caller the only writer of the project until it leaves that state.

use std::fmt::Display;
use std::sync::Arc;

use pgfleet_id::ProjectId;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::error::{OrchestratorError, OrchestratorResult, PoolError};
use crate::model::{DatabaseCredentials, Project};
use crate::plans::{Plan, PlanTier, PoolType};
use crate::pool::{ClusterPool, TenantDatabase};
use crate::provider::create_dedicated;
use crate::status::{ClusterStatus, ProvisionStatus};
use crate::store::Store;

/// Cluster re-selections after a lost placement race.
const MAX_PLACEMENT_ATTEMPTS: usize = 3;

/// What a caller gets back from a provisioning request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionOutcome {
    pub status: ProvisionStatus,
    /// The database is not usable yet; poll the status until it is.
    pub needs_polling: bool,
    pub credentials: Option<DatabaseCredentials>,
}

impl ProvisionOutcome {
    pub fn from_project(project: &Project) -> Self {
        Self {
            status: project.provision_status,
            needs_polling: project.provision_status.is_transient(),
            credentials: project.credentials.clone(),
        }
    }
}

/// Move a project to `error` after a failed operation.
///
/// Only leaves transient states, so a concurrent operation that already
/// finished is not overwritten.
pub(crate) async fn persist_error(
    store: &dyn Store,
    project_id: ProjectId,
    cause: &(dyn Display + Sync),
) {
    error!(project_id = %project_id, error = %cause, "Operation failed; marking project error");
    let transient = [
        ProvisionStatus::Provisioning,
        ProvisionStatus::Upgrading,
        ProvisionStatus::Deleting,
    ];
    if let Err(e) = store
        .transition_status(project_id, &transient, ProvisionStatus::Error)
        .await
    {
        error!(project_id = %project_id, error = %e, "Failed to persist error status");
    }
}

/// Reject with the project's current status.
pub(crate) async fn conflict(store: &dyn Store, project_id: ProjectId) -> OrchestratorError {
    match store.get_project(project_id).await {
        Ok(project) => OrchestratorError::Conflict {
            project_id,
            current: project.provision_status,
        },
        Err(e) => e.into(),
    }
}

pub struct Provisioner {
    pool: Arc<ClusterPool>,
}

impl Provisioner {
    pub fn new(pool: Arc<ClusterPool>) -> Self {
        Self { pool }
    }

    fn store(&self) -> &dyn Store {
        self.pool.store().as_ref()
    }

    pub fn plan(&self, plan_id: &str) -> OrchestratorResult<Plan> {
        self.pool
            .catalog()
            .get(plan_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownPlan(plan_id.to_string()))
    }

    /// Take the project into `provisioning`.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn begin_provision(&self, project_id: ProjectId) -> OrchestratorResult<Project> {
        let moved = self
            .store()
            .transition_status(
                project_id,
                &[ProvisionStatus::Pending, ProvisionStatus::Error],
                ProvisionStatus::Provisioning,
            )
            .await?;
        if !moved {
            return Err(conflict(self.store(), project_id).await);
        }
        Ok(self.store().get_project(project_id).await?)
    }

    /// Create the project's database on `plan`.
    ///
    /// The project must already be `provisioning`. Any failure is persisted
    /// as `error` before it is returned.
    #[instrument(skip_all, fields(project_id = %project.id, plan = %plan.id))]
    pub async fn provision_for_plan(
        &self,
        project: &Project,
        plan: &Plan,
    ) -> OrchestratorResult<ProvisionOutcome> {
        let result = match plan.tier() {
            PlanTier::Shared(pool_type) => self.provision_shared(project, plan, pool_type).await,
            PlanTier::Dedicated => self.provision_dedicated(project, plan).await,
        };

        match result {
            Ok(outcome) => {
                info!(status = %outcome.status, needs_polling = outcome.needs_polling, "Provisioning step complete");
                Ok(outcome)
            }
            Err(e) => {
                persist_error(self.store(), project.id, &e).await;
                Err(e)
            }
        }
    }

    async fn provision_shared(
        &self,
        project: &Project,
        plan: &Plan,
        pool_type: PoolType,
    ) -> OrchestratorResult<ProvisionOutcome> {
        let mut project = project.clone();
        project.clear_binding();
        project.apply_plan(plan);

        let mut attempt = 0;
        let tenant = loop {
            attempt += 1;
            let cluster = self
                .pool
                .ensure_available_cluster(&project.region, pool_type)
                .await?;

            if cluster.status == ClusterStatus::Provisioning {
                // Bound without a database; the reconciler finishes once the cluster boots.
                project.shared_cluster_id = Some(cluster.id);
                project.provision_status = ProvisionStatus::Provisioning;
                self.store().update_project(&project).await?;
                info!(cluster_id = %cluster.id, "Shared cluster still booting; deferring database");
                return Ok(ProvisionOutcome::from_project(&project));
            }

            match self.pool.add_database_to_cluster(cluster.id, &project.slug).await {
                Ok(tenant) => break tenant,
                Err(e) if e.is_retryable_placement() && attempt < MAX_PLACEMENT_ATTEMPTS => {
                    warn!(cluster_id = %cluster.id, error = %e, attempt, "Placement lost; selecting another cluster");
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.bind_tenant(project, tenant).await
    }

    async fn bind_tenant(
        &self,
        mut project: Project,
        tenant: TenantDatabase,
    ) -> OrchestratorResult<ProvisionOutcome> {
        project.shared_cluster_id = Some(tenant.cluster_id);
        project.shared_db_id = Some(tenant.db_id);
        project.credentials = Some(tenant.credentials);
        project.provision_status = ProvisionStatus::Ready;

        if let Err(e) = self.store().update_project(&project).await {
            if let Err(cleanup) = self
                .pool
                .remove_database_from_cluster(tenant.cluster_id, tenant.db_id)
                .await
            {
                error!(db_id = tenant.db_id, error = %cleanup, "Failed to remove unrecorded tenant database");
            }
            return Err(e.into());
        }
        Ok(ProvisionOutcome::from_project(&project))
    }

    async fn provision_dedicated(
        &self,
        project: &Project,
        plan: &Plan,
    ) -> OrchestratorResult<ProvisionOutcome> {
        let provider = self.pool.provider();
        let instance =
            create_dedicated(provider.as_ref(), &project.slug, &project.region, plan.preset_id)
                .await?;

        let mut project = project.clone();
        project.clear_binding();
        project.apply_plan(plan);
        project.external_ref = Some(instance.external_ref);
        project.preset_id = Some(plan.preset_id);
        project.credentials = Some(instance.credentials);
        // Anything short of ready or failed is still being set up.
        project.provision_status = match instance.status {
            ProvisionStatus::Ready => ProvisionStatus::Ready,
            ProvisionStatus::Error => ProvisionStatus::Error,
            _ => ProvisionStatus::Provisioning,
        };

        if let Err(e) = self.store().update_project(&project).await {
            let cluster_id = instance.external_ref.cluster_id;
            if let Err(cleanup) = provider.delete_cluster(cluster_id).await {
                error!(cluster_id, error = %cleanup, "Failed to delete unrecorded dedicated cluster");
            }
            return Err(e.into());
        }
        Ok(ProvisionOutcome::from_project(&project))
    }

    /// Validate a provisioning request and claim the project.
    pub async fn prepare(
        &self,
        project_id: ProjectId,
        plan_id: &str,
    ) -> OrchestratorResult<(Project, Plan)> {
        let plan = self.plan(plan_id)?;
        let current = self.store().get_project(project_id).await?;
        if current.shared_db_id.is_some() || current.external_ref.is_some() {
            // The project already owns a database.
            return Err(OrchestratorError::Conflict {
                project_id,
                current: current.provision_status,
            });
        }

        let project = self.begin_provision(project_id).await?;
        Ok((project, plan))
    }

    /// Load, validate, claim and provision a project in one call.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn provision(
        &self,
        project_id: ProjectId,
        plan_id: &str,
    ) -> OrchestratorResult<ProvisionOutcome> {
        let (project, plan) = self.prepare(project_id, plan_id).await?;
        self.provision_for_plan(&project, &plan).await
    }

    /// Release the project's database and mark it `deleted`.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn deprovision(&self, project_id: ProjectId) -> OrchestratorResult<ProvisionStatus> {
        self.begin_deprovision(project_id).await?;
        self.run_deprovision(project_id).await
    }

    pub async fn begin_deprovision(&self, project_id: ProjectId) -> OrchestratorResult<()> {
        let moved = self
            .store()
            .transition_status(
                project_id,
                &[ProvisionStatus::Ready, ProvisionStatus::Error],
                ProvisionStatus::Deleting,
            )
            .await?;
        if !moved {
            return Err(conflict(self.store(), project_id).await);
        }
        Ok(())
    }

    /// Teardown of a project already in `deleting`.
    pub async fn run_deprovision(&self, project_id: ProjectId) -> OrchestratorResult<ProvisionStatus> {
        match self.release_resources(project_id).await {
            Ok(()) => {
                info!("Project deprovisioned");
                Ok(ProvisionStatus::Deleted)
            }
            Err(e) => {
                persist_error(self.store(), project_id, &e).await;
                Err(e)
            }
        }
    }

    async fn release_resources(&self, project_id: ProjectId) -> OrchestratorResult<()> {
        let mut project = self.store().get_project(project_id).await?;

        if let (Some(cluster_id), Some(db_id)) = (project.shared_cluster_id, project.shared_db_id) {
            match self.pool.remove_database_from_cluster(cluster_id, db_id).await {
                Ok(()) => {}
                Err(PoolError::ClusterNotFound(_)) => {
                    warn!(cluster_id = %cluster_id, "Shared cluster already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(external_ref) = project.external_ref {
            match self.pool.provider().delete_cluster(external_ref.cluster_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(external_ref = %external_ref, "Dedicated cluster already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        project.clear_binding();
        project.provision_status = ProvisionStatus::Deleted;
        self.store().update_project(&project).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockOp;
    use crate::test_support::Harness;

    fn provisioner(h: &Harness) -> Provisioner {
        Provisioner::new(h.pool.clone())
    }

    #[tokio::test]
    async fn test_free_project_on_fresh_region_gets_ready_database() {
        let h = Harness::new();
        let project = h.project("acme", "free").await;

        let outcome = provisioner(&h).provision(project.id, "free").await.unwrap();

        assert_eq!(outcome.status, ProvisionStatus::Ready);
        assert!(!outcome.needs_polling);
        let creds = outcome.credentials.unwrap();
        assert_eq!(creds.name, "acme");

        let stored = h.store.get_project(project.id).await.unwrap();
        let cluster = h.store.get_cluster(stored.shared_cluster_id.unwrap()).await.unwrap();
        assert_eq!(cluster.db_count, 1);
        assert!(stored.shared_db_id.is_some());
        assert!(stored.external_ref.is_none());
    }

    #[tokio::test]
    async fn test_shared_projects_fill_clusters_before_creating_new_ones() {
        let h = Harness::with_capacity(2);
        let p = provisioner(&h);

        for slug in ["a", "b", "c"] {
            let project = h.project(slug, "free").await;
            p.provision(project.id, "free").await.unwrap();
        }

        let clusters = h.store.list_clusters().await.unwrap();
        assert_eq!(clusters.len(), 2);
        let mut counts: Vec<_> = clusters.iter().map(|c| c.db_count).collect();
        counts.sort();
        assert_eq!(counts, vec![1, 2]);
        assert_eq!(h.provider.calls(MockOp::CreateCluster), 2);
    }

    #[tokio::test]
    async fn test_booting_cluster_defers_database() {
        let h = Harness::new();
        h.provider.set_initial_status("starting");
        let project = h.project("acme", "starter").await;

        let outcome = provisioner(&h).provision(project.id, "starter").await.unwrap();

        assert_eq!(outcome.status, ProvisionStatus::Provisioning);
        assert!(outcome.needs_polling);
        assert!(outcome.credentials.is_none());
        let stored = h.store.get_project(project.id).await.unwrap();
        assert!(stored.shared_cluster_id.is_some());
        assert!(stored.shared_db_id.is_none());
        assert_eq!(h.provider.calls(MockOp::AddDatabase), 0);
    }

    #[tokio::test]
    async fn test_dedicated_plan_creates_own_cluster() {
        let h = Harness::new();
        let project = h.project("acme", "pro").await;

        let outcome = provisioner(&h).provision(project.id, "pro").await.unwrap();

        assert_eq!(outcome.status, ProvisionStatus::Ready);
        let stored = h.store.get_project(project.id).await.unwrap();
        let external_ref = stored.external_ref.unwrap();
        assert_eq!(stored.preset_id, Some(3));
        assert!(stored.shared_cluster_id.is_none());
        assert_eq!(h.provider.preset_of(external_ref.cluster_id), Some(3));
        assert!(h.store.list_clusters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_persists_error() {
        let h = Harness::new();
        h.provider.fail_next(MockOp::CreateCluster, 1);
        let project = h.project("acme", "pro").await;

        let err = provisioner(&h).provision(project.id, "pro").await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Provider(_)));
        let stored = h.store.get_project(project.id).await.unwrap();
        assert_eq!(stored.provision_status, ProvisionStatus::Error);
    }

    #[tokio::test]
    async fn test_errored_project_can_be_provisioned_again() {
        let h = Harness::new();
        h.provider.fail_next(MockOp::AddDatabase, 1);
        let project = h.project("acme", "free").await;
        let p = provisioner(&h);

        p.provision(project.id, "free").await.unwrap_err();
        let cluster = h.store.list_clusters().await.unwrap().remove(0);
        assert_eq!(cluster.db_count, 0);

        let outcome = p.provision(project.id, "free").await.unwrap();
        assert_eq!(outcome.status, ProvisionStatus::Ready);
    }

    #[tokio::test]
    async fn test_concurrent_provision_is_rejected() {
        let h = Harness::new();
        let project = h.project("acme", "free").await;
        let p = provisioner(&h);
        p.begin_provision(project.id).await.unwrap();

        let err = p.provision(project.id, "free").await.unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Conflict {
                current: ProvisionStatus::Provisioning,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_plan_leaves_project_untouched() {
        let h = Harness::new();
        let project = h.project("acme", "free").await;

        let err = provisioner(&h).provision(project.id, "platinum").await.unwrap_err();

        assert!(matches!(err, OrchestratorError::UnknownPlan(_)));
        let stored = h.store.get_project(project.id).await.unwrap();
        assert_eq!(stored.provision_status, ProvisionStatus::Pending);
    }

    #[tokio::test]
    async fn test_deprovision_shared_frees_slot() {
        let h = Harness::new();
        let project = h.project("acme", "free").await;
        let p = provisioner(&h);
        p.provision(project.id, "free").await.unwrap();
        let cluster_id = h.store.get_project(project.id).await.unwrap().shared_cluster_id.unwrap();

        let status = p.deprovision(project.id).await.unwrap();

        assert_eq!(status, ProvisionStatus::Deleted);
        let stored = h.store.get_project(project.id).await.unwrap();
        assert_eq!(stored.provision_status, ProvisionStatus::Deleted);
        assert!(stored.credentials.is_none());
        assert!(stored.shared_cluster_id.is_none());
        assert_eq!(h.store.get_cluster(cluster_id).await.unwrap().db_count, 0);
    }

    #[tokio::test]
    async fn test_deprovision_dedicated_deletes_cluster() {
        let h = Harness::new();
        let project = h.project("acme", "business").await;
        let p = provisioner(&h);
        p.provision(project.id, "business").await.unwrap();
        assert_eq!(h.provider.cluster_count(), 1);

        p.deprovision(project.id).await.unwrap();

        assert_eq!(h.provider.cluster_count(), 0);
    }

    #[tokio::test]
    async fn test_deprovision_requires_settled_project() {
        let h = Harness::new();
        let project = h.project("acme", "free").await;

        let err = provisioner(&h).deprovision(project.id).await.unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Conflict {
                current: ProvisionStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_project() {
        let h = Harness::new();
        let err = provisioner(&h)
            .provision(ProjectId::new(), "free")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ProjectNotFound(_)));
    }
}
