//! Plan upgrades.
//!
//! Dedicated projects are resized in place. Shared projects move to a new
//! dedicated cluster through a saga:
//!
//! ```text
//! create cluster -> wait ready -> fetch credentials -> copy data
//!     -> rewrite project -> drop old tenant database
//! ```
//!
//! Any failure before the rewrite deletes the new cluster and leaves the
//! shared binding untouched; the project ends in `error`.

mod dump;

use std::sync::Arc;
use std::time::Duration;

use pgfleet_id::{ExternalDbRef, ProjectId};
use pgfleet_reconcile::{poll_until, ConvergenceStatus, PollPolicy, ReconcileError};
use tracing::{error, info, instrument, warn};

pub use dump::{restore_failed, DataMigrator, NoopMigrator, PgDumpRestore, DEFAULT_COPY_TIMEOUT};

use crate::error::{MigrationError, OrchestratorError, OrchestratorResult};
use crate::model::{DatabaseCredentials, Project};
use crate::plans::{Plan, PlanTier};
use crate::pool::ClusterPool;
use crate::provider::{create_dedicated, dedicated_credentials, DedicatedInstance, ProviderError};
use crate::provisioner::{conflict, persist_error, ProvisionOutcome};
use crate::status::ProvisionStatus;
use crate::store::Store;

/// Timing knobs for upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Readiness polling of a new dedicated cluster.
    pub poll: PollPolicy,
    /// Budget for one dump/restore run.
    pub copy_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            copy_timeout: DEFAULT_COPY_TIMEOUT,
        }
    }
}

/// How a validated upgrade is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePath {
    /// Change the preset of the project's dedicated cluster.
    Resize,
    /// Copy the shared tenant database to a new dedicated cluster.
    Migrate,
}

/// An upgrade that passed validation; the project is `upgrading`.
#[derive(Debug, Clone)]
pub struct PreparedUpgrade {
    pub project: Project,
    pub plan: Plan,
    pub path: UpgradePath,
}

pub struct MigrationEngine {
    pool: Arc<ClusterPool>,
    migrator: Arc<dyn DataMigrator>,
    config: MigrationConfig,
}

impl MigrationEngine {
    pub fn new(
        pool: Arc<ClusterPool>,
        migrator: Arc<dyn DataMigrator>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            pool,
            migrator,
            config,
        }
    }

    fn store(&self) -> &dyn Store {
        self.pool.store().as_ref()
    }

    /// Validate the upgrade and take the project into `upgrading`.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn begin_upgrade(
        &self,
        project_id: ProjectId,
        new_plan_id: &str,
    ) -> OrchestratorResult<PreparedUpgrade> {
        let catalog = self.pool.catalog();
        let plan = catalog
            .get(new_plan_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownPlan(new_plan_id.to_string()))?;
        let project = self.store().get_project(project_id).await?;

        if !catalog.can_upgrade(&project.plan_id, &plan.id) {
            return Err(OrchestratorError::InvalidUpgrade {
                from: project.plan_id,
                to: plan.id,
            });
        }
        if let PlanTier::Shared(_) = plan.tier() {
            return Err(OrchestratorError::UnsupportedTransition {
                from: project.plan_id,
                to: plan.id,
            });
        }

        let path = if project.external_ref.is_some() {
            UpgradePath::Resize
        } else if project.shared_db_id.is_some() {
            UpgradePath::Migrate
        } else if project.provision_status == ProvisionStatus::Ready {
            return Err(OrchestratorError::NotBound(project_id));
        } else {
            return Err(OrchestratorError::Conflict {
                project_id,
                current: project.provision_status,
            });
        };

        let moved = self
            .store()
            .transition_status(
                project_id,
                &[ProvisionStatus::Ready],
                ProvisionStatus::Upgrading,
            )
            .await?;
        if !moved {
            return Err(conflict(self.store(), project_id).await);
        }

        let project = self.store().get_project(project_id).await?;
        info!(from = %project.plan_id, to = %plan.id, ?path, "Upgrade started");
        Ok(PreparedUpgrade {
            project,
            plan,
            path,
        })
    }

    /// Run a prepared upgrade to completion.
    pub async fn run_upgrade(&self, upgrade: PreparedUpgrade) -> OrchestratorResult<ProvisionOutcome> {
        match upgrade.path {
            UpgradePath::Resize => self.resize_dedicated(&upgrade.project, &upgrade.plan).await,
            UpgradePath::Migrate => {
                self.migrate_shared_to_dedicated(&upgrade.project, &upgrade.plan)
                    .await
            }
        }
    }

    /// Validate and perform an upgrade in one call.
    pub async fn upgrade_plan(
        &self,
        project_id: ProjectId,
        new_plan_id: &str,
    ) -> OrchestratorResult<ProvisionOutcome> {
        let upgrade = self.begin_upgrade(project_id, new_plan_id).await?;
        self.run_upgrade(upgrade).await
    }

    /// Move a dedicated cluster to the plan's preset.
    #[instrument(skip_all, fields(project_id = %project.id, plan = %plan.id))]
    pub async fn resize_dedicated(
        &self,
        project: &Project,
        plan: &Plan,
    ) -> OrchestratorResult<ProvisionOutcome> {
        match self.try_resize(project, plan).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                persist_error(self.store(), project.id, &e).await;
                Err(e)
            }
        }
    }

    async fn try_resize(&self, project: &Project, plan: &Plan) -> OrchestratorResult<ProvisionOutcome> {
        let external_ref = project
            .external_ref
            .ok_or(OrchestratorError::NotBound(project.id))?;

        let status = self
            .pool
            .provider()
            .resize_cluster(external_ref.cluster_id, plan.preset_id)
            .await?;

        let mut project = project.clone();
        project.apply_plan(plan);
        project.preset_id = Some(plan.preset_id);
        // The reconciler settles a resize still in progress.
        project.provision_status = match status {
            ProvisionStatus::Ready => ProvisionStatus::Ready,
            ProvisionStatus::Error => ProvisionStatus::Error,
            _ => ProvisionStatus::Upgrading,
        };
        self.store().update_project(&project).await?;

        info!(status = %project.provision_status, "Dedicated cluster resized");
        Ok(ProvisionOutcome::from_project(&project))
    }

    /// Move a shared tenant database to its own cluster.
    ///
    /// The project must be `upgrading`. On failure the new cluster is
    /// deleted, the shared binding is kept, and the project ends in `error`.
    #[instrument(skip_all, fields(project_id = %project.id, plan = %plan.id))]
    pub async fn migrate_shared_to_dedicated(
        &self,
        project: &Project,
        plan: &Plan,
    ) -> OrchestratorResult<ProvisionOutcome> {
        let (Some(cluster_id), Some(db_id), Some(old_credentials)) = (
            project.shared_cluster_id,
            project.shared_db_id,
            project.credentials.as_ref(),
        ) else {
            let e = OrchestratorError::NotBound(project.id);
            persist_error(self.store(), project.id, &e).await;
            return Err(e);
        };

        let provider = self.pool.provider();
        let instance = match create_dedicated(
            provider.as_ref(),
            &project.slug,
            &project.region,
            plan.preset_id,
        )
        .await
        {
            Ok(instance) => instance,
            Err(e) => {
                let e = OrchestratorError::Migration(e.into());
                persist_error(self.store(), project.id, &e).await;
                return Err(e);
            }
        };
        let new_cluster_id = instance.external_ref.cluster_id;
        info!(new_cluster_id, "Dedicated cluster created");

        let migrated = match self
            .move_data(project, plan, old_credentials, &instance)
            .await
        {
            Ok(migrated) => migrated,
            Err(e) => {
                warn!(new_cluster_id, error = %e, "Migration failed; removing new cluster");
                if let Err(cleanup) = provider.delete_cluster(new_cluster_id).await {
                    error!(new_cluster_id, error = %cleanup, "Failed to remove dedicated cluster after failed migration");
                }
                let e = OrchestratorError::Migration(e);
                persist_error(self.store(), project.id, &e).await;
                return Err(e);
            }
        };

        // The project already lives on its new cluster; a leftover tenant
        // database only costs a slot.
        if let Err(e) = self.pool.remove_database_from_cluster(cluster_id, db_id).await {
            error!(cluster_id = %cluster_id, db_id, error = %e, "Failed to remove old shared database");
        }

        info!(external_ref = ?migrated.external_ref, "Project migrated to dedicated cluster");
        Ok(ProvisionOutcome::from_project(&migrated))
    }

    /// Steps that are undone by deleting the new cluster.
    async fn move_data(
        &self,
        project: &Project,
        plan: &Plan,
        old_credentials: &DatabaseCredentials,
        instance: &DedicatedInstance,
    ) -> Result<Project, MigrationError> {
        let external_ref = instance.external_ref;
        self.wait_until_ready(external_ref).await?;

        let provider = self.pool.provider();
        let credentials = dedicated_credentials(provider.as_ref(), external_ref)
            .await?
            .or_known_password(Some(&instance.credentials));

        self.migrator
            .migrate(&old_credentials.connection_url(), &credentials.connection_url())
            .await?;

        let mut migrated = project.clone();
        migrated.clear_binding();
        migrated.apply_plan(plan);
        migrated.external_ref = Some(external_ref);
        migrated.preset_id = Some(plan.preset_id);
        migrated.credentials = Some(credentials);
        migrated.provision_status = ProvisionStatus::Ready;
        self.store().update_project(&migrated).await?;
        Ok(migrated)
    }

    async fn wait_until_ready(&self, external_ref: ExternalDbRef) -> Result<(), MigrationError> {
        let provider = self.pool.provider();
        let cluster_id = external_ref.cluster_id;
        let resource = format!("dedicated cluster {cluster_id}");

        let result = poll_until(&resource, self.config.poll, move || async move {
            Ok::<_, ProviderError>(match provider.get_cluster_status(cluster_id).await? {
                ProvisionStatus::Ready => ConvergenceStatus::Converged,
                ProvisionStatus::Error => ConvergenceStatus::Diverged,
                _ => ConvergenceStatus::Converging,
            })
        })
        .await;

        match result {
            Ok(attempts) => {
                info!(cluster_id, attempts, "Dedicated cluster ready");
                Ok(())
            }
            Err(ReconcileError::Timeout {
                attempts, elapsed, ..
            }) => Err(MigrationError::Timeout {
                cluster_id,
                attempts,
                elapsed,
            }),
            Err(ReconcileError::Diverged { .. }) => Err(ProviderError::new(
                None,
                format!("cluster {cluster_id} failed while starting"),
            )
            .into()),
            Err(ReconcileError::Observe(e)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::provider::MockOp;
    use crate::provisioner::Provisioner;
    use crate::test_support::Harness;

    #[derive(Default)]
    struct ScriptedMigrator {
        fail: bool,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedMigrator {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DataMigrator for ScriptedMigrator {
        async fn migrate(&self, source_url: &str, target_url: &str) -> Result<(), MigrationError> {
            self.calls
                .lock()
                .unwrap()
                .push((source_url.to_string(), target_url.to_string()));
            if self.fail {
                return Err(MigrationError::DataMigration("restore failed".to_string()));
            }
            Ok(())
        }
    }

    fn fast_config() -> MigrationConfig {
        MigrationConfig {
            poll: PollPolicy::new(Duration::from_millis(1), 3),
            copy_timeout: Duration::from_secs(1),
        }
    }

    fn engine(h: &Harness, migrator: Arc<ScriptedMigrator>) -> MigrationEngine {
        MigrationEngine::new(h.pool.clone(), migrator, fast_config())
    }

    async fn provisioned(h: &Harness, slug: &str, plan_id: &str) -> Project {
        let project = h.project(slug, plan_id).await;
        Provisioner::new(h.pool.clone())
            .provision(project.id, plan_id)
            .await
            .unwrap();
        h.store.get_project(project.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_shared_to_dedicated_moves_project() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "starter").await;
        let cluster_id = project.shared_cluster_id.unwrap();
        let old_url = project.credentials.as_ref().unwrap().connection_url();
        let migrator = Arc::new(ScriptedMigrator::default());

        let outcome = engine(&h, migrator.clone())
            .upgrade_plan(project.id, "pro")
            .await
            .unwrap();

        assert_eq!(outcome.status, ProvisionStatus::Ready);
        let stored = h.store.get_project(project.id).await.unwrap();
        assert_eq!(stored.plan_id, "pro");
        assert_eq!(stored.preset_id, Some(3));
        assert!(stored.shared_cluster_id.is_none());
        assert!(stored.shared_db_id.is_none());
        let external_ref = stored.external_ref.unwrap();
        assert!(h.provider.cluster_exists(external_ref.cluster_id));

        let calls = migrator.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, old_url);
        assert_eq!(calls[0].1, stored.credentials.unwrap().connection_url());

        assert_eq!(h.store.get_cluster(cluster_id).await.unwrap().db_count, 0);
    }

    #[tokio::test]
    async fn test_failed_copy_keeps_shared_binding() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "starter").await;
        let clusters_before = h.provider.cluster_count();

        let err = engine(&h, Arc::new(ScriptedMigrator::failing()))
            .upgrade_plan(project.id, "pro")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Migration(MigrationError::DataMigration(_))
        ));
        let stored = h.store.get_project(project.id).await.unwrap();
        assert_eq!(stored.provision_status, ProvisionStatus::Error);
        assert_eq!(stored.shared_cluster_id, project.shared_cluster_id);
        assert_eq!(stored.shared_db_id, project.shared_db_id);
        assert_eq!(stored.credentials, project.credentials);
        assert!(stored.external_ref.is_none());
        assert_eq!(h.provider.cluster_count(), clusters_before);

        let cluster = h.store.get_cluster(project.shared_cluster_id.unwrap()).await.unwrap();
        assert_eq!(cluster.db_count, 1);
    }

    #[tokio::test]
    async fn test_cluster_that_never_boots_times_out() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "starter").await;
        h.provider.set_initial_status("starting");
        let migrator = Arc::new(ScriptedMigrator::default());

        let err = engine(&h, migrator.clone())
            .upgrade_plan(project.id, "pro")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Migration(MigrationError::Timeout { attempts: 3, .. })
        ));
        assert!(migrator.calls().is_empty());
        let new_cluster = h.provider.last_cluster_id().unwrap();
        assert!(!h.provider.cluster_exists(new_cluster));
        let stored = h.store.get_project(project.id).await.unwrap();
        assert_eq!(stored.provision_status, ProvisionStatus::Error);
        assert!(stored.shared_db_id.is_some());
    }

    #[tokio::test]
    async fn test_unpaid_cluster_aborts_migration() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "starter").await;
        h.provider.set_initial_status("no_paid");

        let err = engine(&h, Arc::new(ScriptedMigrator::default()))
            .upgrade_plan(project.id, "pro")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Migration(MigrationError::Provider(_))
        ));
        assert!(!h.provider.cluster_exists(h.provider.last_cluster_id().unwrap()));
    }

    #[tokio::test]
    async fn test_creation_failure_marks_error() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "starter").await;
        h.provider.fail_next(MockOp::CreateCluster, 1);

        let err = engine(&h, Arc::new(ScriptedMigrator::default()))
            .upgrade_plan(project.id, "pro")
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Migration(MigrationError::Provider(_))));
        let stored = h.store.get_project(project.id).await.unwrap();
        assert_eq!(stored.provision_status, ProvisionStatus::Error);
        assert_eq!(stored.shared_db_id, project.shared_db_id);
    }

    #[tokio::test]
    async fn test_failed_old_database_removal_still_succeeds() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "starter").await;
        h.provider.fail_next(MockOp::DeleteDatabase, 1);

        let outcome = engine(&h, Arc::new(ScriptedMigrator::default()))
            .upgrade_plan(project.id, "pro")
            .await
            .unwrap();

        assert_eq!(outcome.status, ProvisionStatus::Ready);
        let stored = h.store.get_project(project.id).await.unwrap();
        assert!(stored.external_ref.is_some());
    }

    #[tokio::test]
    async fn test_dedicated_upgrade_resizes_in_place() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "pro").await;
        let external_ref = project.external_ref.unwrap();
        let migrator = Arc::new(ScriptedMigrator::default());

        let outcome = engine(&h, migrator.clone())
            .upgrade_plan(project.id, "business")
            .await
            .unwrap();

        assert_eq!(outcome.status, ProvisionStatus::Ready);
        let stored = h.store.get_project(project.id).await.unwrap();
        assert_eq!(stored.plan_id, "business");
        assert_eq!(stored.external_ref, Some(external_ref));
        assert_eq!(stored.preset_id, h.provider.preset_of(external_ref.cluster_id));
        assert_ne!(stored.preset_id, Some(3));
        assert!(migrator.calls().is_empty());
        assert_eq!(h.provider.cluster_count(), 1);
    }

    #[tokio::test]
    async fn test_resize_in_progress_stays_upgrading() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "pro").await;
        h.provider.set_resize_status("updating");

        let outcome = engine(&h, Arc::new(ScriptedMigrator::default()))
            .upgrade_plan(project.id, "business")
            .await
            .unwrap();

        assert_eq!(outcome.status, ProvisionStatus::Upgrading);
        assert!(outcome.needs_polling);
    }

    #[tokio::test]
    async fn test_resize_failure_marks_error() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "pro").await;
        h.provider.fail_next(MockOp::ResizeCluster, 1);

        engine(&h, Arc::new(ScriptedMigrator::default()))
            .upgrade_plan(project.id, "business")
            .await
            .unwrap_err();

        let stored = h.store.get_project(project.id).await.unwrap();
        assert_eq!(stored.provision_status, ProvisionStatus::Error);
        assert_eq!(stored.plan_id, "pro");
    }

    #[tokio::test]
    async fn test_downgrade_is_rejected() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "pro").await;

        let err = engine(&h, Arc::new(ScriptedMigrator::default()))
            .upgrade_plan(project.id, "starter")
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::InvalidUpgrade { .. }));
        let stored = h.store.get_project(project.id).await.unwrap();
        assert_eq!(stored.provision_status, ProvisionStatus::Ready);
    }

    #[tokio::test]
    async fn test_shared_to_shared_is_unsupported() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "free").await;

        let err = engine(&h, Arc::new(ScriptedMigrator::default()))
            .upgrade_plan(project.id, "starter")
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::UnsupportedTransition { .. }));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_unknown_plan() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "free").await;

        let err = engine(&h, Arc::new(ScriptedMigrator::default()))
            .upgrade_plan(project.id, "enterprise-plus")
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::UnknownPlan(_)));
    }

    #[tokio::test]
    async fn test_unprovisioned_project_conflicts() {
        let h = Harness::new();
        let project = h.project("acme", "free").await;

        let err = engine(&h, Arc::new(ScriptedMigrator::default()))
            .upgrade_plan(project.id, "pro")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Conflict {
                current: ProvisionStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_second_upgrade_while_upgrading_conflicts() {
        let h = Harness::new();
        let project = provisioned(&h, "acme", "starter").await;
        let engine = engine(&h, Arc::new(ScriptedMigrator::default()));
        engine.begin_upgrade(project.id, "pro").await.unwrap();

        let err = engine.upgrade_plan(project.id, "business").await.unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Conflict {
                current: ProvisionStatus::Upgrading,
                ..
            }
        ));
    }
}
