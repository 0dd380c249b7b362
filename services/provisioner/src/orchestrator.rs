//! Caller-facing operations.
//!
//! Blocking variants run the whole operation before returning. `start_*`
//! variants validate and claim the project, hand the rest to a background
//! task, and return immediately; callers then poll
//! [`Orchestrator::check_provision_status`].

use std::sync::Arc;

use pgfleet_id::{ClusterId, ProjectId};
use tracing::{info, instrument};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::migration::{DataMigrator, MigrationConfig, MigrationEngine};
use crate::model::{Project, SharedCluster, TaskKind};
use crate::plans::{Plan, PlanCatalog};
use crate::pool::{ClusterPool, DrainOutcome};
use crate::provider::CloudProvider;
use crate::provisioner::{ProvisionOutcome, Provisioner};
use crate::reconciler::{StatusReconciler, StatusReport};
use crate::status::ProvisionStatus;
use crate::store::Store;
use crate::tasks::{TaskRunner, DEFAULT_TASK_DEADLINE_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub migration: MigrationConfig,
    /// Deadline after which a silent task is presumed dead.
    pub task_deadline: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            migration: MigrationConfig::default(),
            task_deadline: chrono::Duration::seconds(DEFAULT_TASK_DEADLINE_SECS),
        }
    }
}

pub struct Orchestrator {
    pool: Arc<ClusterPool>,
    provisioner: Arc<Provisioner>,
    migrations: Arc<MigrationEngine>,
    reconciler: Arc<StatusReconciler>,
    tasks: TaskRunner,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn CloudProvider>,
        catalog: Arc<PlanCatalog>,
        migrator: Arc<dyn DataMigrator>,
        config: OrchestratorConfig,
    ) -> Self {
        let pool = Arc::new(ClusterPool::new(store.clone(), provider, catalog));
        Self {
            provisioner: Arc::new(Provisioner::new(pool.clone())),
            migrations: Arc::new(MigrationEngine::new(
                pool.clone(),
                migrator,
                config.migration,
            )),
            reconciler: Arc::new(StatusReconciler::new(pool.clone(), config.task_deadline)),
            tasks: TaskRunner::new(store, config.task_deadline),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ClusterPool> {
        &self.pool
    }

    pub fn reconciler(&self) -> &Arc<StatusReconciler> {
        &self.reconciler
    }

    fn store(&self) -> &dyn Store {
        self.pool.store().as_ref()
    }

    pub fn list_plans(&self) -> Vec<Plan> {
        self.pool.catalog().plans().to_vec()
    }

    /// Register a `pending` project on `plan_id`.
    #[instrument(skip(self), fields(slug = %slug, region = %region))]
    pub async fn create_project(
        &self,
        slug: &str,
        region: &str,
        plan_id: &str,
    ) -> OrchestratorResult<Project> {
        let plan = self.provisioner.plan(plan_id)?;
        let project = Project::new(slug, region, &plan);
        self.store().insert_project(&project).await?;
        info!(project_id = %project.id, plan = %plan.id, "Project created");
        Ok(project)
    }

    pub async fn get_project(&self, project_id: ProjectId) -> OrchestratorResult<Project> {
        Ok(self.store().get_project(project_id).await?)
    }

    pub async fn list_clusters(&self) -> OrchestratorResult<Vec<SharedCluster>> {
        Ok(self.store().list_clusters().await?)
    }

    /// Provision the project's database and wait for the result.
    pub async fn provision_for_plan(
        &self,
        project_id: ProjectId,
        plan_id: &str,
    ) -> OrchestratorResult<ProvisionOutcome> {
        let (project, plan) = self.provisioner.prepare(project_id, plan_id).await?;
        self.tasks
            .run(
                project_id,
                TaskKind::Provision,
                self.provisioner.provision_for_plan(&project, &plan),
            )
            .await
    }

    /// Claim the project and provision it in the background.
    pub async fn start_provision(
        &self,
        project_id: ProjectId,
        plan_id: &str,
    ) -> OrchestratorResult<ProvisionOutcome> {
        let (project, plan) = self.provisioner.prepare(project_id, plan_id).await?;
        let provisioner = self.provisioner.clone();
        let outcome = ProvisionOutcome::from_project(&project);
        self.tasks
            .spawn(project_id, TaskKind::Provision, async move {
                provisioner.provision_for_plan(&project, &plan).await
            })
            .await?;
        Ok(outcome)
    }

    pub async fn check_provision_status(
        &self,
        project_id: ProjectId,
    ) -> OrchestratorResult<StatusReport> {
        self.reconciler.check_provision_status(project_id).await
    }

    /// Move the project to a higher plan and wait for the result.
    pub async fn upgrade_plan(
        &self,
        project_id: ProjectId,
        new_plan_id: &str,
    ) -> OrchestratorResult<ProvisionOutcome> {
        let upgrade = self.migrations.begin_upgrade(project_id, new_plan_id).await?;
        self.tasks
            .run(
                project_id,
                TaskKind::Upgrade,
                self.migrations.run_upgrade(upgrade),
            )
            .await
    }

    /// Validate an upgrade and carry it out in the background.
    pub async fn start_upgrade(
        &self,
        project_id: ProjectId,
        new_plan_id: &str,
    ) -> OrchestratorResult<ProvisionOutcome> {
        let upgrade = self.migrations.begin_upgrade(project_id, new_plan_id).await?;
        let outcome = ProvisionOutcome::from_project(&upgrade.project);
        let migrations = self.migrations.clone();
        self.tasks
            .spawn(project_id, TaskKind::Upgrade, async move {
                migrations.run_upgrade(upgrade).await
            })
            .await?;
        Ok(outcome)
    }

    pub async fn deprovision(&self, project_id: ProjectId) -> OrchestratorResult<ProvisionStatus> {
        self.provisioner.begin_deprovision(project_id).await?;
        self.tasks
            .run(
                project_id,
                TaskKind::Deprovision,
                self.provisioner.run_deprovision(project_id),
            )
            .await
    }

    pub async fn drain_cluster(&self, cluster_id: ClusterId) -> OrchestratorResult<DrainOutcome> {
        self.pool
            .drain_cluster(cluster_id)
            .await
            .map_err(OrchestratorError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pgfleet_reconcile::PollPolicy;

    use crate::migration::NoopMigrator;
    use crate::model::TaskState;
    use crate::provider::MockProvider;
    use crate::status::ClusterStatus;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        provider: Arc<MockProvider>,
        orchestrator: Orchestrator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let config = OrchestratorConfig {
            migration: MigrationConfig {
                poll: PollPolicy::new(Duration::from_millis(1), 5),
                copy_timeout: Duration::from_secs(1),
            },
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::new(
            store.clone(),
            provider.clone(),
            Arc::new(PlanCatalog::default()),
            Arc::new(NoopMigrator),
            config,
        );
        Fixture {
            store,
            provider,
            orchestrator,
        }
    }

    async fn wait_settled(o: &Orchestrator, project_id: ProjectId) -> StatusReport {
        for _ in 0..100 {
            let report = o.check_provision_status(project_id).await.unwrap();
            if !report.status.is_transient() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("project {project_id} did not settle");
    }

    #[tokio::test]
    async fn test_create_project_rejects_unknown_plan() {
        let f = fixture();
        let err = f
            .orchestrator
            .create_project("acme", "ru-msk", "diamond")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownPlan(_)));
    }

    #[tokio::test]
    async fn test_blocking_provision_records_task() {
        let f = fixture();
        let project = f.orchestrator.create_project("acme", "ru-msk", "free").await.unwrap();

        let outcome = f
            .orchestrator
            .provision_for_plan(project.id, "free")
            .await
            .unwrap();

        assert_eq!(outcome.status, ProvisionStatus::Ready);
        let task = f.store.latest_task_for_project(project.id).await.unwrap().unwrap();
        assert_eq!(task.kind, TaskKind::Provision);
        assert_eq!(task.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_background_provision_is_polled_to_ready() {
        let f = fixture();
        let project = f.orchestrator.create_project("acme", "ru-msk", "pro").await.unwrap();

        let outcome = f.orchestrator.start_provision(project.id, "pro").await.unwrap();
        assert_eq!(outcome.status, ProvisionStatus::Provisioning);
        assert!(outcome.needs_polling);

        let report = wait_settled(&f.orchestrator, project.id).await;
        assert_eq!(report.status, ProvisionStatus::Ready);
        assert!(report.credentials.is_some());
    }

    // Free project on an empty region, then a second project sharing the cluster.
    #[tokio::test]
    async fn test_free_projects_share_one_cluster() {
        let f = fixture();
        let o = &f.orchestrator;
        let a = o.create_project("a", "ru-msk", "free").await.unwrap();
        let b = o.create_project("b", "ru-msk", "free").await.unwrap();

        o.provision_for_plan(a.id, "free").await.unwrap();
        o.provision_for_plan(b.id, "free").await.unwrap();

        let clusters = o.list_clusters().await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].db_count, 2);
        assert_eq!(clusters[0].status, ClusterStatus::Ready);
    }

    // Starter project upgraded to a dedicated plan in the background.
    #[tokio::test]
    async fn test_background_upgrade_moves_to_dedicated() {
        let f = fixture();
        let o = &f.orchestrator;
        let project = o.create_project("acme", "ru-msk", "starter").await.unwrap();
        o.provision_for_plan(project.id, "starter").await.unwrap();

        let outcome = o.start_upgrade(project.id, "pro").await.unwrap();
        assert_eq!(outcome.status, ProvisionStatus::Upgrading);

        let report = wait_settled(o, project.id).await;
        assert_eq!(report.status, ProvisionStatus::Ready);
        let stored = o.get_project(project.id).await.unwrap();
        assert!(stored.is_dedicated());
        assert!(!stored.is_shared());
        assert_eq!(o.list_clusters().await.unwrap()[0].db_count, 0);
    }

    // A deferred shared project stays provisioning until the cluster boots.
    #[tokio::test]
    async fn test_deferred_shared_project_via_status_polls() {
        let f = fixture();
        f.provider.set_initial_status("starting");
        let o = &f.orchestrator;
        let project = o.create_project("acme", "ru-msk", "starter").await.unwrap();

        let outcome = o.provision_for_plan(project.id, "starter").await.unwrap();
        assert_eq!(outcome.status, ProvisionStatus::Provisioning);
        assert_eq!(
            o.check_provision_status(project.id).await.unwrap().status,
            ProvisionStatus::Provisioning
        );

        let cluster = o.list_clusters().await.unwrap().remove(0);
        f.provider.set_status(cluster.external_id.unwrap(), "started");

        let report = o.check_provision_status(project.id).await.unwrap();
        assert_eq!(report.status, ProvisionStatus::Ready);
    }

    #[tokio::test]
    async fn test_drain_then_deprovision_removes_cluster() {
        let f = fixture();
        let o = &f.orchestrator;
        let project = o.create_project("acme", "ru-msk", "free").await.unwrap();
        o.provision_for_plan(project.id, "free").await.unwrap();
        let cluster = o.list_clusters().await.unwrap().remove(0);

        let drained = o.drain_cluster(cluster.id).await.unwrap();
        assert_eq!(drained, DrainOutcome::Draining { remaining: 1 });

        let status = o.deprovision(project.id).await.unwrap();
        assert_eq!(status, ProvisionStatus::Deleted);
        assert!(o.list_clusters().await.unwrap().is_empty());
        assert!(!f.provider.cluster_exists(cluster.external_id.unwrap()));
    }

    #[test]
    fn test_list_plans_in_rank_order() {
        let f = fixture();
        let ids: Vec<_> = f.orchestrator.list_plans().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["free", "starter", "pro", "business"]);
    }

    #[tokio::test]
    async fn test_unrecorded_background_provision_can_be_retried() {
        let f = fixture();
        let o = &f.orchestrator;
        let project = o.create_project("acme", "ru-msk", "free").await.unwrap();
        f.store.reject_task_inserts(true);

        let err = o.start_provision(project.id, "free").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(_)));
        let report = o.check_provision_status(project.id).await.unwrap();
        assert_eq!(report.status, ProvisionStatus::Error);
        assert_eq!(f.provider.cluster_count(), 0);

        f.store.reject_task_inserts(false);
        o.start_provision(project.id, "free").await.unwrap();
        let report = wait_settled(o, project.id).await;
        assert_eq!(report.status, ProvisionStatus::Ready);
    }

    #[tokio::test]
    async fn test_unrecorded_upgrade_does_not_strand_project() {
        let f = fixture();
        let o = &f.orchestrator;
        let project = o.create_project("acme", "ru-msk", "starter").await.unwrap();
        o.provision_for_plan(project.id, "starter").await.unwrap();
        f.store.reject_task_inserts(true);

        assert!(o.upgrade_plan(project.id, "pro").await.is_err());

        let stored = o.get_project(project.id).await.unwrap();
        assert_eq!(stored.provision_status, ProvisionStatus::Error);
        assert!(stored.is_shared());
    }
}
