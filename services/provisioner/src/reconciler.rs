//! Drives projects left in a transient status to completion.
//!
//! Provisioning against a booting shared cluster and dedicated clusters the
//! provider is still starting or resizing return early. Polling the status
//! finishes that work once the provider catches up.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use pgfleet_id::{ClusterId, ProjectId};
use pgfleet_reconcile::{RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{OrchestratorError, OrchestratorResult, PoolError};
use crate::model::{DatabaseCredentials, Project, TaskRecord, TaskState};
use crate::plans::PlanTier;
use crate::pool::{ClusterPool, TenantDatabase};
use crate::provider::dedicated_credentials;
use crate::provisioner::persist_error;
use crate::status::{ClusterStatus, ProvisionStatus};
use crate::store::Store;

/// Current status of a project and, once ready, how to reach its database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: ProvisionStatus,
    pub credentials: Option<DatabaseCredentials>,
}

impl StatusReport {
    fn of(project: &Project) -> Self {
        Self {
            status: project.provision_status,
            credentials: project.credentials.clone(),
        }
    }
}

pub struct StatusReconciler {
    pool: Arc<ClusterPool>,
    /// How long a transient project may sit without any task record.
    task_deadline: chrono::Duration,
    failures: Mutex<RetryTracker>,
}

impl StatusReconciler {
    pub fn new(pool: Arc<ClusterPool>, task_deadline: chrono::Duration) -> Self {
        Self {
            pool,
            task_deadline,
            failures: Mutex::new(RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)),
        }
    }

    /// Fail a project once it exceeds `max_retries` reconcile errors within `window`.
    pub fn with_retry_budget(mut self, max_retries: u32, window: Duration) -> Self {
        self.failures = Mutex::new(RetryTracker::new(max_retries, window));
        self
    }

    fn store(&self) -> &dyn Store {
        self.pool.store().as_ref()
    }

    fn failures(&self) -> MutexGuard<'_, RetryTracker> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report the project's status, advancing it if the provider allows.
    ///
    /// Safe to call repeatedly and concurrently.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn check_provision_status(
        &self,
        project_id: ProjectId,
    ) -> OrchestratorResult<StatusReport> {
        let project = self.store().get_project(project_id).await?;
        if project.provision_status.is_terminal() {
            return Ok(StatusReport::of(&project));
        }

        // A running task owns the project until it finishes or misses its deadline.
        match self.store().latest_task_for_project(project_id).await? {
            Some(task) if task.is_stale(Utc::now()) => {
                self.abandon(&task).await?;
                return Ok(StatusReport::of(&self.store().get_project(project_id).await?));
            }
            Some(task) if task.state == TaskState::Running => {
                debug!(task_id = %task.id, kind = task.kind.as_str(), "Task still running");
                return Ok(StatusReport::of(&project));
            }
            // Claimed but its task was never recorded.
            None if project.provision_status.is_transient()
                && Utc::now() - project.updated_at > self.task_deadline =>
            {
                let cause = format!("project left {} with no task", project.provision_status);
                persist_error(self.store(), project_id, &cause).await;
                return Ok(StatusReport::of(&self.store().get_project(project_id).await?));
            }
            _ => {}
        }

        match project.provision_status {
            ProvisionStatus::Provisioning if project.shared_db_id.is_none() => {
                if let Some(cluster_id) = project.shared_cluster_id {
                    return self.complete_shared(project, cluster_id).await;
                }
                if project.external_ref.is_some() {
                    return self.refresh_dedicated(project).await;
                }
            }
            ProvisionStatus::Provisioning | ProvisionStatus::Upgrading
                if project.external_ref.is_some() =>
            {
                return self.refresh_dedicated(project).await;
            }
            _ => {}
        }
        Ok(StatusReport::of(&project))
    }

    /// Finish a shared project bound to a cluster that was still booting.
    async fn complete_shared(
        &self,
        project: Project,
        cluster_id: ClusterId,
    ) -> OrchestratorResult<StatusReport> {
        let placed = match self.pool.refresh_cluster_status(cluster_id).await {
            Ok(ClusterStatus::Provisioning) => return Ok(StatusReport::of(&project)),
            Ok(_) => match self.pool.add_database_to_cluster(cluster_id, &project.slug).await {
                Ok(tenant) => Some(tenant),
                Err(e) if e.is_retryable_placement() => {
                    info!(cluster_id = %cluster_id, error = %e, "Bound cluster unusable; selecting another");
                    self.place_elsewhere(&project).await?
                }
                Err(e) => return Err(e.into()),
            },
            // The claim behind the binding was discarded or reaped.
            Err(PoolError::ClusterNotFound(_)) => {
                warn!(cluster_id = %cluster_id, "Bound cluster no longer exists; selecting another");
                self.place_elsewhere(&project).await?
            }
            Err(e) => return Err(e.into()),
        };

        match placed {
            Some(tenant) => self.bind(project.id, tenant).await,
            None => Ok(StatusReport::of(&self.store().get_project(project.id).await?)),
        }
    }

    /// Pick a new cluster for the project.
    ///
    /// Returns `None` when the new cluster is still booting; the project is
    /// rebound to it and completes on a later poll.
    async fn place_elsewhere(&self, project: &Project) -> OrchestratorResult<Option<TenantDatabase>> {
        let plan = self
            .pool
            .catalog()
            .get(&project.plan_id)
            .ok_or_else(|| OrchestratorError::UnknownPlan(project.plan_id.clone()))?;
        let PlanTier::Shared(pool_type) = plan.tier() else {
            return Err(OrchestratorError::UnsupportedTransition {
                from: project.plan_id.clone(),
                to: plan.id.clone(),
            });
        };

        let cluster = self
            .pool
            .ensure_available_cluster(&project.region, pool_type)
            .await?;

        if cluster.status == ClusterStatus::Provisioning {
            let mut rebound = project.clone();
            rebound.shared_cluster_id = Some(cluster.id);
            self.store().update_project(&rebound).await?;
            return Ok(None);
        }

        Ok(Some(
            self.pool
                .add_database_to_cluster(cluster.id, &project.slug)
                .await?,
        ))
    }

    async fn bind(&self, project_id: ProjectId, tenant: TenantDatabase) -> OrchestratorResult<StatusReport> {
        let bound = self
            .store()
            .bind_shared_database(project_id, tenant.cluster_id, tenant.db_id, &tenant.credentials)
            .await?;

        if bound {
            info!(cluster_id = %tenant.cluster_id, db_id = tenant.db_id, "Deferred shared database ready");
        } else {
            // Another poll bound its database first.
            debug!(db_id = tenant.db_id, "Lost bind race; removing duplicate database");
            if let Err(e) = self
                .pool
                .remove_database_from_cluster(tenant.cluster_id, tenant.db_id)
                .await
            {
                error!(db_id = tenant.db_id, error = %e, "Failed to remove duplicate tenant database");
            }
        }
        Ok(StatusReport::of(&self.store().get_project(project_id).await?))
    }

    /// Persist the provider's view of a dedicated cluster once it settles.
    async fn refresh_dedicated(&self, mut project: Project) -> OrchestratorResult<StatusReport> {
        let Some(external_ref) = project.external_ref else {
            return Ok(StatusReport::of(&project));
        };
        let provider = self.pool.provider();

        match provider.get_cluster_status(external_ref.cluster_id).await? {
            ProvisionStatus::Ready => {
                let fetched = dedicated_credentials(provider.as_ref(), external_ref).await?;
                project.credentials = Some(fetched.or_known_password(project.credentials.as_ref()));
                project.provision_status = ProvisionStatus::Ready;
                self.store().update_project(&project).await?;
                info!(external_ref = %external_ref, "Dedicated cluster ready");
            }
            ProvisionStatus::Error => {
                let cause = format!("dedicated cluster {} reported an error", external_ref.cluster_id);
                persist_error(self.store(), project.id, &cause).await;
                project.provision_status = ProvisionStatus::Error;
            }
            other => debug!(provider_status = %other, "Dedicated cluster not settled"),
        }
        Ok(StatusReport::of(&project))
    }

    /// Mark a task that missed its deadline as abandoned and fail its project.
    async fn abandon(&self, task: &TaskRecord) -> OrchestratorResult<()> {
        let cause = format!("{} task exceeded its deadline", task.kind.as_str());
        if self
            .store()
            .finish_task(task.id, TaskState::Abandoned, Some(&cause))
            .await?
        {
            warn!(task_id = %task.id, project_id = %task.project_id, "Task abandoned");
            persist_error(self.store(), task.project_id, &cause).await;
        }
        Ok(())
    }

    /// Abandon every overdue task; returns how many were abandoned.
    pub async fn sweep_stale_tasks(&self) -> OrchestratorResult<usize> {
        let stale = self.store().stale_tasks(Utc::now()).await?;
        for task in &stale {
            self.abandon(task).await?;
        }
        Ok(stale.len())
    }

    /// Reconcile every project in a transient status.
    ///
    /// Returns how many reached a settled status. Failures are logged per
    /// project and do not stop the pass; a project that keeps failing past
    /// its retry budget is marked `error`.
    pub async fn reconcile_pending(&self) -> OrchestratorResult<usize> {
        let projects = self
            .store()
            .list_projects_in_status(&[
                ProvisionStatus::Provisioning,
                ProvisionStatus::Upgrading,
                ProvisionStatus::Deleting,
            ])
            .await?;
        self.failures().prune();

        let mut settled = 0;
        for project in projects {
            let key = project.id.to_string();
            match self.check_provision_status(project.id).await {
                Ok(report) => {
                    self.failures().clear(&key);
                    if !report.status.is_transient() {
                        settled += 1;
                    }
                }
                Err(e) => {
                    let exhausted = self.failures().record_failure(&key);
                    if !exhausted {
                        warn!(project_id = %project.id, error = %e, "Reconcile failed");
                        continue;
                    }
                    let cause = format!("reconcile kept failing: {e}");
                    persist_error(self.store(), project.id, &cause).await;
                    self.failures().clear(&key);
                    settled += 1;
                }
            }
        }
        Ok(settled)
    }
}
