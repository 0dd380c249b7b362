//! In-memory store for tests and `PGFLEET_DEV` runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgfleet_id::{ClusterId, ProjectId, TaskId};

use super::{ClusterAttachment, ClusterClaim, Store, StoreError, StoreResult};
use crate::model::{DatabaseCredentials, Project, SharedCluster, TaskRecord, TaskState};
use crate::plans::PoolType;
use crate::status::{ClusterStatus, ProvisionStatus};

#[derive(Debug, Default)]
struct Tables {
    projects: HashMap<ProjectId, Project>,
    clusters: HashMap<ClusterId, SharedCluster>,
    tasks: HashMap<TaskId, TaskRecord>,
    reject_tasks: bool,
}

/// Store holding everything behind one mutex.
///
/// Each trait call takes the lock once, so the conditional writes are atomic
/// just like their single-statement SQL counterparts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a cluster as-is, bypassing the claim protocol.
    pub fn seed_cluster(&self, cluster: SharedCluster) {
        self.tables().clusters.insert(cluster.id, cluster);
    }

    /// Make every later `insert_task` fail, as an unreachable tasks table would.
    pub fn reject_task_inserts(&self, reject: bool) {
        self.tables().reject_tasks = reject;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_project(&self, project: &Project) -> StoreResult<()> {
        let mut tables = self.tables();
        if tables.projects.contains_key(&project.id)
            || tables.projects.values().any(|p| p.slug == project.slug)
        {
            return Err(StoreError::AlreadyExists {
                entity: "project",
                id: project.slug.clone(),
            });
        }
        tables.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> StoreResult<Project> {
        self.tables()
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::project_not_found(id))
    }

    async fn update_project(&self, project: &Project) -> StoreResult<()> {
        let mut tables = self.tables();
        let slot = tables
            .projects
            .get_mut(&project.id)
            .ok_or_else(|| StoreError::project_not_found(project.id))?;
        *slot = project.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_status(
        &self,
        id: ProjectId,
        expected: &[ProvisionStatus],
        next: ProvisionStatus,
    ) -> StoreResult<bool> {
        let mut tables = self.tables();
        match tables.projects.get_mut(&id) {
            Some(project) if expected.contains(&project.provision_status) => {
                project.provision_status = next;
                project.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn bind_shared_database(
        &self,
        id: ProjectId,
        cluster_id: ClusterId,
        db_id: i64,
        credentials: &DatabaseCredentials,
    ) -> StoreResult<bool> {
        let mut tables = self.tables();
        match tables.projects.get_mut(&id) {
            Some(project)
                if project.provision_status == ProvisionStatus::Provisioning
                    && project.shared_db_id.is_none() =>
            {
                project.shared_cluster_id = Some(cluster_id);
                project.shared_db_id = Some(db_id);
                project.credentials = Some(credentials.clone());
                project.provision_status = ProvisionStatus::Ready;
                project.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_projects_in_status(
        &self,
        statuses: &[ProvisionStatus],
    ) -> StoreResult<Vec<Project>> {
        let mut projects: Vec<_> = self
            .tables()
            .projects
            .values()
            .filter(|p| statuses.contains(&p.provision_status))
            .cloned()
            .collect();
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    async fn get_cluster(&self, id: ClusterId) -> StoreResult<SharedCluster> {
        self.tables()
            .clusters
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::cluster_not_found(id))
    }

    async fn list_clusters(&self) -> StoreResult<Vec<SharedCluster>> {
        let mut clusters: Vec<_> = self.tables().clusters.values().cloned().collect();
        clusters.sort_by_key(|c| c.created_at);
        Ok(clusters)
    }

    async fn find_available_cluster(
        &self,
        region: &str,
        pool_type: PoolType,
    ) -> StoreResult<Option<SharedCluster>> {
        Ok(self
            .tables()
            .clusters
            .values()
            .filter(|c| {
                c.region == region
                    && c.pool_type == pool_type
                    && c.status == ClusterStatus::Ready
                    && c.has_capacity()
            })
            .max_by_key(|c| (c.db_count, std::cmp::Reverse(c.created_at)))
            .cloned())
    }

    async fn claim_cluster_slot(&self, placeholder: &SharedCluster) -> StoreResult<ClusterClaim> {
        let mut tables = self.tables();
        let existing = tables
            .clusters
            .values()
            .filter(|c| {
                c.region == placeholder.region
                    && c.pool_type == placeholder.pool_type
                    && c.status == ClusterStatus::Provisioning
            })
            .max_by_key(|c| c.created_at)
            .cloned();

        if let Some(existing) = existing {
            return Ok(ClusterClaim::Existing(existing));
        }
        tables.clusters.insert(placeholder.id, placeholder.clone());
        Ok(ClusterClaim::Claimed(placeholder.clone()))
    }

    async fn attach_cluster_resource(
        &self,
        id: ClusterId,
        attachment: &ClusterAttachment,
    ) -> StoreResult<SharedCluster> {
        let mut tables = self.tables();
        let cluster = tables
            .clusters
            .get_mut(&id)
            .ok_or_else(|| StoreError::cluster_not_found(id))?;
        cluster.external_id = Some(attachment.external_id);
        cluster.host = attachment.host.clone();
        cluster.port = attachment.port;
        cluster.admin_user = attachment.admin_user.clone();
        cluster.admin_password = attachment.admin_password.clone();
        cluster.updated_at = Utc::now();
        Ok(cluster.clone())
    }

    async fn set_cluster_status(
        &self,
        id: ClusterId,
        from: &[ClusterStatus],
        to: ClusterStatus,
    ) -> StoreResult<bool> {
        let mut tables = self.tables();
        match tables.clusters.get_mut(&id) {
            Some(cluster) if from.contains(&cluster.status) => {
                cluster.status = to;
                cluster.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reserve_slot(&self, id: ClusterId) -> StoreResult<Option<SharedCluster>> {
        let mut tables = self.tables();
        match tables.clusters.get_mut(&id) {
            Some(cluster) if cluster.status == ClusterStatus::Ready && cluster.has_capacity() => {
                cluster.db_count += 1;
                if cluster.db_count >= cluster.max_databases {
                    cluster.status = ClusterStatus::Full;
                }
                cluster.updated_at = Utc::now();
                Ok(Some(cluster.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_slot(&self, id: ClusterId) -> StoreResult<Option<SharedCluster>> {
        let mut tables = self.tables();
        match tables.clusters.get_mut(&id) {
            Some(cluster) if cluster.db_count > 0 => {
                cluster.db_count -= 1;
                if cluster.status == ClusterStatus::Full {
                    cluster.status = ClusterStatus::Ready;
                }
                cluster.updated_at = Utc::now();
                Ok(Some(cluster.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_cluster(&self, id: ClusterId) -> StoreResult<()> {
        self.tables()
            .clusters
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::cluster_not_found(id))
    }

    async fn insert_task(&self, task: &TaskRecord) -> StoreResult<()> {
        let mut tables = self.tables();
        if tables.reject_tasks {
            return Err(StoreError::Serialization("tasks table unavailable".to_string()));
        }
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn finish_task(
        &self,
        id: TaskId,
        state: TaskState,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables();
        match tables.tasks.get_mut(&id) {
            Some(task) if task.state == TaskState::Running => {
                task.state = state;
                task.error = error.map(str::to_string);
                task.finished_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "task",
                id: id.to_string(),
            }),
        }
    }

    async fn latest_task_for_project(
        &self,
        project_id: ProjectId,
    ) -> StoreResult<Option<TaskRecord>> {
        Ok(self
            .tables()
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .max_by_key(|t| (t.started_at, t.id))
            .cloned())
    }

    async fn stale_tasks(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>> {
        let mut tasks: Vec<_> = self
            .tables()
            .tasks
            .values()
            .filter(|t| t.is_stale(now))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.deadline);
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::PlanCatalog;

    fn ready_cluster(db_count: i32, max: i32) -> SharedCluster {
        let mut cluster = SharedCluster::claim("ru-msk", PoolType::Free, 2, max);
        cluster.status = ClusterStatus::Ready;
        cluster.external_id = Some(1);
        cluster.db_count = db_count;
        cluster
    }

    #[tokio::test]
    async fn test_reserve_slot_flips_to_full_at_capacity() {
        let store = MemoryStore::new();
        let cluster = ready_cluster(1, 2);
        store.seed_cluster(cluster.clone());

        let reserved = store.reserve_slot(cluster.id).await.unwrap().unwrap();
        assert_eq!(reserved.db_count, 2);
        assert_eq!(reserved.status, ClusterStatus::Full);

        assert!(store.reserve_slot(cluster.id).await.unwrap().is_none());
        assert_eq!(store.get_cluster(cluster.id).await.unwrap().db_count, 2);
    }

    #[tokio::test]
    async fn test_release_slot_reopens_full_but_not_draining() {
        let store = MemoryStore::new();
        let mut full = ready_cluster(2, 2);
        full.status = ClusterStatus::Full;
        let mut draining = ready_cluster(1, 2);
        draining.status = ClusterStatus::Draining;
        store.seed_cluster(full.clone());
        store.seed_cluster(draining.clone());

        let released = store.release_slot(full.id).await.unwrap().unwrap();
        assert_eq!(released.status, ClusterStatus::Ready);

        let released = store.release_slot(draining.id).await.unwrap().unwrap();
        assert_eq!(released.status, ClusterStatus::Draining);
        assert_eq!(released.db_count, 0);
        assert!(store.release_slot(draining.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_available_prefers_most_full() {
        let store = MemoryStore::new();
        let sparse = ready_cluster(3, 10);
        let dense = ready_cluster(8, 10);
        let mut at_capacity = ready_cluster(10, 10);
        at_capacity.status = ClusterStatus::Full;
        store.seed_cluster(sparse);
        store.seed_cluster(dense.clone());
        store.seed_cluster(at_capacity);

        let found = store
            .find_available_cluster("ru-msk", PoolType::Free)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, dense.id);
        assert!(store
            .find_available_cluster("ru-spb", PoolType::Free)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_claim_returns_existing_provisioning_cluster() {
        let store = MemoryStore::new();
        let first = SharedCluster::claim("ru-msk", PoolType::Starter, 3, 100);
        let second = SharedCluster::claim("ru-msk", PoolType::Starter, 3, 100);

        assert_eq!(
            store.claim_cluster_slot(&first).await.unwrap(),
            ClusterClaim::Claimed(first.clone())
        );
        assert_eq!(
            store.claim_cluster_slot(&second).await.unwrap(),
            ClusterClaim::Existing(first)
        );
        assert_eq!(store.list_clusters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_status_is_compare_and_set() {
        let store = MemoryStore::new();
        let catalog = PlanCatalog::default();
        let project = Project::new("acme", "ru-msk", catalog.get("free").unwrap());
        store.insert_project(&project).await.unwrap();

        let moved = store
            .transition_status(project.id, &[ProvisionStatus::Pending], ProvisionStatus::Provisioning)
            .await
            .unwrap();
        assert!(moved);

        let moved_again = store
            .transition_status(project.id, &[ProvisionStatus::Pending], ProvisionStatus::Provisioning)
            .await
            .unwrap();
        assert!(!moved_again);
    }

    #[tokio::test]
    async fn test_bind_shared_database_only_once() {
        let store = MemoryStore::new();
        let catalog = PlanCatalog::default();
        let mut project = Project::new("acme", "ru-msk", catalog.get("free").unwrap());
        project.provision_status = ProvisionStatus::Provisioning;
        store.insert_project(&project).await.unwrap();

        let cluster = ready_cluster(0, 10);
        let creds = cluster.credentials_for("acme");
        assert!(store
            .bind_shared_database(project.id, cluster.id, 11, &creds)
            .await
            .unwrap());
        assert!(!store
            .bind_shared_database(project.id, cluster.id, 12, &creds)
            .await
            .unwrap());

        let stored = store.get_project(project.id).await.unwrap();
        assert_eq!(stored.shared_db_id, Some(11));
        assert_eq!(stored.provision_status, ProvisionStatus::Ready);
    }

    #[tokio::test]
    async fn test_duplicate_slug_rejected() {
        let store = MemoryStore::new();
        let catalog = PlanCatalog::default();
        let plan = catalog.get("free").unwrap();
        store.insert_project(&Project::new("acme", "ru-msk", plan)).await.unwrap();

        let err = store
            .insert_project(&Project::new("acme", "ru-spb", plan))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }
}
