//! [`Store`] implementation on Postgres.
//!
//! Every conditional operation is one SQL statement so it stays atomic across
//! processes; see `migrations/0001_init.sql` for the backing constraints.

use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgfleet_id::{ClusterId, ProjectId, TaskId};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::model::{DatabaseCredentials, Project, SharedCluster, TaskRecord, TaskState};
use crate::plans::PoolType;
use crate::status::{ClusterStatus, ProvisionStatus};
use crate::store::{ClusterAttachment, ClusterClaim, Store, StoreError, StoreResult};

const UNIQUE_VIOLATION: &str = "23505";

/// Attempts at claiming a cluster slot before giving up. A claim only loses
/// repeatedly if placeholders keep appearing and vanishing underneath it.
const CLAIM_ATTEMPTS: usize = 3;

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_column<T>(column: &str, value: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| StoreError::Serialization(format!("column {column}: {e}")))
}

fn status_list<T, F: Fn(&T) -> &'static str>(items: &[T], as_str: F) -> Vec<String> {
    items.iter().map(|s| as_str(s).to_string()).collect()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION))
}

struct ProjectRow {
    id: String,
    slug: String,
    region: String,
    plan_id: String,
    provision_status: String,
    shared_cluster_id: Option<String>,
    shared_db_id: Option<i64>,
    external_ref: Option<String>,
    preset_id: Option<i64>,
    credentials: Option<serde_json::Value>,
    db_size_mb: i32,
    storage_mb: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ProjectRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            slug: row.try_get("slug")?,
            region: row.try_get("region")?,
            plan_id: row.try_get("plan_id")?,
            provision_status: row.try_get("provision_status")?,
            shared_cluster_id: row.try_get("shared_cluster_id")?,
            shared_db_id: row.try_get("shared_db_id")?,
            external_ref: row.try_get("external_ref")?,
            preset_id: row.try_get("preset_id")?,
            credentials: row.try_get("credentials")?,
            db_size_mb: row.try_get("db_size_mb")?,
            storage_mb: row.try_get("storage_mb")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ProjectRow> for Project {
    type Error = StoreError;

    fn try_from(row: ProjectRow) -> StoreResult<Self> {
        let credentials = row
            .credentials
            .map(serde_json::from_value::<DatabaseCredentials>)
            .transpose()
            .map_err(|e| StoreError::Serialization(format!("column credentials: {e}")))?;

        Ok(Project {
            id: parse_column("id", &row.id)?,
            slug: row.slug,
            region: row.region,
            plan_id: row.plan_id,
            provision_status: parse_column("provision_status", &row.provision_status)?,
            shared_cluster_id: row
                .shared_cluster_id
                .as_deref()
                .map(|v| parse_column("shared_cluster_id", v))
                .transpose()?,
            shared_db_id: row.shared_db_id,
            external_ref: row
                .external_ref
                .as_deref()
                .map(|v| parse_column("external_ref", v))
                .transpose()?,
            preset_id: row.preset_id,
            credentials,
            db_size_mb: row.db_size_mb,
            storage_mb: row.storage_mb,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct ClusterRow {
    id: String,
    external_id: Option<i64>,
    region: String,
    pool_type: String,
    preset_id: i64,
    status: String,
    db_count: i32,
    max_databases: i32,
    host: String,
    port: i32,
    admin_user: String,
    admin_password: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ClusterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            region: row.try_get("region")?,
            pool_type: row.try_get("pool_type")?,
            preset_id: row.try_get("preset_id")?,
            status: row.try_get("status")?,
            db_count: row.try_get("db_count")?,
            max_databases: row.try_get("max_databases")?,
            host: row.try_get("host")?,
            port: row.try_get("port")?,
            admin_user: row.try_get("admin_user")?,
            admin_password: row.try_get("admin_password")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ClusterRow> for SharedCluster {
    type Error = StoreError;

    fn try_from(row: ClusterRow) -> StoreResult<Self> {
        Ok(SharedCluster {
            id: parse_column("id", &row.id)?,
            external_id: row.external_id,
            region: row.region,
            pool_type: parse_column::<PoolType>("pool_type", &row.pool_type)?,
            preset_id: row.preset_id,
            status: parse_column("status", &row.status)?,
            db_count: row.db_count,
            max_databases: row.max_databases,
            host: row.host,
            port: u16::try_from(row.port)
                .map_err(|e| StoreError::Serialization(format!("column port: {e}")))?,
            admin_user: row.admin_user,
            admin_password: row.admin_password,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct TaskRow {
    id: String,
    project_id: String,
    kind: String,
    state: String,
    error: Option<String>,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            kind: row.try_get("kind")?,
            state: row.try_get("state")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            deadline: row.try_get("deadline")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> StoreResult<Self> {
        Ok(TaskRecord {
            id: parse_column("id", &row.id)?,
            project_id: parse_column("project_id", &row.project_id)?,
            kind: parse_column("kind", &row.kind)?,
            state: parse_column("state", &row.state)?,
            error: row.error,
            started_at: row.started_at,
            deadline: row.deadline,
            finished_at: row.finished_at,
        })
    }
}

fn credentials_json(
    credentials: Option<&DatabaseCredentials>,
) -> StoreResult<Option<serde_json::Value>> {
    credentials
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn collect<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn insert_project(&self, project: &Project) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (
                id, slug, region, plan_id, provision_status,
                shared_cluster_id, shared_db_id, external_ref, preset_id, credentials,
                db_size_mb, storage_mb, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(project.id.to_string())
        .bind(&project.slug)
        .bind(&project.region)
        .bind(&project.plan_id)
        .bind(project.provision_status.as_str())
        .bind(project.shared_cluster_id.map(|id| id.to_string()))
        .bind(project.shared_db_id)
        .bind(project.external_ref.map(|r| r.to_string()))
        .bind(project.preset_id)
        .bind(credentials_json(project.credentials.as_ref())?)
        .bind(project.db_size_mb)
        .bind(project.storage_mb)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists {
                    entity: "project",
                    id: project.slug.clone(),
                }
            } else {
                StoreError::Database(e)
            }
        })?;
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> StoreResult<Project> {
        sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::project_not_found(id))?
            .try_into()
    }

    async fn update_project(&self, project: &Project) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE projects SET
                plan_id = $2,
                provision_status = $3,
                shared_cluster_id = $4,
                shared_db_id = $5,
                external_ref = $6,
                preset_id = $7,
                credentials = $8,
                db_size_mb = $9,
                storage_mb = $10,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(project.id.to_string())
        .bind(&project.plan_id)
        .bind(project.provision_status.as_str())
        .bind(project.shared_cluster_id.map(|id| id.to_string()))
        .bind(project.shared_db_id)
        .bind(project.external_ref.map(|r| r.to_string()))
        .bind(project.preset_id)
        .bind(credentials_json(project.credentials.as_ref())?)
        .bind(project.db_size_mb)
        .bind(project.storage_mb)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::project_not_found(project.id));
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        id: ProjectId,
        expected: &[ProvisionStatus],
        next: ProvisionStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE projects SET provision_status = $3, updated_at = now()
            WHERE id = $1 AND provision_status = ANY($2)
            "#,
        )
        .bind(id.to_string())
        .bind(status_list(expected, ProvisionStatus::as_str))
        .bind(next.as_str())
        .execute(&self.pool)
        .await?;

        let moved = result.rows_affected() == 1;
        debug!(project_id = %id, to = %next, moved, "Project status transition");
        Ok(moved)
    }

    async fn bind_shared_database(
        &self,
        id: ProjectId,
        cluster_id: ClusterId,
        db_id: i64,
        credentials: &DatabaseCredentials,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE projects SET
                shared_cluster_id = $2,
                shared_db_id = $3,
                credentials = $4,
                provision_status = 'ready',
                updated_at = now()
            WHERE id = $1
              AND provision_status = 'provisioning'
              AND shared_db_id IS NULL
            "#,
        )
        .bind(id.to_string())
        .bind(cluster_id.to_string())
        .bind(db_id)
        .bind(credentials_json(Some(credentials))?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_projects_in_status(
        &self,
        statuses: &[ProvisionStatus],
    ) -> StoreResult<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            "SELECT * FROM projects WHERE provision_status = ANY($1) ORDER BY created_at",
        )
        .bind(status_list(statuses, ProvisionStatus::as_str))
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn get_cluster(&self, id: ClusterId) -> StoreResult<SharedCluster> {
        sqlx::query_as::<_, ClusterRow>("SELECT * FROM shared_clusters WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::cluster_not_found(id))?
            .try_into()
    }

    async fn list_clusters(&self) -> StoreResult<Vec<SharedCluster>> {
        let rows =
            sqlx::query_as::<_, ClusterRow>("SELECT * FROM shared_clusters ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        collect(rows)
    }

    async fn find_available_cluster(
        &self,
        region: &str,
        pool_type: PoolType,
    ) -> StoreResult<Option<SharedCluster>> {
        sqlx::query_as::<_, ClusterRow>(
            r#"
            SELECT * FROM shared_clusters
            WHERE region = $1
              AND pool_type = $2
              AND status = 'ready'
              AND db_count < max_databases
            ORDER BY db_count DESC, created_at
            LIMIT 1
            "#,
        )
        .bind(region)
        .bind(pool_type.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(SharedCluster::try_from)
        .transpose()
    }

    async fn claim_cluster_slot(&self, placeholder: &SharedCluster) -> StoreResult<ClusterClaim> {
        for _ in 0..CLAIM_ATTEMPTS {
            let inserted = sqlx::query_as::<_, ClusterRow>(
                r#"
                INSERT INTO shared_clusters (
                    id, external_id, region, pool_type, preset_id, status,
                    db_count, max_databases, created_at, updated_at
                )
                VALUES ($1, NULL, $2, $3, $4, 'provisioning', 0, $5, $6, $6)
                ON CONFLICT (region, pool_type) WHERE status = 'provisioning' DO NOTHING
                RETURNING *
                "#,
            )
            .bind(placeholder.id.to_string())
            .bind(&placeholder.region)
            .bind(placeholder.pool_type.as_str())
            .bind(placeholder.preset_id)
            .bind(placeholder.max_databases)
            .bind(placeholder.created_at)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = inserted {
                return Ok(ClusterClaim::Claimed(row.try_into()?));
            }

            let existing = sqlx::query_as::<_, ClusterRow>(
                r#"
                SELECT * FROM shared_clusters
                WHERE region = $1 AND pool_type = $2 AND status = 'provisioning'
                ORDER BY created_at DESC
                LIMIT 1
                "#,
            )
            .bind(&placeholder.region)
            .bind(placeholder.pool_type.as_str())
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = existing {
                return Ok(ClusterClaim::Existing(row.try_into()?));
            }
        }

        Err(StoreError::AlreadyExists {
            entity: "provisioning cluster claim",
            id: format!("{}/{}", placeholder.region, placeholder.pool_type),
        })
    }

    async fn attach_cluster_resource(
        &self,
        id: ClusterId,
        attachment: &ClusterAttachment,
    ) -> StoreResult<SharedCluster> {
        sqlx::query_as::<_, ClusterRow>(
            r#"
            UPDATE shared_clusters SET
                external_id = $2,
                host = $3,
                port = $4,
                admin_user = $5,
                admin_password = $6,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .bind(attachment.external_id)
        .bind(&attachment.host)
        .bind(i32::from(attachment.port))
        .bind(&attachment.admin_user)
        .bind(&attachment.admin_password)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::cluster_not_found(id))?
        .try_into()
    }

    async fn set_cluster_status(
        &self,
        id: ClusterId,
        from: &[ClusterStatus],
        to: ClusterStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE shared_clusters SET status = $3, updated_at = now()
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id.to_string())
        .bind(status_list(from, ClusterStatus::as_str))
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reserve_slot(&self, id: ClusterId) -> StoreResult<Option<SharedCluster>> {
        sqlx::query_as::<_, ClusterRow>(
            r#"
            UPDATE shared_clusters SET
                db_count = db_count + 1,
                status = CASE WHEN db_count + 1 >= max_databases THEN 'full' ELSE status END,
                updated_at = now()
            WHERE id = $1 AND status = 'ready' AND db_count < max_databases
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(SharedCluster::try_from)
        .transpose()
    }

    async fn release_slot(&self, id: ClusterId) -> StoreResult<Option<SharedCluster>> {
        sqlx::query_as::<_, ClusterRow>(
            r#"
            UPDATE shared_clusters SET
                db_count = db_count - 1,
                status = CASE WHEN status = 'full' THEN 'ready' ELSE status END,
                updated_at = now()
            WHERE id = $1 AND db_count > 0
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(SharedCluster::try_from)
        .transpose()
    }

    async fn delete_cluster(&self, id: ClusterId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM shared_clusters WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::cluster_not_found(id));
        }
        Ok(())
    }

    async fn insert_task(&self, task: &TaskRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, project_id, kind, state, error, started_at, deadline, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.project_id.to_string())
        .bind(task.kind.as_str())
        .bind(task.state.as_str())
        .bind(&task.error)
        .bind(task.started_at)
        .bind(task.deadline)
        .bind(task.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_task(
        &self,
        id: TaskId,
        state: TaskState,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET state = $2, error = $3, finished_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id.to_string())
        .bind(state.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn latest_task_for_project(
        &self,
        project_id: ProjectId,
    ) -> StoreResult<Option<TaskRecord>> {
        sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE project_id = $1 ORDER BY started_at DESC, id DESC LIMIT 1",
        )
        .bind(project_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(TaskRecord::try_from)
        .transpose()
    }

    async fn stale_tasks(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE state = 'running' AND deadline < $1 ORDER BY deadline",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }
}
