//! Cloud provider boundary.
//!
//! The provider owns the real database clusters and buckets; this module
//! describes what the orchestrator needs from it:
//!
//! - Cluster lifecycle (create, inspect, resize, delete)
//! - Tenant databases inside a cluster
//! - Object-storage buckets
//!
//! Calls are plain request/response with no retries. Callers decide on retry
//! and compensation. Implementations are injected as `Arc<dyn CloudProvider>`.

mod mock;
mod timeweb;

pub use mock::{MockOp, MockProvider};
pub use timeweb::{TimewebClient, TimewebConfig, DEFAULT_API_URL, DEFAULT_TIMEOUT};

use async_trait::async_trait;
use pgfleet_id::ExternalDbRef;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, instrument, warn};

use crate::model::DatabaseCredentials;
use crate::status::ProvisionStatus;

/// Result type for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// The provider rejected a call or could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("provider error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct ProviderError {
    /// HTTP status, absent for transport failures and timeouts.
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

/// Parameters for a new cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub name: String,
    pub preset_id: i64,
    pub region: String,
    pub login: String,
}

/// A cluster as reported by the provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCluster {
    pub cluster_id: i64,
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub status: ProvisionStatus,
}

impl std::fmt::Debug for ProviderCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCluster")
            .field("cluster_id", &self.cluster_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A database inside a provider cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDatabase {
    pub db_id: i64,
    pub name: String,
}

/// A Postgres size preset offered in a location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preset {
    pub id: i64,
    pub description: String,
    pub disk_mb: i64,
    pub cpu: i32,
    pub ram_mb: i64,
    /// Monthly price in minor currency units.
    pub price_monthly: i64,
    pub location: String,
}

/// Parameters for a new bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSpec {
    pub name: String,
    pub public: bool,
    pub preset_id: i64,
}

/// An S3-compatible bucket.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Bucket {
    pub id: i64,
    pub name: String,
    pub public: bool,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub used_space: Option<i64>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("public", &self.public)
            .field("endpoint", &self.endpoint)
            .field("used_space", &self.used_space)
            .finish_non_exhaustive()
    }
}

/// Cloud infrastructure API.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create an empty cluster. The returned status is usually `provisioning`.
    async fn create_cluster(&self, spec: &ClusterSpec) -> ProviderResult<ProviderCluster>;

    /// Fetch a cluster including its admin login.
    async fn get_cluster(&self, cluster_id: i64) -> ProviderResult<ProviderCluster>;

    /// Current normalized status of a cluster.
    async fn get_cluster_status(&self, cluster_id: i64) -> ProviderResult<ProvisionStatus> {
        Ok(self.get_cluster(cluster_id).await?.status)
    }

    /// Move a cluster to another preset. The provider preserves data.
    async fn resize_cluster(&self, cluster_id: i64, preset_id: i64)
        -> ProviderResult<ProvisionStatus>;

    async fn delete_cluster(&self, cluster_id: i64) -> ProviderResult<()>;

    async fn add_database(&self, cluster_id: i64, name: &str) -> ProviderResult<ProviderDatabase>;

    async fn get_database(&self, cluster_id: i64, db_id: i64) -> ProviderResult<ProviderDatabase>;

    async fn delete_database(&self, cluster_id: i64, db_id: i64) -> ProviderResult<()>;

    /// Postgres presets available in `region`.
    async fn list_presets(&self, region: &str) -> ProviderResult<Vec<Preset>>;

    async fn create_bucket(&self, spec: &BucketSpec) -> ProviderResult<Bucket>;

    async fn get_bucket(&self, bucket_id: i64) -> ProviderResult<Bucket>;

    async fn update_bucket(&self, bucket_id: i64, public: bool) -> ProviderResult<()>;

    async fn delete_bucket(&self, bucket_id: i64) -> ProviderResult<()>;
}

/// A freshly created dedicated cluster with its single database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedicatedInstance {
    pub external_ref: ExternalDbRef,
    pub status: ProvisionStatus,
    pub credentials: DatabaseCredentials,
}

/// Create a dedicated cluster holding one database named after `slug`.
///
/// If the database cannot be created the cluster is deleted again; a failing
/// cleanup is logged and the original error returned.
#[instrument(skip(provider), fields(slug = %slug, region = %region))]
pub async fn create_dedicated(
    provider: &dyn CloudProvider,
    slug: &str,
    region: &str,
    preset_id: i64,
) -> ProviderResult<DedicatedInstance> {
    let db_name = sanitize_db_name(slug);
    let spec = ClusterSpec {
        name: format!("pgf-{db_name}"),
        preset_id,
        region: region.to_string(),
        login: dedicated_login(&db_name),
    };

    let cluster = provider.create_cluster(&spec).await?;

    let database = match provider.add_database(cluster.cluster_id, &db_name).await {
        Ok(database) => database,
        Err(e) => {
            warn!(cluster_id = cluster.cluster_id, error = %e, "Database creation failed; removing cluster");
            if let Err(cleanup) = provider.delete_cluster(cluster.cluster_id).await {
                error!(cluster_id = cluster.cluster_id, error = %cleanup, "Failed to remove orphaned cluster");
            }
            return Err(e);
        }
    };

    Ok(DedicatedInstance {
        external_ref: ExternalDbRef::new(cluster.cluster_id, database.db_id),
        status: cluster.status,
        credentials: DatabaseCredentials {
            host: cluster.host,
            port: cluster.port,
            name: database.name,
            user: cluster.login,
            password: cluster.password,
        },
    })
}

/// Current credentials of a dedicated database.
pub async fn dedicated_credentials(
    provider: &dyn CloudProvider,
    external_ref: ExternalDbRef,
) -> ProviderResult<DatabaseCredentials> {
    let cluster = provider.get_cluster(external_ref.cluster_id).await?;
    let database = provider
        .get_database(external_ref.cluster_id, external_ref.db_id)
        .await?;

    Ok(DatabaseCredentials {
        host: cluster.host,
        port: cluster.port,
        name: database.name,
        user: cluster.login,
        password: cluster.password,
    })
}

/// Maximum length of a provider database name.
pub const MAX_DB_NAME_LEN: usize = 32;

/// Replace everything outside `[A-Za-z0-9_]` with `_` and cap the length.
pub fn sanitize_db_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(MAX_DB_NAME_LEN)
        .collect()
}

fn dedicated_login(db_name: &str) -> String {
    let prefix: String = db_name.chars().take(8).collect();
    format!("user_{prefix}")
}

/// Random 24-character alphanumeric password for a new cluster login.
pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Provider location code for a platform region.
pub fn region_to_location(region: &str) -> &'static str {
    match region {
        "ru-msk" => "ru-1",
        "ru-spb" => "ru-2",
        "pl-waw" => "pl-1",
        "kz-ast" => "kz-1",
        _ => "ru-1",
    }
}
