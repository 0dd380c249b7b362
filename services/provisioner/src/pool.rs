//! Shared cluster pool.
//!
//! Small tenants share physical clusters. The pool picks the fullest ready
//! cluster with a free slot for a (region, pool) pair and only creates a new
//! cluster when none exists. Slot accounting goes through the store's atomic
//! reserve/release so `0 <= db_count <= max_databases` holds under any
//! interleaving.

use std::sync::Arc;

use chrono::{Duration, Utc};
use pgfleet_id::ClusterId;
use tracing::{debug, error, info, instrument, warn};

use crate::error::PoolError;
use crate::model::{DatabaseCredentials, SharedCluster};
use crate::plans::{PlanCatalog, PoolType};
use crate::provider::{sanitize_db_name, CloudProvider, ClusterSpec};
use crate::status::{ClusterStatus, ProvisionStatus};
use crate::store::{ClusterAttachment, ClusterClaim, Store};

/// Admin login created on every shared cluster.
pub const SHARED_ADMIN_LOGIN: &str = "admin";

/// A tenant database placed on a shared cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantDatabase {
    pub cluster_id: ClusterId,
    pub db_id: i64,
    pub credentials: DatabaseCredentials,
}

/// Result of [`ClusterPool::drain_cluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The cluster still hosts databases and is removed with the last one.
    Draining { remaining: i32 },
    /// The cluster was empty and has been deleted.
    Removed,
}

pub struct ClusterPool {
    store: Arc<dyn Store>,
    provider: Arc<dyn CloudProvider>,
    catalog: Arc<PlanCatalog>,
}

impl ClusterPool {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn CloudProvider>,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        Self {
            store,
            provider,
            catalog,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn CloudProvider> {
        &self.provider
    }

    pub fn catalog(&self) -> &Arc<PlanCatalog> {
        &self.catalog
    }

    /// The ready cluster with the most databases that still has room.
    pub async fn find_available_cluster(
        &self,
        region: &str,
        pool_type: PoolType,
    ) -> Result<Option<SharedCluster>, PoolError> {
        Ok(self.store.find_available_cluster(region, pool_type).await?)
    }

    /// A cluster that has room now or will once it boots.
    ///
    /// Prefers an available cluster, then one already being created for the
    /// pair, and only then creates a new one. The returned cluster may still
    /// be `provisioning`.
    #[instrument(skip(self), fields(region = %region, pool_type = %pool_type))]
    pub async fn ensure_available_cluster(
        &self,
        region: &str,
        pool_type: PoolType,
    ) -> Result<SharedCluster, PoolError> {
        if let Some(cluster) = self.find_available_cluster(region, pool_type).await? {
            return Ok(cluster);
        }

        let config = self
            .catalog
            .pool(pool_type)
            .ok_or_else(|| PoolError::UnknownPool(pool_type.to_string()))?;
        let placeholder =
            SharedCluster::claim(region, pool_type, config.preset_id, config.max_databases);

        match self.store.claim_cluster_slot(&placeholder).await? {
            ClusterClaim::Existing(cluster) => {
                debug!(cluster_id = %cluster.id, "Joining cluster already being created");
                Ok(cluster)
            }
            ClusterClaim::Claimed(claim) => {
                // A cluster may have become ready between the lookup and the claim.
                if let Some(cluster) = self.find_available_cluster(region, pool_type).await? {
                    self.discard_claim(claim.id).await;
                    return Ok(cluster);
                }
                self.create_claimed_cluster(claim).await
            }
        }
    }

    async fn create_claimed_cluster(&self, claim: SharedCluster) -> Result<SharedCluster, PoolError> {
        let spec = ClusterSpec {
            name: format!(
                "{}-{}-{}",
                claim.pool_type,
                claim.region,
                Utc::now().timestamp_millis()
            ),
            preset_id: claim.preset_id,
            region: claim.region.clone(),
            login: SHARED_ADMIN_LOGIN.to_string(),
        };

        info!(cluster_id = %claim.id, name = %spec.name, preset_id = spec.preset_id, "Creating shared cluster");

        let created = match self.provider.create_cluster(&spec).await {
            Ok(created) => created,
            Err(e) => {
                warn!(cluster_id = %claim.id, error = %e, "Shared cluster creation failed; releasing claim");
                self.discard_claim(claim.id).await;
                return Err(e.into());
            }
        };

        let attachment = ClusterAttachment {
            external_id: created.cluster_id,
            host: created.host,
            port: created.port,
            admin_user: created.login,
            admin_password: created.password,
        };

        let attached = match self.store.attach_cluster_resource(claim.id, &attachment).await {
            Ok(attached) => attached,
            Err(e) => {
                error!(cluster_id = %claim.id, external_id = created.cluster_id, error = %e, "Failed to record new cluster; deleting it");
                if let Err(cleanup) = self.provider.delete_cluster(created.cluster_id).await {
                    error!(external_id = created.cluster_id, error = %cleanup, "Failed to delete unrecorded cluster");
                }
                self.discard_claim(claim.id).await;
                return Err(e.into());
            }
        };

        if created.status == ProvisionStatus::Ready {
            self.store
                .set_cluster_status(attached.id, &[ClusterStatus::Provisioning], ClusterStatus::Ready)
                .await?;
            return Ok(self.store.get_cluster(attached.id).await?);
        }

        Ok(attached)
    }

    async fn discard_claim(&self, cluster_id: ClusterId) {
        if let Err(e) = self.store.delete_cluster(cluster_id).await {
            error!(cluster_id = %cluster_id, error = %e, "Failed to remove cluster claim");
        }
    }

    /// Create a tenant database on a shared cluster.
    ///
    /// The slot is reserved before the provider is called and handed back if
    /// the provider fails, so a failure never changes `db_count`.
    #[instrument(skip(self, tenant_slug), fields(cluster_id = %cluster_id, tenant = %tenant_slug))]
    pub async fn add_database_to_cluster(
        &self,
        cluster_id: ClusterId,
        tenant_slug: &str,
    ) -> Result<TenantDatabase, PoolError> {
        let Some(cluster) = self.store.reserve_slot(cluster_id).await? else {
            let cluster = self.store.get_cluster(cluster_id).await?;
            return Err(match cluster.status {
                ClusterStatus::Ready | ClusterStatus::Full => PoolError::Capacity {
                    cluster_id,
                    max_databases: cluster.max_databases,
                },
                status => PoolError::ClusterNotReady { cluster_id, status },
            });
        };

        let Some(external_id) = cluster.external_id else {
            self.release_reserved(cluster_id).await;
            return Err(PoolError::ClusterNotReady {
                cluster_id,
                status: ClusterStatus::Provisioning,
            });
        };

        let name = sanitize_db_name(tenant_slug);
        match self.provider.add_database(external_id, &name).await {
            Ok(database) => {
                info!(db_id = database.db_id, db_count = cluster.db_count, "Tenant database created");
                Ok(TenantDatabase {
                    cluster_id,
                    db_id: database.db_id,
                    credentials: cluster.credentials_for(&database.name),
                })
            }
            Err(e) => {
                warn!(error = %e, "Tenant database creation failed; releasing slot");
                self.release_reserved(cluster_id).await;
                Err(e.into())
            }
        }
    }

    async fn release_reserved(&self, cluster_id: ClusterId) {
        if let Err(e) = self.store.release_slot(cluster_id).await {
            error!(cluster_id = %cluster_id, error = %e, "Failed to release reserved slot");
        }
    }

    /// Delete a tenant database and free its slot.
    ///
    /// A database the provider no longer knows counts as deleted. A draining
    /// cluster left empty is deleted as well.
    #[instrument(skip(self), fields(cluster_id = %cluster_id))]
    pub async fn remove_database_from_cluster(
        &self,
        cluster_id: ClusterId,
        db_id: i64,
    ) -> Result<(), PoolError> {
        let cluster = self.store.get_cluster(cluster_id).await?;
        let external_id = cluster.external_id.ok_or(PoolError::ClusterNotReady {
            cluster_id,
            status: cluster.status,
        })?;

        match self.provider.delete_database(external_id, db_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Tenant database already gone at the provider");
            }
            Err(e) => return Err(e.into()),
        }

        match self.store.release_slot(cluster_id).await? {
            Some(released) => {
                debug!(db_count = released.db_count, status = %released.status, "Slot released");
                if released.status == ClusterStatus::Draining && released.db_count == 0 {
                    self.teardown(&released).await?;
                }
            }
            None => warn!("Cluster had no slot to release"),
        }
        Ok(())
    }

    async fn teardown(&self, cluster: &SharedCluster) -> Result<(), PoolError> {
        info!(cluster_id = %cluster.id, external_id = ?cluster.external_id, "Deleting drained cluster");
        if let Some(external_id) = cluster.external_id {
            match self.provider.delete_cluster(external_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.store.delete_cluster(cluster.id).await?;
        Ok(())
    }

    /// Promote a booting cluster once the provider reports it ready.
    ///
    /// A no-op for clusters that are not `provisioning`.
    #[instrument(skip(self), fields(cluster_id = %cluster_id))]
    pub async fn refresh_cluster_status(
        &self,
        cluster_id: ClusterId,
    ) -> Result<ClusterStatus, PoolError> {
        let cluster = self.store.get_cluster(cluster_id).await?;
        if cluster.status != ClusterStatus::Provisioning {
            return Ok(cluster.status);
        }
        // Claimed but not yet created at the provider.
        let Some(external_id) = cluster.external_id else {
            return Ok(ClusterStatus::Provisioning);
        };

        let remote = self.provider.get_cluster(external_id).await?;
        if remote.status != ProvisionStatus::Ready {
            debug!(provider_status = %remote.status, "Cluster still booting");
            return Ok(ClusterStatus::Provisioning);
        }

        // Hosts are often only assigned once the cluster is up.
        if !remote.host.is_empty() && (remote.host != cluster.host || remote.port != cluster.port) {
            let attachment = ClusterAttachment {
                external_id,
                host: remote.host,
                port: remote.port,
                admin_user: cluster.admin_user.clone(),
                admin_password: cluster.admin_password.clone(),
            };
            self.store.attach_cluster_resource(cluster_id, &attachment).await?;
        }

        if self
            .store
            .set_cluster_status(cluster_id, &[ClusterStatus::Provisioning], ClusterStatus::Ready)
            .await?
        {
            info!("Shared cluster ready");
            return Ok(ClusterStatus::Ready);
        }
        Ok(self.store.get_cluster(cluster_id).await?.status)
    }

    /// Stop placing databases on a cluster and delete it once empty.
    #[instrument(skip(self), fields(cluster_id = %cluster_id))]
    pub async fn drain_cluster(&self, cluster_id: ClusterId) -> Result<DrainOutcome, PoolError> {
        let moved = self
            .store
            .set_cluster_status(
                cluster_id,
                &[ClusterStatus::Ready, ClusterStatus::Full],
                ClusterStatus::Draining,
            )
            .await?;

        let cluster = self.store.get_cluster(cluster_id).await?;
        if !moved && cluster.status != ClusterStatus::Draining {
            return Err(PoolError::ClusterNotReady {
                cluster_id,
                status: cluster.status,
            });
        }

        if cluster.db_count == 0 {
            self.teardown(&cluster).await?;
            return Ok(DrainOutcome::Removed);
        }

        info!(remaining = cluster.db_count, "Cluster draining");
        Ok(DrainOutcome::Draining {
            remaining: cluster.db_count,
        })
    }

    /// Delete claims whose creator died before reaching the provider.
    ///
    /// A claim blocks new clusters for its pair, so one left behind by a
    /// crashed process must not live forever.
    pub async fn reap_stale_claims(&self, max_age: Duration) -> Result<usize, PoolError> {
        let cutoff = Utc::now() - max_age;
        let mut reaped = 0;
        for cluster in self.store.list_clusters().await? {
            if cluster.status == ClusterStatus::Provisioning
                && cluster.external_id.is_none()
                && cluster.created_at < cutoff
            {
                warn!(cluster_id = %cluster.id, "Removing stale cluster claim");
                self.store.delete_cluster(cluster.id).await?;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Refresh every booting cluster; returns how many became ready.
    pub async fn refresh_provisioning_clusters(&self) -> Result<usize, PoolError> {
        let mut promoted = 0;
        for cluster in self.store.list_clusters().await? {
            if cluster.status != ClusterStatus::Provisioning || cluster.external_id.is_none() {
                continue;
            }
            match self.refresh_cluster_status(cluster.id).await {
                Ok(ClusterStatus::Ready) => promoted += 1,
                Ok(_) => {}
                Err(e) => warn!(cluster_id = %cluster.id, error = %e, "Cluster refresh failed"),
            }
        }
        Ok(promoted)
    }
}
