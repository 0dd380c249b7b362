//! Fixtures shared by unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::Project;
use crate::plans::{PlanCatalog, PoolConfig, PoolType};
use crate::pool::ClusterPool;
use crate::provider::MockProvider;
use crate::store::{MemoryStore, Store};

/// Default catalogue with every pool capped at `max_databases`.
pub(crate) fn catalog_with_capacity(max_databases: i32) -> PlanCatalog {
    let defaults = PlanCatalog::default();
    let pools = [PoolType::Free, PoolType::Starter]
        .into_iter()
        .filter_map(|pool| {
            defaults.pool(pool).map(|config| {
                (
                    pool,
                    PoolConfig {
                        max_databases,
                        ..config
                    },
                )
            })
        })
        .collect::<BTreeMap<_, _>>();
    PlanCatalog::new(defaults.plans().to_vec(), pools).unwrap()
}

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<MockProvider>,
    pub catalog: Arc<PlanCatalog>,
    pub pool: Arc<ClusterPool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_catalog(PlanCatalog::default())
    }

    pub fn with_capacity(max_databases: i32) -> Self {
        Self::with_catalog(catalog_with_capacity(max_databases))
    }

    pub fn with_catalog(catalog: PlanCatalog) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let catalog = Arc::new(catalog);
        let pool = Arc::new(ClusterPool::new(
            store.clone(),
            provider.clone(),
            catalog.clone(),
        ));
        Self {
            store,
            provider,
            catalog,
            pool,
        }
    }

    /// Insert a `pending` project on `plan_id`.
    pub async fn project(&self, slug: &str, plan_id: &str) -> Project {
        let plan = self.catalog.get(plan_id).unwrap();
        let project = Project::new(slug, "ru-msk", plan);
        self.store.insert_project(&project).await.unwrap();
        project
    }
}
