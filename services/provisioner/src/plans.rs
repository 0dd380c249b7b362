//! Pricing plans and shared pool sizing.
//!
//! Plans are static configuration. The built-in catalogue can be replaced at
//! startup by a TOML file with the same shape:
//!
//! ```toml
//! [[plans]]
//! id = "free"
//! name = "Free"
//! db_size_mb = 500
//! storage_mb = 1000
//! price_monthly = 0
//! preset_id = 1
//! pool = "free"
//!
//! [pools.free]
//! preset_id = 2
//! max_databases = 300
//! ```
//!
//! Plan order matters: a plan may only be upgraded to a plan listed after it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Catalogue loading/validation errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read plan catalogue {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid plan catalogue: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate plan id '{0}'")]
    DuplicatePlan(String),

    #[error("plan '{plan}' uses pool '{pool}' which has no pool configuration")]
    MissingPool { plan: String, pool: PoolType },

    #[error("pool '{0}' must allow at least one database")]
    EmptyPool(PoolType),
}

/// Capacity bucket a shared cluster serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    Free,
    Starter,
}

impl PoolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
        }
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PoolType {
    type Err = crate::status::UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            other => Err(crate::status::UnknownStatus(other.to_string())),
        }
    }
}

// Deserialized through the string form so pool types also work as TOML table keys.
impl<'de> Deserialize<'de> for PoolType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Sizing of the clusters backing one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Provider preset used when a new cluster is created for the pool.
    pub preset_id: i64,

    /// Tenant databases a single cluster may host.
    pub max_databases: i32,
}

/// Where a plan's databases live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanTier {
    Shared(PoolType),
    Dedicated,
}

/// A pricing plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub db_size_mb: i32,
    pub storage_mb: i32,
    /// Monthly price in minor currency units.
    pub price_monthly: i64,
    /// Provider preset for dedicated clusters of this plan.
    pub preset_id: i64,
    /// Set for plans served from a shared pool.
    #[serde(default)]
    pub pool: Option<PoolType>,
}

impl Plan {
    pub fn tier(&self) -> PlanTier {
        match self.pool {
            Some(pool) => PlanTier::Shared(pool),
            None => PlanTier::Dedicated,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.pool.is_some()
    }
}

/// Immutable set of plans and pool sizes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
    pools: BTreeMap<PoolType, PoolConfig>,
}

impl PlanCatalog {
    /// Build and validate a catalogue.
    pub fn new(
        plans: Vec<Plan>,
        pools: BTreeMap<PoolType, PoolConfig>,
    ) -> Result<Self, CatalogError> {
        let catalog = Self { plans, pools };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parse a catalogue from TOML.
    pub fn from_toml(source: &str) -> Result<Self, CatalogError> {
        let catalog: Self = toml::from_str(source)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalogue from a TOML file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let source = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&source)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for plan in &self.plans {
            if !seen.insert(plan.id.as_str()) {
                return Err(CatalogError::DuplicatePlan(plan.id.clone()));
            }
            if let Some(pool) = plan.pool {
                if !self.pools.contains_key(&pool) {
                    return Err(CatalogError::MissingPool {
                        plan: plan.id.clone(),
                        pool,
                    });
                }
            }
        }
        for (pool, config) in &self.pools {
            if config.max_databases < 1 {
                return Err(CatalogError::EmptyPool(*pool));
            }
        }
        Ok(())
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn get(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    pub fn pool(&self, pool: PoolType) -> Option<PoolConfig> {
        self.pools.get(&pool).copied()
    }

    /// Whether `new_plan_id` ranks strictly above `current_plan_id`.
    ///
    /// Unknown plans never qualify.
    pub fn can_upgrade(&self, current_plan_id: &str, new_plan_id: &str) -> bool {
        let rank = |id: &str| self.plans.iter().position(|p| p.id == id);
        match (rank(current_plan_id), rank(new_plan_id)) {
            (Some(current), Some(new)) => new > current,
            _ => false,
        }
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let plans = vec![
            Plan {
                id: "free".to_string(),
                name: "Free".to_string(),
                db_size_mb: 500,
                storage_mb: 1000,
                price_monthly: 0,
                preset_id: 1,
                pool: Some(PoolType::Free),
            },
            Plan {
                id: "starter".to_string(),
                name: "Starter".to_string(),
                db_size_mb: 5000,
                storage_mb: 10000,
                price_monthly: 99000,
                preset_id: 2,
                pool: Some(PoolType::Starter),
            },
            Plan {
                id: "pro".to_string(),
                name: "Pro".to_string(),
                db_size_mb: 20000,
                storage_mb: 50000,
                price_monthly: 299000,
                preset_id: 3,
                pool: None,
            },
            Plan {
                id: "business".to_string(),
                name: "Business".to_string(),
                db_size_mb: 100000,
                storage_mb: 200000,
                price_monthly: 999000,
                preset_id: 4,
                pool: None,
            },
        ];

        let pools = BTreeMap::from([
            (
                PoolType::Free,
                PoolConfig {
                    preset_id: 2,
                    max_databases: 300,
                },
            ),
            (
                PoolType::Starter,
                PoolConfig {
                    preset_id: 3,
                    max_databases: 100,
                },
            ),
        ]);

        Self { plans, pools }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_is_valid() {
        let catalog = PlanCatalog::default();
        catalog.validate().unwrap();
        assert_eq!(catalog.plans().len(), 4);
        assert_eq!(catalog.get("free").unwrap().tier(), PlanTier::Shared(PoolType::Free));
        assert_eq!(catalog.get("pro").unwrap().tier(), PlanTier::Dedicated);
        assert_eq!(catalog.pool(PoolType::Free).unwrap().max_databases, 300);
        assert!(catalog.get("enterprise").is_none());
    }

    #[test]
    fn test_can_upgrade_follows_catalog_order() {
        let catalog = PlanCatalog::default();
        assert!(catalog.can_upgrade("free", "starter"));
        assert!(catalog.can_upgrade("starter", "pro"));
        assert!(catalog.can_upgrade("pro", "business"));
        assert!(!catalog.can_upgrade("business", "pro"));
        assert!(!catalog.can_upgrade("pro", "pro"));
        assert!(!catalog.can_upgrade("free", "enterprise"));
    }

    #[test]
    fn test_from_toml() {
        let catalog = PlanCatalog::from_toml(
            r#"
            [[plans]]
            id = "hobby"
            name = "Hobby"
            db_size_mb = 100
            storage_mb = 100
            price_monthly = 0
            preset_id = 1
            pool = "free"

            [[plans]]
            id = "team"
            name = "Team"
            db_size_mb = 10000
            storage_mb = 10000
            price_monthly = 100
            preset_id = 7

            [pools.free]
            preset_id = 2
            max_databases = 10
            "#,
        )
        .unwrap();

        assert!(catalog.get("hobby").unwrap().is_shared());
        assert!(!catalog.get("team").unwrap().is_shared());
        assert_eq!(catalog.pool(PoolType::Free).unwrap().max_databases, 10);
        assert!(catalog.pool(PoolType::Starter).is_none());
    }

    #[test]
    fn test_shared_plan_requires_pool_config() {
        let err = PlanCatalog::from_toml(
            r#"
            pools = {}

            [[plans]]
            id = "starter"
            name = "Starter"
            db_size_mb = 1
            storage_mb = 1
            price_monthly = 1
            preset_id = 2
            pool = "starter"
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, CatalogError::MissingPool { .. }));
    }

    #[test]
    fn test_duplicate_plan_rejected() {
        let mut plans = PlanCatalog::default().plans().to_vec();
        plans.push(plans[0].clone());
        let err = PlanCatalog::new(plans, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicatePlan(id) if id == "free"));
    }
}
