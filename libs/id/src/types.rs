//! Identifier definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{define_id, IdError};

define_id!(
    /// A tenant project.
    ProjectId,
    "prj"
);
define_id!(
    /// A locally tracked shared database cluster.
    ClusterId,
    "scl"
);
define_id!(
    /// A background provisioning, upgrade or deprovision task.
    TaskId,
    "task"
);

// =============================================================================
// Provider references
// =============================================================================

/// Reference to a dedicated database at the cloud provider.
///
/// Formatted as `{cluster_id}:{db_id}`, the same shape the provider's API
/// paths use (`/dbs/{cluster_id}/dbs/{db_id}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalDbRef {
    pub cluster_id: i64,
    pub db_id: i64,
}

impl ExternalDbRef {
    #[must_use]
    pub const fn new(cluster_id: i64, db_id: i64) -> Self {
        Self { cluster_id, db_id }
    }
}

impl fmt::Display for ExternalDbRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cluster_id, self.db_id)
    }
}

impl FromStr for ExternalDbRef {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let (cluster, db) = s.split_once(':').ok_or(IdError::MissingSeparator(':'))?;
        let parse = |part: &str| {
            part.parse::<i64>()
                .map_err(|_| IdError::InvalidProviderId(part.to_string()))
        };

        Ok(Self::new(parse(cluster)?, parse(db)?))
    }
}

impl Serialize for ExternalDbRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExternalDbRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
