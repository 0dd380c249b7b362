//! Lifecycle states for projects and shared clusters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unknown status string read from storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

/// Lifecycle state of a project's database, surfaced to callers for polling.
///
/// ```text
/// pending -> provisioning -> ready | error
/// ready   -> upgrading    -> ready | error
/// ready | error -> deleting -> deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStatus {
    Pending,
    Provisioning,
    Ready,
    Error,
    Upgrading,
    Deleting,
    Deleted,
}

impl ProvisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Upgrading => "upgrading",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }

    /// States that only change through a new explicit request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Error | Self::Deleted)
    }

    /// States that mean some operation is in flight for the project.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provisioning | Self::Upgrading | Self::Deleting)
    }
}

impl fmt::Display for ProvisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "provisioning" => Self::Provisioning,
            "ready" => Self::Ready,
            "error" => Self::Error,
            "upgrading" => Self::Upgrading,
            "deleting" => Self::Deleting,
            "deleted" => Self::Deleted,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Lifecycle state of a shared cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// The provider is still creating the cluster.
    Provisioning,
    /// Accepting tenant databases.
    Ready,
    /// `db_count == max_databases`.
    Full,
    /// Scheduled for decommission; deleted once empty.
    Draining,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Full => "full",
            Self::Draining => "draining",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "provisioning" => Self::Provisioning,
            "ready" => Self::Ready,
            "full" => Self::Full,
            "draining" => Self::Draining,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Normalize a provider cluster status string.
///
/// The provider reports its own vocabulary (including the `stoped` spelling);
/// anything unrecognized is treated as still provisioning.
pub fn map_provider_status(status: &str) -> ProvisionStatus {
    match status {
        "started" => ProvisionStatus::Ready,
        "starting" => ProvisionStatus::Provisioning,
        "stoped" => ProvisionStatus::Pending,
        "no_paid" => ProvisionStatus::Error,
        "updating" => ProvisionStatus::Upgrading,
        _ => ProvisionStatus::Provisioning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("started", ProvisionStatus::Ready)]
    #[case("starting", ProvisionStatus::Provisioning)]
    #[case("stoped", ProvisionStatus::Pending)]
    #[case("no_paid", ProvisionStatus::Error)]
    #[case("updating", ProvisionStatus::Upgrading)]
    #[case("rebooting", ProvisionStatus::Provisioning)]
    #[case("", ProvisionStatus::Provisioning)]
    fn test_map_provider_status(#[case] raw: &str, #[case] expected: ProvisionStatus) {
        assert_eq!(map_provider_status(raw), expected);
    }

    #[test]
    fn test_provision_status_parse_matches_display() {
        for status in [
            ProvisionStatus::Pending,
            ProvisionStatus::Provisioning,
            ProvisionStatus::Ready,
            ProvisionStatus::Error,
            ProvisionStatus::Upgrading,
            ProvisionStatus::Deleting,
            ProvisionStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<ProvisionStatus>(), Ok(status));
        }
        assert!("stopped".parse::<ProvisionStatus>().is_err());
    }

    #[test]
    fn test_terminal_and_transient_are_disjoint() {
        assert!(ProvisionStatus::Ready.is_terminal());
        assert!(ProvisionStatus::Error.is_terminal());
        assert!(!ProvisionStatus::Pending.is_terminal());
        assert!(ProvisionStatus::Upgrading.is_transient());
        assert!(!ProvisionStatus::Ready.is_transient());
        assert!(!ProvisionStatus::Pending.is_transient());
    }

    #[test]
    fn test_cluster_status_serde() {
        let json = serde_json::to_string(&ClusterStatus::Draining).unwrap();
        assert_eq!(json, "\"draining\"");
        assert_eq!("full".parse::<ClusterStatus>(), Ok(ClusterStatus::Full));
    }
}
