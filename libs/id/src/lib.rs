//! # pgfleet-id
//!
//! Typed identifiers used by the pgfleet provisioner.
//!
//! Locally generated records (projects, shared clusters, background tasks)
//! use a prefixed ULID: `{prefix}_{ulid}`, for example
//! `prj_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix makes it impossible to hand
//! a cluster id to an API that expects a project id, and the ULID keeps ids
//! sortable by creation time.
//!
//! Resources owned by the cloud provider are addressed by the provider's own
//! numeric ids. A dedicated database is referenced by the pair
//! `{cluster_id}:{db_id}` ([`ExternalDbRef`]).

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
