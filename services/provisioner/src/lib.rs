//! pgfleet provisioner library.
//!
//! This crate primarily ships the `pgfleet` binary, but we expose the
//! orchestration surface to enable integration testing and embedding.

pub mod config;
pub mod db;
pub mod error;
pub mod migration;
pub mod model;
pub mod orchestrator;
pub mod plans;
pub mod pool;
pub mod provider;
pub mod provisioner;
pub mod reconciler;
pub mod status;
pub mod store;
pub mod tasks;
pub mod workers;

#[cfg(test)]
mod test_support;
