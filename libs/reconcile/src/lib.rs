//! Reconciliation primitives.
//!
//! Provisioned resources live at a cloud provider and converge on their own
//! schedule. This library holds the pieces shared by every loop that waits
//! for such a resource:
//!
//! - **Convergence status**: the answer one observation gives.
//! - **Poll policy**: a fixed interval with a bounded number of attempts.
//! - **Retry tracking**: per-resource failure budgets for periodic workers,
//!   after which the worker gives up on the resource.
//!
//! # Invariants
//!
//! - A poll never sleeps after its final attempt
//! - A diverged observation ends the poll immediately

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError<E> {
    /// The resource did not converge within the attempt budget.
    #[error("{resource} did not converge after {attempts} attempts ({elapsed:?})")]
    Timeout {
        resource: String,
        attempts: u32,
        elapsed: Duration,
    },

    /// The resource reached a state it cannot recover from on its own.
    #[error("{resource} diverged")]
    Diverged { resource: String },

    /// The observation itself failed.
    #[error(transparent)]
    Observe(E),
}

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (current matches desired).
    Converged,

    /// Resource is converging (current is moving toward desired).
    Converging,

    /// Resource has diverged (requires intervention).
    Diverged,
}

/// Fixed-interval polling with a bounded attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between two observations.
    pub interval: Duration,

    /// Maximum number of observations.
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_POLL_ATTEMPTS)
    }
}

/// Observe `resource` until it converges, diverges, or the policy runs out.
///
/// Observation errors abort the poll; callers that want to tolerate flaky
/// observations should fold them into [`ConvergenceStatus::Converging`].
pub async fn poll_until<F, Fut, E>(
    resource: &str,
    policy: PollPolicy,
    mut observe: F,
) -> Result<u32, ReconcileError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ConvergenceStatus, E>>,
{
    let started = Instant::now();

    for attempt in 1..=policy.max_attempts {
        match observe().await.map_err(ReconcileError::Observe)? {
            ConvergenceStatus::Converged => {
                debug!(resource, attempt, "resource converged");
                return Ok(attempt);
            }
            ConvergenceStatus::Diverged => {
                return Err(ReconcileError::Diverged {
                    resource: resource.to_string(),
                });
            }
            ConvergenceStatus::Converging => {
                debug!(resource, attempt, "resource still converging");
            }
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(ReconcileError::Timeout {
        resource: resource.to_string(),
        attempts: policy.max_attempts,
        elapsed: started.elapsed(),
    })
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default delay between readiness observations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of readiness observations (~5 minutes at the default interval).
pub const DEFAULT_POLL_ATTEMPTS: u32 = 30;

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default retry limit per resource.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);
