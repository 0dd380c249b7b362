//! Durable in-flight markers for background work.
//!
//! Every provisioning, upgrade or teardown run is recorded as a `running`
//! task with a deadline before it starts. If the process dies mid-run the
//! record stays `running` past its deadline, and the reconciler abandons it
//! and fails the project. If the record cannot be written the project, already
//! claimed by the caller, is failed on the spot.

use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use pgfleet_id::{ProjectId, TaskId};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info_span, warn, Instrument};

use crate::error::OrchestratorResult;
use crate::model::{TaskKind, TaskRecord, TaskState};
use crate::provisioner::persist_error;
use crate::store::Store;

/// Deadline for one task unless configured otherwise.
pub const DEFAULT_TASK_DEADLINE_SECS: i64 = 15 * 60;

/// A task running in the background.
pub struct TaskHandle<T> {
    pub task_id: TaskId,
    handle: JoinHandle<OrchestratorResult<T>>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task. Fails only if the task panicked or was aborted.
    pub async fn join(self) -> Result<OrchestratorResult<T>, JoinError> {
        self.handle.await
    }
}

#[derive(Clone)]
pub struct TaskRunner {
    store: Arc<dyn Store>,
    max_duration: Duration,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn Store>, max_duration: Duration) -> Self {
        Self {
            store,
            max_duration,
        }
    }

    async fn record(&self, project_id: ProjectId, kind: TaskKind) -> OrchestratorResult<TaskRecord> {
        let record = TaskRecord::start(project_id, kind, self.max_duration);
        if let Err(e) = self.store.insert_task(&record).await {
            let cause = format!("failed to record {} task: {e}", kind.as_str());
            persist_error(self.store.as_ref(), project_id, &cause).await;
            return Err(e.into());
        }
        Ok(record)
    }

    /// Record a task and run `work` inline.
    pub async fn run<F, T>(&self, project_id: ProjectId, kind: TaskKind, work: F) -> OrchestratorResult<T>
    where
        F: Future<Output = OrchestratorResult<T>>,
    {
        let record = self.record(project_id, kind).await?;

        let result = work.await;
        let (state, message) = outcome(&result);
        finish(self.store.as_ref(), record.id, state, message).await;
        result
    }

    /// Record a task and run `work` on the runtime.
    pub async fn spawn<F, T>(
        &self,
        project_id: ProjectId,
        kind: TaskKind,
        work: F,
    ) -> OrchestratorResult<TaskHandle<T>>
    where
        F: Future<Output = OrchestratorResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let record = self.record(project_id, kind).await?;

        let store = self.store.clone();
        let task_id = record.id;
        let span = info_span!("task", task_id = %task_id, project_id = %project_id, kind = kind.as_str());
        let handle = tokio::spawn(
            async move {
                let result = work.await;
                let (state, message) = outcome(&result);
                finish(store.as_ref(), task_id, state, message).await;
                result
            }
            .instrument(span),
        );

        Ok(TaskHandle { task_id, handle })
    }
}

fn outcome<T>(result: &OrchestratorResult<T>) -> (TaskState, Option<String>) {
    match result {
        Ok(_) => (TaskState::Succeeded, None),
        Err(e) => (TaskState::Failed, Some(e.to_string())),
    }
}

async fn finish(store: &dyn Store, task_id: TaskId, state: TaskState, message: Option<String>) {
    match store.finish_task(task_id, state, message.as_deref()).await {
        Ok(true) => {}
        Ok(false) => warn!(task_id = %task_id, "Task finished after it was abandoned"),
        Err(e) => error!(task_id = %task_id, error = %e, "Failed to record task outcome"),
    }
}
