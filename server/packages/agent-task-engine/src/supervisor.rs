//! Owns every execution from admission to its terminal write.
//!
//! Each dispatched execution runs as a detached task that first waits for the
//! place reserved at dispatch, marks the record running, then runs the
//! executor in a nested task so a panic surfaces as a `JoinError` instead of
//! unwinding past the terminal write. The permit is released only after the
//! write and the stream close.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use agent_task_engine_error::EngineError;

use crate::broker::StreamBroker;
use crate::execution::{Execution, ExecutionStatus};
use crate::executor::{Admission, ExecutionContext, ExecutionOutcome, TaskExecutor};
use crate::registry::ProcessRegistry;
use crate::store::{ExecutionStore, StatusUpdate};

const DEFAULT_WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct DispatchSupervisor {
    store: Arc<dyn ExecutionStore>,
    broker: StreamBroker,
    registry: ProcessRegistry,
    write_retry_backoff: Duration,
}

impl DispatchSupervisor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        broker: StreamBroker,
        registry: ProcessRegistry,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            write_retry_backoff: DEFAULT_WRITE_RETRY_BACKOFF,
        }
    }

    pub fn with_write_retry_backoff(mut self, backoff: Duration) -> Self {
        self.write_retry_backoff = backoff;
        self
    }

    /// Detaches the execution. Dropping the returned handle does not cancel it.
    pub fn spawn(
        &self,
        executor: Arc<dyn TaskExecutor>,
        admission: Admission,
        context: ExecutionContext,
    ) -> JoinHandle<Result<Execution, EngineError>> {
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.supervise(executor, admission, context).await })
    }

    async fn supervise(
        self,
        executor: Arc<dyn TaskExecutor>,
        admission: Admission,
        context: ExecutionContext,
    ) -> Result<Execution, EngineError> {
        let execution_id = context.execution_id.clone();
        let permit = admission.acquire().await;
        tracing::debug!(execution_id = %execution_id, permit = ?permit, "execution admitted");

        if let Err(err) = self.write_status(&execution_id, StatusUpdate::Running).await {
            self.finish(&execution_id, ExecutionStatus::Failed);
            return Err(err);
        }

        let outcome = if self.registry.take_cancelled(&execution_id) {
            tracing::info!(execution_id = %execution_id, "execution terminated before start");
            ExecutionOutcome::from_error(&EngineError::Terminated)
        } else {
            let task_executor = executor.clone();
            match tokio::spawn(async move { task_executor.execute(context).await }).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(execution_id = %execution_id, error = %err, "executor task failed");
                    ExecutionOutcome::from_error(&EngineError::Process {
                        message: format!("executor task failed: {err}"),
                        exit_code: None,
                        stderr: None,
                    })
                }
            }
        };

        let result = self
            .write_status(&execution_id, StatusUpdate::Terminal(outcome.update))
            .await;
        let status = match &result {
            Ok(execution) => execution.status,
            Err(_) => ExecutionStatus::Failed,
        };
        self.finish(&execution_id, status);
        drop(permit);
        result
    }

    fn finish(&self, execution_id: &str, status: ExecutionStatus) {
        self.broker.close(execution_id, status);
        self.registry.take_cancelled(execution_id);
    }

    /// Retried once; a second failure is fatal for the execution and leaves
    /// the record for the startup reaper.
    async fn write_status(
        &self,
        execution_id: &str,
        update: StatusUpdate,
    ) -> Result<Execution, EngineError> {
        let first = self.store.update_status(execution_id, update.clone()).await;
        let err = match first {
            Ok(execution) => return Ok(execution),
            Err(err @ (EngineError::Conflict { .. } | EngineError::NotFound { .. })) => {
                tracing::error!(execution_id, error = %err, "status write rejected");
                return Err(err);
            }
            Err(err) => err,
        };

        tracing::warn!(execution_id, error = %err, "status write failed, retrying");
        tokio::time::sleep(self.write_retry_backoff).await;
        match self.store.update_status(execution_id, update).await {
            Ok(execution) => Ok(execution),
            Err(err) => {
                tracing::error!(
                    execution_id,
                    error = %err,
                    "status write failed twice, execution result lost"
                );
                Err(err)
            }
        }
    }
}
