//! Startup recovery for executions orphaned by an engine restart.

use agent_task_engine_error::{EngineError, ErrorType};

use crate::execution::{ExecutionStatus, TerminalUpdate};
use crate::store::{ExecutionStore, ListFilter, StatusUpdate};

pub const INTERRUPTED_MESSAGE: &str = "execution interrupted by engine restart";

/// Fails every pending or running record. Must run before the engine accepts
/// work, since no process from a previous run can still be supervised.
pub async fn reap_interrupted(store: &dyn ExecutionStore) -> Result<usize, EngineError> {
    let mut reaped = 0;
    for status in [ExecutionStatus::Pending, ExecutionStatus::Running] {
        let stale = store
            .list(ListFilter {
                status: Some(status),
                ..ListFilter::default()
            })
            .await?;
        for execution in stale {
            if status == ExecutionStatus::Pending {
                if let Err(err) = store
                    .update_status(&execution.id, StatusUpdate::Running)
                    .await
                {
                    tracing::error!(execution_id = %execution.id, error = %err, "failed to reap execution");
                    continue;
                }
            }
            let update = TerminalUpdate::failed(ErrorType::Process, INTERRUPTED_MESSAGE)
                .with_partial_response(execution.response.clone());
            match store
                .update_status(&execution.id, StatusUpdate::Terminal(update))
                .await
            {
                Ok(_) => {
                    reaped += 1;
                    tracing::warn!(
                        execution_id = %execution.id,
                        agent_id = %execution.agent_id,
                        previous_status = status.as_str(),
                        "reaped interrupted execution"
                    );
                }
                Err(err) => {
                    tracing::error!(execution_id = %execution.id, error = %err, "failed to reap execution");
                }
            }
        }
    }
    Ok(reaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Execution, ExecutionMetadata, RequestMode, TaskRequest};
    use crate::store::MemoryExecutionStore;

    #[tokio::test]
    async fn fails_only_unfinished_records() {
        let store = MemoryExecutionStore::new();
        let request = TaskRequest::new("hi", RequestMode::Parallel);
        for id in ["pending", "running", "done"] {
            store
                .create(Execution::new(id.to_string(), "a".to_string(), &request, 60))
                .await
                .unwrap();
        }
        store.update_status("running", StatusUpdate::Running).await.unwrap();
        store.update_status("done", StatusUpdate::Running).await.unwrap();
        store
            .update_status(
                "done",
                StatusUpdate::Terminal(TerminalUpdate::success(None, ExecutionMetadata::default())),
            )
            .await
            .unwrap();

        assert_eq!(reap_interrupted(&store).await.unwrap(), 2);
        for id in ["pending", "running"] {
            let record = store.get(id).await.unwrap().unwrap();
            assert_eq!(record.status, ExecutionStatus::Failed);
            assert_eq!(record.error.as_deref(), Some(INTERRUPTED_MESSAGE));
            assert!(record.started_at.is_some());
        }
        let done = store.get("done").await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(reap_interrupted(&store).await.unwrap(), 0);
    }
}
