//! Single entry point for submitting, inspecting and terminating executions.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use agent_task_engine_error::EngineError;

use crate::broker::StreamBroker;
use crate::catalog::AgentCatalog;
use crate::config::EngineConfig;
use crate::execution::{Execution, ExecutionStatus, RequestMode, TaskRequest};
use crate::executor::{
    ExecutionContext, ParallelExecutor, ProcessRunner, SequentialExecutor, TaskExecutor,
};
use crate::queue::SequentialQueue;
use crate::registry::{ProcessRegistry, Termination};
use crate::store::{ExecutionStore, ListFilter};
use crate::supervisor::DispatchSupervisor;

const MAX_EXECUTION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AcceptedResponse {
    pub status: String,
    pub execution_id: String,
    pub message: String,
}

impl AcceptedResponse {
    fn new(execution_id: String) -> Self {
        Self {
            status: "accepted".to_string(),
            message: format!("poll GET /v1/executions/{execution_id}"),
            execution_id,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DispatchResponse {
    Completed(Box<Execution>),
    Accepted(AcceptedResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TerminateResponse {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub terminating: bool,
}

#[derive(Debug)]
pub struct TaskDispatcher {
    config: EngineConfig,
    catalog: Arc<AgentCatalog>,
    store: Arc<dyn ExecutionStore>,
    registry: ProcessRegistry,
    broker: StreamBroker,
    queue: Arc<SequentialQueue>,
    supervisor: DispatchSupervisor,
    sequential: Arc<dyn TaskExecutor>,
    parallel: Arc<dyn TaskExecutor>,
}

impl TaskDispatcher {
    pub fn new(
        config: EngineConfig,
        catalog: Arc<AgentCatalog>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let registry = ProcessRegistry::new();
        let broker = StreamBroker::new();
        let queue = Arc::new(SequentialQueue::new());
        let runner = ProcessRunner::new(
            store.clone(),
            registry.clone(),
            broker.clone(),
            config.kill_grace,
        );
        let supervisor = DispatchSupervisor::new(store.clone(), broker.clone(), registry.clone());
        Self {
            sequential: Arc::new(SequentialExecutor::new(runner.clone(), queue.clone())),
            parallel: Arc::new(ParallelExecutor::new(runner)),
            config,
            catalog,
            store,
            registry,
            broker,
            queue,
            supervisor,
        }
    }

    pub fn catalog(&self) -> &AgentCatalog {
        &self.catalog
    }

    pub fn broker(&self) -> &StreamBroker {
        &self.broker
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn queued(&self, agent_id: &str) -> usize {
        self.queue.waiting(agent_id)
    }

    pub async fn dispatch(
        &self,
        agent_id: &str,
        request: TaskRequest,
    ) -> Result<DispatchResponse, EngineError> {
        let timeout_seconds = self.validate(&request)?;
        let agent = self.catalog.resolve(agent_id)?;
        let executor = match request.mode {
            RequestMode::Sequential => self.sequential.clone(),
            RequestMode::Parallel => self.parallel.clone(),
        };
        // Taken before any await so lane order is arrival order. Dropping it on
        // an error path gives the place back.
        let admission = executor.admission(agent_id);
        let execution_id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.store.get(&execution_id).await?.is_some() {
            return Err(EngineError::conflict(format!(
                "execution {execution_id} already exists"
            )));
        }

        let execution = Execution::new(
            execution_id.clone(),
            agent_id.to_string(),
            &request,
            timeout_seconds,
        );
        // The stream topic exists before the record so subscribers never miss it.
        if !self.broker.open(&execution_id) {
            return Err(EngineError::conflict(format!(
                "execution {execution_id} already exists"
            )));
        }
        if let Err(err) = self.store.create(execution).await {
            self.broker.discard(&execution_id);
            return Err(err);
        }

        let async_mode = request.async_mode;
        tracing::info!(
            execution_id = %execution_id,
            agent_id,
            mode = ?request.mode,
            async_mode,
            timeout_seconds,
            max_turns = request.max_turns,
            "dispatching execution"
        );
        let context = ExecutionContext {
            execution_id: execution_id.clone(),
            agent,
            request,
            timeout: Duration::from_secs(timeout_seconds),
        };
        let handle = self.supervisor.spawn(executor, admission, context);

        if async_mode {
            return Ok(DispatchResponse::Accepted(AcceptedResponse::new(execution_id)));
        }

        // Awaiting the handle does not tie the execution to this caller; if the
        // caller goes away the detached task still finishes and writes.
        match handle.await {
            Ok(Ok(execution)) => Ok(DispatchResponse::Completed(Box::new(execution))),
            Ok(Err(err)) => Err(err),
            Err(err) => Err(EngineError::persistence(format!(
                "supervisor task for {execution_id} failed: {err}"
            ))),
        }
    }

    pub async fn get(&self, execution_id: &str) -> Result<Execution, EngineError> {
        self.store
            .get(execution_id)
            .await?
            .ok_or_else(|| EngineError::execution_not_found(execution_id))
    }

    pub async fn list(&self, filter: ListFilter) -> Result<Vec<Execution>, EngineError> {
        if let Some(agent_id) = filter.agent_id.as_deref() {
            if !self.catalog.contains(agent_id) {
                return Err(EngineError::agent_not_found(agent_id));
            }
        }
        self.store.list(filter).await
    }

    /// Requests termination. The owning supervisor writes the terminal status.
    pub async fn terminate(&self, execution_id: &str) -> Result<TerminateResponse, EngineError> {
        let execution = self.get(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(EngineError::conflict(format!(
                "execution {execution_id} is already {}",
                execution.status.as_str()
            )));
        }

        // A running record may not have its process yet; the marker left here
        // kills it on registration or stops the supervisor before it spawns.
        let mut terminating = true;
        if self.registry.terminate_or_cancel(execution_id) == Termination::Cancelled
            && !self.broker.is_open(execution_id)
        {
            // The supervisor finished in between and will not clear the marker.
            self.registry.take_cancelled(execution_id);
            terminating = false;
        }
        tracing::info!(execution_id, terminating, "termination requested");
        Ok(TerminateResponse {
            execution_id: execution_id.to_string(),
            status: execution.status,
            terminating,
        })
    }

    fn validate(&self, request: &TaskRequest) -> Result<u64, EngineError> {
        if request.message.trim().is_empty() {
            return Err(EngineError::validation("message must not be empty"));
        }
        if let Some(execution_id) = request.execution_id.as_deref() {
            if execution_id.is_empty() || execution_id.len() > MAX_EXECUTION_ID_LEN {
                return Err(EngineError::validation(format!(
                    "execution_id must be 1 to {MAX_EXECUTION_ID_LEN} characters"
                )));
            }
            if !execution_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(EngineError::validation(
                    "execution_id may only contain letters, digits, '-', '_' and '.'",
                ));
            }
        }
        if request.max_turns == Some(0) {
            return Err(EngineError::validation("max_turns must be at least 1"));
        }
        let timeout_seconds = request
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_secs);
        if timeout_seconds == 0 || timeout_seconds > self.config.max_timeout_secs {
            return Err(EngineError::validation(format!(
                "timeout_seconds must be between 1 and {}",
                self.config.max_timeout_secs
            )));
        }
        Ok(timeout_seconds)
    }
}
