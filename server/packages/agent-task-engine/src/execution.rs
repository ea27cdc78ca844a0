//! Execution records and the task request that creates them.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use agent_task_engine_error::{EngineError, ErrorType};

use crate::transcript::LogEntry;

/// Concurrency contract requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    /// Single-flight per agent, resumes the prior conversation.
    Sequential,
    /// Stateless, unbounded concurrency.
    Parallel,
}

/// Mode recorded on the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
    ParallelAsync,
}

impl ExecutionMode {
    pub fn from_request(mode: RequestMode, async_mode: bool) -> Self {
        match (mode, async_mode) {
            (RequestMode::Sequential, _) => Self::Sequential,
            (RequestMode::Parallel, false) => Self::Parallel,
            (RequestMode::Parallel, true) => Self::ParallelAsync,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Status only moves forward: pending -> running -> success | failed.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Cost, token and tool usage summary written at the terminal transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ExecutionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    pub tool_calls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Execution {
    pub id: String,
    pub agent_id: String,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub async_mode: bool,
    pub status: ExecutionStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default)]
    pub execution_log: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExecutionMetadata>,
}

impl Execution {
    pub fn new(id: String, agent_id: String, request: &TaskRequest, timeout_seconds: u64) -> Self {
        Self {
            id,
            agent_id,
            mode: ExecutionMode::from_request(request.mode, request.async_mode),
            async_mode: request.async_mode,
            status: ExecutionStatus::Pending,
            message: request.message.clone(),
            response: None,
            error: None,
            error_type: None,
            execution_log: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            max_turns: request.max_turns,
            timeout_seconds,
            model: request.model.clone(),
            session_id: None,
            metadata: None,
        }
    }
}

/// Fields written together with the terminal status, in one update.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalUpdate {
    pub status: ExecutionStatus,
    pub response: Option<String>,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub session_id: Option<String>,
    pub metadata: ExecutionMetadata,
}

impl TerminalUpdate {
    pub fn success(response: Option<String>, metadata: ExecutionMetadata) -> Self {
        Self {
            status: ExecutionStatus::Success,
            response,
            error: None,
            error_type: None,
            session_id: None,
            metadata,
        }
    }

    pub fn failed(error_type: ErrorType, error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            response: None,
            error: Some(error.into()),
            error_type: Some(error_type),
            session_id: None,
            metadata: ExecutionMetadata::default(),
        }
    }

    pub fn from_error(error: &EngineError) -> Self {
        Self::failed(error.error_type(), error.to_string())
    }

    pub fn with_partial_response(mut self, response: Option<String>) -> Self {
        self.response = response;
        self
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Task submission body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct TaskRequest {
    pub message: String,
    pub mode: RequestMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub async_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl TaskRequest {
    pub fn new(message: impl Into<String>, mode: RequestMode) -> Self {
        Self {
            message: message.into(),
            mode,
            model: None,
            allowed_tools: Vec::new(),
            system_prompt: None,
            timeout_seconds: None,
            max_turns: None,
            async_mode: false,
            execution_id: None,
        }
    }
}
