use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Validation,
    NotFound,
    Conflict,
    Timeout,
    TurnLimit,
    Process,
    Persistence,
    Terminated,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::Validation => "urn:agent-task-engine:error:validation",
            Self::NotFound => "urn:agent-task-engine:error:not_found",
            Self::Conflict => "urn:agent-task-engine:error:conflict",
            Self::Timeout => "urn:agent-task-engine:error:timeout",
            Self::TurnLimit => "urn:agent-task-engine:error:turn_limit",
            Self::Process => "urn:agent-task-engine:error:process",
            Self::Persistence => "urn:agent-task-engine:error:persistence",
            Self::Terminated => "urn:agent-task-engine:error:terminated",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Validation => "Validation Error",
            Self::NotFound => "Not Found",
            Self::Conflict => "Conflict",
            Self::Timeout => "Timeout",
            Self::TurnLimit => "Turn Limit Reached",
            Self::Process => "Process Error",
            Self::Persistence => "Persistence Error",
            Self::Terminated => "Terminated",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Timeout => 504,
            Self::TurnLimit => 422,
            Self::Process => 502,
            Self::Persistence => 500,
            Self::Terminated => 409,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// What kind of thing a `NotFound` refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Agent,
    Execution,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => f.write_str("agent"),
            Self::Execution => f.write_str("execution"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {message}")]
    Validation { message: String },
    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("turn limit of {max_turns} reached")]
    TurnLimit { max_turns: u32 },
    #[error("agent process failed: {message}")]
    Process {
        message: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("execution store write failed: {message}")]
    Persistence { message: String },
    #[error("execution terminated")]
    Terminated,
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn agent_not_found(agent_id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ResourceKind::Agent,
            id: agent_id.into(),
        }
    }

    pub fn execution_not_found(execution_id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ResourceKind::Execution,
            id: execution_id.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Validation { .. } => ErrorType::Validation,
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::TurnLimit { .. } => ErrorType::TurnLimit,
            Self::Process { .. } => ErrorType::Process,
            Self::Persistence { .. } => ErrorType::Persistence,
            Self::Terminated => ErrorType::Terminated,
        }
    }

    /// Errors raised before any execution record exists.
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::NotFound { .. } | Self::Conflict { .. }
        )
    }

    fn details(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::NotFound { kind, id } => {
                map.insert("resource".to_string(), Value::String(kind.to_string()));
                map.insert("id".to_string(), Value::String(id.clone()));
            }
            Self::Timeout { seconds } => {
                map.insert("timeoutSeconds".to_string(), Value::from(*seconds));
            }
            Self::TurnLimit { max_turns } => {
                map.insert("maxTurns".to_string(), Value::from(*max_turns));
            }
            Self::Process {
                exit_code, stderr, ..
            } => {
                if let Some(code) = exit_code {
                    map.insert("exitCode".to_string(), Value::from(*code));
                }
                if let Some(stderr) = stderr {
                    map.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            Self::Validation { .. }
            | Self::Conflict { .. }
            | Self::Persistence { .. }
            | Self::Terminated => {}
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let details = self.details();
        if !details.is_empty() {
            problem
                .extensions
                .insert("details".to_string(), Value::Object(details));
        }
        problem
    }
}

impl From<EngineError> for ProblemDetails {
    fn from(value: EngineError) -> Self {
        value.to_problem_details()
    }
}

impl From<&EngineError> for ProblemDetails {
    fn from(value: &EngineError) -> Self {
        value.to_problem_details()
    }
}
