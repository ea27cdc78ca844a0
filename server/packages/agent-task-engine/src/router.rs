use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use agent_task_engine_error::{EngineError, ErrorType, ProblemDetails};

use crate::broker::{BrokerEvent, StreamEnd};
use crate::catalog::AgentInfo;
use crate::dispatcher::{AcceptedResponse, DispatchResponse, TaskDispatcher, TerminateResponse};
use crate::execution::{
    Execution, ExecutionMetadata, ExecutionMode, ExecutionStatus, RequestMode, TaskRequest,
};
use crate::store::ListFilter;
use crate::transcript::{LogEntry, LogEntryData};

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct AppState {
    pub dispatcher: Arc<TaskDispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<TaskDispatcher>) -> Self {
        Self { dispatcher }
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/agents", get(list_agents))
        .route("/agents/:agent_id/tasks", post(submit_task))
        .route("/agents/:agent_id/executions", get(list_executions))
        .route("/executions/:execution_id", get(get_execution))
        .route("/executions/:execution_id/log", get(get_execution_log))
        .route("/executions/:execution_id/stream", get(stream_execution))
        .route("/executions/:execution_id/terminate", post(terminate_execution))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::debug!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .nest("/v1", v1_router)
        .fallback(not_found)
        .layer(trace_layer)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_agents,
        submit_task,
        list_executions,
        get_execution,
        get_execution_log,
        stream_execution,
        terminate_execution
    ),
    components(
        schemas(
            HealthResponse,
            AgentInfo,
            AgentListResponse,
            TaskRequest,
            RequestMode,
            AcceptedResponse,
            Execution,
            SyncExecutionResponse,
            ExecutionMode,
            ExecutionStatus,
            ExecutionMetadata,
            ExecutionListResponse,
            ExecutionLogResponse,
            LogEntry,
            LogEntryData,
            TerminateResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "agents", description = "Agent catalog and task submission"),
        (name = "executions", description = "Execution inspection and control")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2468")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Engine(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
    pub live_processes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct AgentListResponse {
    pub agents: Vec<AgentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExecutionListResponse {
    pub executions: Vec<Execution>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExecutionLogResponse {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub has_log: bool,
    pub log: Vec<LogEntry>,
}

/// Body of a synchronous submission: the terminal record plus the time the
/// response was produced, which is the completion time.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncExecutionResponse {
    #[serde(flatten)]
    pub execution: Execution,
    pub timestamp: DateTime<Utc>,
}

impl From<Execution> for SyncExecutionResponse {
    fn from(execution: Execution) -> Self {
        let timestamp = execution.completed_at.unwrap_or_else(Utc::now);
        Self {
            execution,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema, JsonSchema)]
pub struct ExecutionsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        live_processes: state.dispatcher.registry().len(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/agents",
    responses((status = 200, body = AgentListResponse)),
    tag = "agents"
)]
async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentListResponse> {
    Json(AgentListResponse {
        agents: state.dispatcher.catalog().list(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/agents/{agent_id}/tasks",
    request_body = TaskRequest,
    params(("agent_id" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Terminal execution record", body = SyncExecutionResponse),
        (status = 202, description = "Accepted for background execution", body = AcceptedResponse),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn submit_task(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    body: Result<Json<TaskRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|err| EngineError::validation(err.body_text()))?;
    match state.dispatcher.dispatch(&agent_id, request).await? {
        DispatchResponse::Completed(execution) => {
            let body = SyncExecutionResponse::from(*execution);
            Ok((StatusCode::OK, Json(body)).into_response())
        }
        DispatchResponse::Accepted(accepted) => {
            Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/agents/{agent_id}/executions",
    params(
        ("agent_id" = String, Path, description = "Agent id"),
        ("limit" = Option<usize>, Query, description = "Max executions to return, newest first"),
        ("status" = Option<ExecutionStatus>, Query, description = "Only executions with this status")
    ),
    responses(
        (status = 200, body = ExecutionListResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn list_executions(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(query): Query<ExecutionsQuery>,
) -> Result<Json<ExecutionListResponse>, ApiError> {
    let executions = state
        .dispatcher
        .list(ListFilter {
            agent_id: Some(agent_id),
            status: query.status,
            limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT)),
        })
        .await?;
    Ok(Json(ExecutionListResponse { executions }))
}

#[utoipa::path(
    get,
    path = "/v1/executions/{execution_id}",
    params(("execution_id" = String, Path, description = "Execution id")),
    responses(
        (status = 200, body = Execution),
        (status = 404, body = ProblemDetails)
    ),
    tag = "executions"
)]
async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Result<Json<Execution>, ApiError> {
    Ok(Json(state.dispatcher.get(&execution_id).await?))
}

#[utoipa::path(
    get,
    path = "/v1/executions/{execution_id}/log",
    params(("execution_id" = String, Path, description = "Execution id")),
    responses(
        (status = 200, body = ExecutionLogResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "executions"
)]
async fn get_execution_log(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionLogResponse>, ApiError> {
    let execution = state.dispatcher.get(&execution_id).await?;
    Ok(Json(ExecutionLogResponse {
        execution_id: execution.id,
        status: execution.status,
        has_log: !execution.execution_log.is_empty(),
        log: execution.execution_log,
    }))
}

/// Live `entry` events followed by exactly one `stream_end`.
#[utoipa::path(
    get,
    path = "/v1/executions/{execution_id}/stream",
    params(("execution_id" = String, Path, description = "Execution id")),
    responses(
        (status = 200, description = "SSE stream of log entries"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "executions"
)]
async fn stream_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe before reading the record: a missing topic then means the
    // terminal status is already stored.
    let subscription = state.dispatcher.broker().subscribe(&execution_id);
    let execution = state.dispatcher.get(&execution_id).await?;

    let events = match subscription {
        Some(receiver) => UnboundedReceiverStream::new(receiver)
            .map(|event| Ok::<Event, Infallible>(to_sse_event(event)))
            .left_stream(),
        None => stream::once(async move {
            Ok::<Event, Infallible>(to_sse_event(BrokerEvent::StreamEnd(StreamEnd {
                execution_id: execution.id,
                status: execution.status,
            })))
        })
        .right_stream(),
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[utoipa::path(
    post,
    path = "/v1/executions/{execution_id}/terminate",
    params(("execution_id" = String, Path, description = "Execution id")),
    responses(
        (status = 202, body = TerminateResponse),
        (status = 404, body = ProblemDetails),
        (status = 409, description = "Execution already finished", body = ProblemDetails)
    ),
    tag = "executions"
)]
async fn terminate_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Result<(StatusCode, Json<TerminateResponse>), ApiError> {
    let response = state.dispatcher.terminate(&execution_id).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn not_found() -> Response {
    let problem = ProblemDetails::new(ErrorType::NotFound, Some("route not found".to_string()));
    (StatusCode::NOT_FOUND, Json(problem)).into_response()
}

fn to_sse_event(event: BrokerEvent) -> Event {
    match event {
        BrokerEvent::Entry(entry) => Event::default()
            .event("entry")
            .id(format!("{}:{}", entry.sequence, entry.index))
            .json_data(&entry)
            .unwrap_or_else(|_| Event::default().event("entry").data("{}")),
        BrokerEvent::StreamEnd(end) => Event::default()
            .event("stream_end")
            .json_data(&end)
            .unwrap_or_else(|_| Event::default().event("stream_end").data("{}")),
    }
}
