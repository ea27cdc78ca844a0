#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

use agent_task_engine::catalog::{AgentCatalog, AgentSpec};
use agent_task_engine::config::EngineConfig;
use agent_task_engine::router::{build_router, AppState};
use agent_task_engine::store::MemoryExecutionStore;
use agent_task_engine::TaskDispatcher;

/// Answers "4" after echoing the session start and one assistant message.
pub const ANSWER_AGENT: &str = r#"cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"sess-1","model":"fake","tools":["Bash"]}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Let me add those."}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"4","num_turns":1,"duration_ms":12,"total_cost_usd":0.001,"session_id":"sess-1","usage":{"input_tokens":10,"output_tokens":2}}'
"#;

/// Keeps calling tools and never finishes on its own.
pub const TOOL_LOOP_AGENT: &str = r#"cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"sess-2"}'
i=0
while [ $i -lt 10 ]; do
  i=$((i + 1))
  echo "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"id\":\"tu_$i\",\"name\":\"Bash\",\"input\":{\"command\":\"ls\"}}]}}"
  echo "{\"type\":\"user\",\"message\":{\"content\":[{\"type\":\"tool_result\",\"tool_use_id\":\"tu_$i\",\"content\":\"file_$i\"}]}}"
  sleep 0.05
done
exec sleep 30
"#;

/// Starts, says something and then hangs.
pub const HANGING_AGENT: &str = r#"cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"sess-3"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}'
exec sleep 30
"#;

/// Takes a little while, then succeeds.
pub const SLOW_AGENT: &str = r#"cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"sess-4"}'
sleep 0.4
echo '{"type":"result","subtype":"success","is_error":false,"result":"done"}'
"#;

pub const FAILING_AGENT: &str = r#"cat > /dev/null
echo 'rate limited' >&2
exit 2
"#;

pub struct TestApp {
    pub app: Router,
    pub dispatcher: Arc<TaskDispatcher>,
    _agents_dir: TempDir,
}

impl TestApp {
    /// Every agent is `sh <script>`, one script per `(id, body)`.
    pub fn new(agents: &[(&str, &str)]) -> Self {
        let agents_dir = tempfile::tempdir().expect("create temp agents dir");
        let specs = agents.iter().map(|(id, body)| {
            let path = agents_dir.path().join(format!("{id}.sh"));
            std::fs::write(&path, body).expect("write fake agent");
            AgentSpec::new(*id, "sh").with_args([path.display().to_string()])
        });
        let catalog = AgentCatalog::new(specs.collect::<Vec<_>>()).expect("catalog");
        let config = EngineConfig {
            kill_grace: Duration::from_millis(500),
            ..EngineConfig::default()
        };
        let dispatcher = Arc::new(TaskDispatcher::new(
            config,
            Arc::new(catalog),
            Arc::new(MemoryExecutionStore::new()),
        ));
        let app = build_router(AppState::new(dispatcher.clone()));
        Self {
            app,
            dispatcher,
            _agents_dir: agents_dir,
        }
    }

    pub fn standard() -> Self {
        Self::new(&[
            ("answer", ANSWER_AGENT),
            ("tools", TOOL_LOOP_AGENT),
            ("hang", HANGING_AGENT),
            ("slow", SLOW_AGENT),
            ("fail", FAILING_AGENT),
        ])
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.map(|value| value.to_string()).unwrap_or_default()))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

pub async fn submit(app: &Router, agent_id: &str, body: Value) -> (StatusCode, Value) {
    send_json(
        app,
        Method::POST,
        &format!("/v1/agents/{agent_id}/tasks"),
        Some(body),
    )
    .await
}

pub async fn get_execution(app: &Router, execution_id: &str) -> Value {
    let (status, payload) = send_json(
        app,
        Method::GET,
        &format!("/v1/executions/{execution_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "get execution {execution_id}");
    payload
}

pub async fn poll_until<F>(app: &Router, execution_id: &str, timeout: Duration, mut done: F) -> Value
where
    F: FnMut(&Value) -> bool,
{
    let start = Instant::now();
    loop {
        let execution = get_execution(app, execution_id).await;
        if done(&execution) || start.elapsed() > timeout {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn poll_terminal(app: &Router, execution_id: &str) -> Value {
    poll_until(app, execution_id, Duration::from_secs(20), |execution| {
        matches!(execution["status"].as_str(), Some("success" | "failed"))
    })
    .await
}

pub fn entry_types(execution: &Value) -> Vec<String> {
    execution["execution_log"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry["type"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn timestamp(execution: &Value, field: &str) -> chrono::DateTime<chrono::Utc> {
    execution[field]
        .as_str()
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(|| panic!("missing {field} in {execution}"))
}
