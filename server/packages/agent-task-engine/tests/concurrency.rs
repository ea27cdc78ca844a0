mod common;

use serde_json::{json, Value};

use common::*;

async fn submit_async(test: &TestApp, agent_id: &str, mode: &str, id: &str) {
    let (status, payload) = submit(
        &test.app,
        agent_id,
        json!({ "message": "work", "mode": mode, "async_mode": true, "execution_id": id }),
    )
    .await;
    assert_eq!(status, axum::http::StatusCode::ACCEPTED, "{payload}");
}

async fn finish_all(test: &TestApp, ids: &[&str]) -> Vec<Value> {
    let mut executions = Vec::new();
    for id in ids {
        let execution = poll_terminal(&test.app, id).await;
        assert_eq!(execution["status"], "success", "{execution}");
        executions.push(execution);
    }
    executions
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_executions_never_overlap() {
    let test = TestApp::standard();
    let ids = ["seq-1", "seq-2", "seq-3"];
    for id in ids {
        submit_async(&test, "slow", "sequential", id).await;
    }

    let executions = finish_all(&test, &ids).await;
    for pair in executions.windows(2) {
        assert!(
            timestamp(&pair[1], "started_at") >= timestamp(&pair[0], "completed_at"),
            "overlap between {} and {}",
            pair[0]["id"],
            pair[1]["id"]
        );
    }
    for execution in &executions {
        assert_eq!(execution["mode"], "sequential");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_executions_start_in_submission_order() {
    let test = TestApp::standard();
    let ids: Vec<String> = (1..=12).map(|i| format!("order-{i:02}")).collect();
    for id in &ids {
        submit_async(&test, "answer", "sequential", id).await;
    }

    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
    let executions = finish_all(&test, &ids).await;
    for pair in executions.windows(2) {
        assert!(
            timestamp(&pair[1], "started_at") >= timestamp(&pair[0], "completed_at"),
            "{} started before {} finished",
            pair[1]["id"],
            pair[0]["id"]
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_executions_overlap() {
    let test = TestApp::standard();
    let ids = ["par-1", "par-2"];
    for id in ids {
        submit_async(&test, "slow", "parallel", id).await;
    }

    let executions = finish_all(&test, &ids).await;
    let (a, b) = (&executions[0], &executions[1]);
    assert!(timestamp(a, "started_at") < timestamp(b, "completed_at"));
    assert!(timestamp(b, "started_at") < timestamp(a, "completed_at"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_lanes_are_per_agent() {
    let test = TestApp::new(&[("left", SLOW_AGENT), ("right", SLOW_AGENT)]);
    submit_async(&test, "left", "sequential", "left-1").await;
    submit_async(&test, "right", "sequential", "right-1").await;

    let executions = finish_all(&test, &["left-1", "right-1"]).await;
    let (left, right) = (&executions[0], &executions[1]);
    assert!(timestamp(left, "started_at") < timestamp(right, "completed_at"));
    assert!(timestamp(right, "started_at") < timestamp(left, "completed_at"));
}
