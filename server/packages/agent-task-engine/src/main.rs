fn main() {
    if let Err(err) = agent_task_engine::cli::run_engine() {
        tracing::error!(error = %err, "agent-task-engine failed");
        std::process::exit(1);
    }
}
