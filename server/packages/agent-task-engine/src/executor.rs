//! Runs one agent process per execution and turns its output into a terminal
//! update. Sequential and parallel executors share the same runner and differ
//! only in how they admit work.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::watch;
use tokio::time::Instant;

use agent_task_engine_error::EngineError;

use crate::broker::StreamBroker;
use crate::catalog::AgentSpec;
use crate::execution::{TaskRequest, TerminalUpdate};
use crate::invocation::Invocation;
use crate::producer::{LineProducer, StreamMessage};
use crate::queue::{LanePermit, LaneTicket, SequentialQueue};
use crate::registry::ProcessRegistry;
use crate::store::ExecutionStore;
use crate::transcript::{Accumulated, ExecutionLog};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub agent: AgentSpec,
    pub request: TaskRequest,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub update: TerminalUpdate,
    pub exit_code: Option<i32>,
}

impl ExecutionOutcome {
    pub fn from_error(error: &EngineError) -> Self {
        let exit_code = match error {
            EngineError::Process { exit_code, .. } => *exit_code,
            _ => None,
        };
        Self {
            update: TerminalUpdate::from_error(error),
            exit_code,
        }
    }
}

/// A place reserved at dispatch time. Awaiting it yields the permit.
#[derive(Debug)]
pub enum Admission {
    Lane(LaneTicket),
    Unbounded,
}

impl Admission {
    pub async fn acquire(self) -> ExecutionPermit {
        match self {
            Self::Lane(ticket) => ExecutionPermit::Lane(ticket.acquire().await),
            Self::Unbounded => ExecutionPermit::Unbounded,
        }
    }
}

/// Held by the supervisor until the terminal write is done.
#[derive(Debug)]
pub enum ExecutionPermit {
    Lane(LanePermit),
    Unbounded,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync + Debug {
    /// Reserves the execution's place without waiting.
    fn admission(&self, agent_id: &str) -> Admission;

    async fn execute(&self, context: ExecutionContext) -> ExecutionOutcome;
}

#[derive(Debug)]
pub struct SequentialExecutor {
    runner: ProcessRunner,
    queue: Arc<SequentialQueue>,
}

impl SequentialExecutor {
    pub fn new(runner: ProcessRunner, queue: Arc<SequentialQueue>) -> Self {
        Self { runner, queue }
    }
}

#[async_trait]
impl TaskExecutor for SequentialExecutor {
    fn admission(&self, agent_id: &str) -> Admission {
        Admission::Lane(self.queue.enqueue(agent_id))
    }

    async fn execute(&self, context: ExecutionContext) -> ExecutionOutcome {
        self.runner.run(&context, true).await
    }
}

#[derive(Debug)]
pub struct ParallelExecutor {
    runner: ProcessRunner,
}

impl ParallelExecutor {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TaskExecutor for ParallelExecutor {
    fn admission(&self, _agent_id: &str) -> Admission {
        Admission::Unbounded
    }

    async fn execute(&self, context: ExecutionContext) -> ExecutionOutcome {
        self.runner.run(&context, false).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Terminated,
    Timeout,
    TurnLimit,
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    store: Arc<dyn ExecutionStore>,
    registry: ProcessRegistry,
    broker: StreamBroker,
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: ProcessRegistry,
        broker: StreamBroker,
        kill_grace: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            broker,
            kill_grace,
        }
    }

    /// Runs the agent for an execution the caller has already marked running.
    pub async fn run(&self, context: &ExecutionContext, resume: bool) -> ExecutionOutcome {
        let id = context.execution_id.as_str();
        let started = Instant::now();
        let deadline = started + context.timeout;
        let invocation = Invocation::build(&context.agent, &context.request, resume);

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ExecutionOutcome::from_error(&EngineError::Process {
                    message: format!(
                        "failed to spawn {}: {err}",
                        invocation.program.display()
                    ),
                    exit_code: None,
                    stderr: None,
                })
            }
        };
        tracing::info!(
            execution_id = id,
            agent_id = %context.agent.id,
            pid = child.id(),
            resume,
            "spawned agent process"
        );

        let registration = match self.registry.register(id, child.id()) {
            Ok(registration) => registration,
            Err(err) => {
                let _ = child.start_kill();
                return ExecutionOutcome::from_error(&err);
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = invocation.prompt;
            let execution_id = id.to_string();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::warn!(execution_id, error = %err, "failed to write prompt");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            registration.terminate();
            let _ = child.wait().await;
            return ExecutionOutcome::from_error(&EngineError::Process {
                message: "agent process has no output pipes".to_string(),
                exit_code: None,
                stderr: None,
            });
        };

        let mut producer = LineProducer::new(id);
        let mut lines = producer.subscribe();
        let producer_task = tokio::spawn(producer.run(stdout));
        let stderr_task = tokio::spawn(collect_stderr(id.to_string(), stderr));

        let mut log = ExecutionLog::new(context.request.max_turns);
        let mut kill = registration.kill_signal();
        let mut stop = None;

        loop {
            tokio::select! {
                biased;
                true = killed(&mut kill) => {
                    stop = Some(StopReason::Terminated);
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    stop = Some(StopReason::Timeout);
                    break;
                }
                message = lines.recv() => {
                    let Some(message) = message else { break };
                    if self.record(id, &mut log, &message).await == Accumulated::TurnLimitExceeded {
                        stop = Some(StopReason::TurnLimit);
                        break;
                    }
                }
            }
        }

        let mut exit = None;
        if stop.is_none() {
            tokio::select! {
                biased;
                true = killed(&mut kill) => stop = Some(StopReason::Terminated),
                _ = tokio::time::sleep_until(deadline) => stop = Some(StopReason::Timeout),
                status = child.wait() => match status {
                    Ok(status) => exit = Some(status),
                    Err(err) => {
                        tracing::warn!(execution_id = id, error = %err, "failed to wait for agent process");
                    }
                },
            }
        }

        if let Some(reason) = stop {
            tracing::info!(execution_id = id, reason = ?reason, "stopping agent process");
            registration.terminate();
            let _ = child.start_kill();
            let _ = tokio::time::timeout(self.kill_grace, child.wait()).await;

            // Keep what the agent flushed before dying.
            let drain_deadline = Instant::now() + self.kill_grace;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(drain_deadline) => break,
                    message = lines.recv() => match message {
                        Some(message) => {
                            self.record(id, &mut log, &message).await;
                        }
                        None => break,
                    },
                }
            }
            producer_task.abort();
        } else {
            match tokio::time::timeout(self.kill_grace, producer_task).await {
                Ok(Ok(summary)) => tracing::debug!(
                    execution_id = id,
                    lines = summary.lines,
                    invalid_lines = summary.invalid_lines,
                    "agent stdout drained"
                ),
                _ => tracing::warn!(execution_id = id, "agent stdout reader did not finish"),
            }
        }
        drop(registration);

        let stderr_tail = match tokio::time::timeout(self.kill_grace, stderr_task).await {
            Ok(Ok(tail)) => tail,
            _ => None,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = build_outcome(context, &log, stop, exit, stderr_tail, duration_ms);
        tracing::info!(
            execution_id = id,
            status = outcome.update.status.as_str(),
            exit_code = outcome.exit_code,
            duration_ms,
            tool_calls = log.tool_calls(),
            "agent process finished"
        );
        outcome
    }

    /// Appends the accumulated entries to the record and publishes the same
    /// entries to stream subscribers.
    async fn record(&self, id: &str, log: &mut ExecutionLog, message: &StreamMessage) -> Accumulated {
        let (entries, state) = log.accumulate(message);
        if !entries.is_empty() {
            if let Err(err) = self.store.append_log(id, entries).await {
                tracing::warn!(execution_id = id, error = %err, "failed to append execution log");
            }
            self.broker.publish(id, entries);
        }
        state
    }
}

fn build_outcome(
    context: &ExecutionContext,
    log: &ExecutionLog,
    stop: Option<StopReason>,
    exit: Option<ExitStatus>,
    stderr_tail: Option<String>,
    duration_ms: u64,
) -> ExecutionOutcome {
    let exit_code = exit.and_then(|status| status.code());
    let metadata = log.metadata(duration_ms);
    let max_turns = context.request.max_turns.unwrap_or_default();

    let error = match (stop, exit) {
        (Some(StopReason::Terminated), _) => Some(EngineError::Terminated),
        (Some(StopReason::Timeout), _) => Some(EngineError::Timeout {
            seconds: context.timeout.as_secs(),
        }),
        (Some(StopReason::TurnLimit), _) => Some(EngineError::TurnLimit { max_turns }),
        (None, None) => Some(EngineError::Process {
            message: "agent process exit status unavailable".to_string(),
            exit_code: None,
            stderr: stderr_tail,
        }),
        (None, Some(_)) if log.final_subtype() == Some("error_max_turns") => {
            Some(EngineError::TurnLimit { max_turns })
        }
        (None, Some(status)) if !status.success() => Some(EngineError::Process {
            message: match exit_code {
                Some(code) => format!("agent exited with code {code}"),
                None => "agent was killed by a signal".to_string(),
            },
            exit_code,
            stderr: stderr_tail,
        }),
        (None, Some(_)) => match log.final_error() {
            Some(message) => Some(EngineError::Process {
                message,
                exit_code,
                stderr: None,
            }),
            None if !log.has_final_result() => Some(EngineError::Process {
                message: "agent exited without a final result".to_string(),
                exit_code,
                stderr: stderr_tail,
            }),
            None => None,
        },
    };

    let update = match error {
        None => TerminalUpdate::success(log.response(), metadata),
        Some(error) => TerminalUpdate::failed(error.error_type(), error.to_string())
            .with_partial_response(log.response())
            .with_metadata(metadata),
    }
    .with_session_id(log.session_id());

    ExecutionOutcome { update, exit_code }
}

async fn killed(signal: &mut watch::Receiver<bool>) -> bool {
    signal.wait_for(|killed| *killed).await.is_ok()
}

async fn collect_stderr(execution_id: String, stderr: ChildStderr) -> Option<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(execution_id = %execution_id, line = %line, "agent stderr");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    if tail.is_empty() {
        None
    } else {
        Some(Vec::from(tail).join("\n"))
    }
}
