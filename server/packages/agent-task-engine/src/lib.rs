//! Agent task execution engine: dispatches prompts to agent CLIs, supervises
//! the processes, records their transcripts and streams them live.

pub mod broker;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod execution;
pub mod executor;
pub mod invocation;
pub mod producer;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod store;
pub mod supervisor;
pub mod transcript;

pub use agent_task_engine_error::{EngineError, ErrorType, ProblemDetails};
pub use dispatcher::{DispatchResponse, TaskDispatcher};
pub use execution::{Execution, ExecutionStatus, RequestMode, TaskRequest};
