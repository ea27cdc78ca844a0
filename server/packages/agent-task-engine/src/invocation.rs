//! Builds the agent CLI command line for one execution.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::catalog::AgentSpec;
use crate::execution::TaskRequest;

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Written to stdin, then stdin is closed.
    pub prompt: String,
}

impl Invocation {
    /// `resume` continues the agent's most recent conversation instead of
    /// starting a new one.
    pub fn build(spec: &AgentSpec, request: &TaskRequest, resume: bool) -> Self {
        let mut args = spec.args.clone();
        args.extend(
            ["--print", "--output-format", "stream-json", "--verbose"].map(String::from),
        );
        if resume {
            args.push("--continue".to_string());
        }
        if let Some(max_turns) = request.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if let Some(model) = request.model.as_deref().filter(|model| !model.is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(request.allowed_tools.join(","));
        }
        if let Some(prompt) = request
            .system_prompt
            .as_deref()
            .filter(|prompt| !prompt.is_empty())
        {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.to_string());
        }

        Self {
            program: spec.program.clone(),
            args,
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
            prompt: request.message.clone(),
        }
    }
}
