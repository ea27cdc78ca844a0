//! Canonical execution transcript.
//!
//! Every dispatch path builds its `execution_log` with [`classify`] and
//! [`ExecutionLog`]; the stream broker uses the same [`classify`] for live
//! subscribers, so stored and streamed entries always have the same shape.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::execution::ExecutionMetadata;
use crate::producer::{LinePayload, StreamMessage};

/// Maximum length, in characters, of a tool result stored in the transcript,
/// truncation marker included.
pub const TOOL_RESULT_MAX_CHARS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct LogEntry {
    /// Stdout line the entry was parsed from.
    pub sequence: u64,
    /// Position of the entry within its line.
    pub index: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub data: LogEntryData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LogEntryData {
    SessionStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        mcp_servers: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    AssistantText {
        text: String,
    },
    ToolCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        name: String,
        input: Value,
    },
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        content: String,
        is_error: bool,
        truncated: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_length: Option<usize>,
    },
    FinalResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_turns: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    Raw {
        text: String,
    },
}

impl LogEntryData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session-start",
            Self::AssistantText { .. } => "assistant-text",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::FinalResult { .. } => "final-result",
            Self::Raw { .. } => "raw",
        }
    }
}

/// Classifies one producer message into transcript entries. Pure: the same
/// message always yields the same entries.
pub fn classify(message: &StreamMessage) -> Vec<LogEntry> {
    let data = match &message.payload {
        LinePayload::Raw { text, .. } => vec![LogEntryData::Raw { text: text.clone() }],
        LinePayload::Json(value) => classify_value(value),
    };
    data.into_iter()
        .enumerate()
        .map(|(index, data)| LogEntry {
            sequence: message.sequence,
            index: index as u32,
            timestamp: message.received_at,
            data,
        })
        .collect()
}

fn classify_value(value: &Value) -> Vec<LogEntryData> {
    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "system" => match value.get("subtype").and_then(Value::as_str) {
            None | Some("init") => vec![session_start(value)],
            Some(_) => vec![raw(value)],
        },
        "assistant" => assistant_entries(value),
        "user" => tool_result_entries(value),
        "result" => vec![final_result(value)],
        _ => vec![raw(value)],
    }
}

fn raw(value: &Value) -> LogEntryData {
    LogEntryData::Raw {
        text: value.to_string(),
    }
}

fn session_start(value: &Value) -> LogEntryData {
    let tools = value
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let mcp_servers = value
        .get("mcp_servers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    LogEntryData::SessionStart {
        session_id: string_field(value, "session_id"),
        model: string_field(value, "model"),
        tools,
        mcp_servers,
        cwd: string_field(value, "cwd"),
    }
}

fn message_content(value: &Value) -> Vec<Value> {
    value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn assistant_entries(value: &Value) -> Vec<LogEntryData> {
    let mut entries = Vec::new();
    for block in message_content(value) {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        entries.push(LogEntryData::AssistantText {
                            text: text.to_string(),
                        });
                    }
                }
            }
            "tool_use" => entries.push(LogEntryData::ToolCall {
                tool_use_id: string_field(&block, "id"),
                name: string_field(&block, "name").unwrap_or_default(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            }),
            // Thinking blocks are not part of the transcript.
            _ => {}
        }
    }
    entries
}

fn tool_result_entries(value: &Value) -> Vec<LogEntryData> {
    message_content(value)
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(|block| {
            let content = tool_result_text(block.get("content").unwrap_or(&Value::Null));
            let (content, truncated, original_length) = truncate_tool_output(&content);
            LogEntryData::ToolResult {
                tool_use_id: string_field(block, "tool_use_id"),
                content,
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                truncated,
                original_length,
            }
        })
        .collect()
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => part.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn final_result(value: &Value) -> LogEntryData {
    let subtype = string_field(value, "subtype");
    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| subtype.as_deref().is_some_and(|s| s != "success"));
    LogEntryData::FinalResult {
        subtype,
        is_error,
        result: string_field(value, "result"),
        num_turns: value
            .get("num_turns")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        duration_ms: value.get("duration_ms").and_then(Value::as_u64),
        cost_usd: value
            .get("total_cost_usd")
            .or_else(|| value.get("cost_usd"))
            .and_then(Value::as_f64),
        session_id: string_field(value, "session_id"),
        usage: value.get("usage").cloned(),
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Truncates tool output to [`TOOL_RESULT_MAX_CHARS`] characters including the
/// marker. Returns `(content, truncated, original_length)`.
pub fn truncate_tool_output(content: &str) -> (String, bool, Option<usize>) {
    let total = content.chars().count();
    if total <= TOOL_RESULT_MAX_CHARS {
        return (content.to_string(), false, None);
    }
    // Marker width is bounded by the digits of `total`, since omitted <= total.
    let widest_marker = truncation_marker(total).chars().count();
    let keep = TOOL_RESULT_MAX_CHARS.saturating_sub(widest_marker);
    let mut truncated: String = content.chars().take(keep).collect();
    truncated.push_str(&truncation_marker(total - keep));
    (truncated, true, Some(total))
}

fn truncation_marker(omitted: usize) -> String {
    format!("... [truncated {omitted} chars]")
}

/// Whether the accumulator wants the execution to keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulated {
    Continue,
    TurnLimitExceeded,
}

/// Builds the ordered transcript for one execution and tracks what the
/// terminal write needs from it.
#[derive(Debug, Default)]
pub struct ExecutionLog {
    max_turns: Option<u32>,
    entries: Vec<LogEntry>,
    tool_calls: u32,
    turn_limit_exceeded: bool,
    assistant_text: Vec<String>,
    session_id: Option<String>,
    final_result: Option<LogEntryData>,
}

impl ExecutionLog {
    pub fn new(max_turns: Option<u32>) -> Self {
        Self {
            max_turns,
            ..Self::default()
        }
    }

    /// Appends the entries classified from `message` and returns the newly
    /// appended slice. Once a tool call would exceed `max_turns`, nothing more
    /// is appended.
    pub fn accumulate(&mut self, message: &StreamMessage) -> (&[LogEntry], Accumulated) {
        let start = self.entries.len();
        if self.turn_limit_exceeded {
            return (&self.entries[start..], Accumulated::TurnLimitExceeded);
        }

        for entry in classify(message) {
            match &entry.data {
                LogEntryData::ToolCall { .. } => {
                    if self
                        .max_turns
                        .is_some_and(|max_turns| self.tool_calls >= max_turns)
                    {
                        self.turn_limit_exceeded = true;
                        break;
                    }
                    self.tool_calls += 1;
                }
                LogEntryData::AssistantText { text } => self.assistant_text.push(text.clone()),
                LogEntryData::SessionStart { session_id, .. } => {
                    if self.session_id.is_none() {
                        self.session_id = session_id.clone();
                    }
                }
                LogEntryData::FinalResult { session_id, .. } => {
                    if self.session_id.is_none() {
                        self.session_id = session_id.clone();
                    }
                    self.final_result = Some(entry.data.clone());
                }
                LogEntryData::ToolResult { .. } | LogEntryData::Raw { .. } => {}
            }
            self.entries.push(entry);
        }

        let state = if self.turn_limit_exceeded {
            Accumulated::TurnLimitExceeded
        } else {
            Accumulated::Continue
        };
        (&self.entries[start..], state)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn tool_calls(&self) -> u32 {
        self.tool_calls
    }

    pub fn turn_limit_exceeded(&self) -> bool {
        self.turn_limit_exceeded
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    pub fn has_final_result(&self) -> bool {
        self.final_result.is_some()
    }

    /// Failure message when the agent reported a failed run.
    pub fn final_error(&self) -> Option<String> {
        match &self.final_result {
            Some(LogEntryData::FinalResult {
                is_error: true,
                subtype,
                result,
                ..
            }) => Some(
                result
                    .clone()
                    .or_else(|| subtype.clone())
                    .unwrap_or_else(|| "agent reported an error".to_string()),
            ),
            _ => None,
        }
    }

    pub fn final_subtype(&self) -> Option<&str> {
        match &self.final_result {
            Some(LogEntryData::FinalResult { subtype, .. }) => subtype.as_deref(),
            _ => None,
        }
    }

    /// Assistant text seen so far, used when no final result arrived.
    pub fn partial_response(&self) -> Option<String> {
        if self.assistant_text.is_empty() {
            None
        } else {
            Some(self.assistant_text.join("\n"))
        }
    }

    pub fn response(&self) -> Option<String> {
        match &self.final_result {
            Some(LogEntryData::FinalResult {
                result: Some(result),
                ..
            }) => Some(result.clone()),
            _ => self.partial_response(),
        }
    }

    pub fn metadata(&self, duration_ms: u64) -> ExecutionMetadata {
        let mut metadata = ExecutionMetadata {
            duration_ms,
            tool_calls: self.tool_calls,
            ..ExecutionMetadata::default()
        };
        if let Some(LogEntryData::FinalResult {
            num_turns,
            duration_ms,
            cost_usd,
            usage,
            ..
        }) = &self.final_result
        {
            metadata.num_turns = *num_turns;
            metadata.agent_duration_ms = *duration_ms;
            metadata.cost_usd = *cost_usd;
            if let Some(usage) = usage {
                let tokens = |key: &str| usage.get(key).and_then(Value::as_u64);
                metadata.input_tokens = tokens("input_tokens");
                metadata.output_tokens = tokens("output_tokens");
                metadata.cache_read_input_tokens = tokens("cache_read_input_tokens");
                metadata.cache_creation_input_tokens = tokens("cache_creation_input_tokens");
            }
        }
        metadata
    }
}
