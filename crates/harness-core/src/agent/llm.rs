//! LLM-driven agent: each step, asks the configured model to either call
//! one of the five tools or stop, and parses its answer back into an
//! [`AgentAction`].
//!
//! The model is treated as a plain text-completion endpoint rather than
//! through the provider's native function-calling: the five tool schemas
//! are described in the preamble as JSON, and the response is expected to
//! be a single JSON object of the same shape. This keeps tool execution
//! entirely in the harness's hands — the model only ever describes which
//! tool it wants; `crate::tools::dispatch` is what actually runs it, under
//! the sandbox and the path-safety layer. Mirrors how the reference
//! harness's LLM agent works, and how this crate's own teacher lineage
//! calls `agent.prompt(..)` for a single text completion rather than
//! letting the SDK's own tool loop drive execution.

use std::sync::atomic::{AtomicU64, Ordering};

use rig::client::CompletionClient;
use rig::providers::openai;

use crate::config::{build_completions_client, ModelEndpoint};
use crate::model::{AgentAction, AgentState, StopReason, ToolHistoryEntry, ToolName, ToolRequest};
use crate::truncate::truncate_str;

const TOOL_SCHEMAS: &str = r#"[
  {"tool": "LIST_FILES", "params": {"root": "string, optional, default is the workspace root", "glob": "string, optional, default '*'; use '**/*' to recurse"}},
  {"tool": "READ_FILE", "params": {"path": "string, required", "start_line": "integer, optional", "end_line": "integer, optional"}},
  {"tool": "SEARCH", "params": {"query": "string, required", "is_regex": "boolean, optional, default true", "glob": "string, optional", "context_lines": "integer, optional"}},
  {"tool": "APPLY_PATCH", "params": {"patch": "string, required; a unified diff"}},
  {"tool": "RUN", "params": {"command": "string, required", "cwd": "string, optional", "timeout_sec": "integer, optional"}}
]"#;

const SYSTEM_PREAMBLE: &str = "\
You are an autonomous coding agent. You are given a failing repository and \
must make the test command pass by calling tools, one at a time. Respond \
with exactly one JSON object and nothing else — no prose, no markdown \
fences — in one of these two shapes:\n\
{\"action\": \"call_tool\", \"tool\": \"<TOOL_NAME>\", \"params\": { ... }}\n\
{\"action\": \"stop\", \"reason\": \"success\" or \"give_up\", \"rationale\": \"...\"}\n\
Call RUN with the test command to check your work before stopping with \
reason \"success\". Available tools:\n";

const HISTORY_ENTRY_CHARS: usize = 2000;

pub struct LlmAgent {
    client: openai::CompletionsClient,
    model: String,
    temperature: Option<f64>,
    next_request_id: AtomicU64,
}

impl LlmAgent {
    pub fn new(endpoint: &ModelEndpoint) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_completions_client(endpoint)?,
            model: endpoint.model.clone(),
            temperature: endpoint.temperature,
            next_request_id: AtomicU64::new(0),
        })
    }

    /// Synthesizes a request id of the form `{run_id}-{step:04}-{counter:02}`
    /// for a tool call the model's response didn't name one for itself.
    fn request_id(&self, run_id: &str, step: u32) -> String {
        let counter = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        format!("{run_id}-{step:04}-{counter:02}")
    }

    /// Renders the step count, test command, and a truncated summary of
    /// every prior tool call into the message the model sees this turn.
    pub fn format_observation(state: &AgentState, test_command: &str) -> String {
        let mut out = format!(
            "Step {} of this attempt. Test command: `{test_command}`.\n",
            state.step
        );
        if state.history.is_empty() {
            out.push_str("No tool calls have been made yet.\n");
            return out;
        }
        out.push_str("Tool call history so far:\n");
        for entry in &state.history {
            let summary = if entry.result.is_success() {
                entry
                    .result
                    .data
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default()
            } else {
                format!(
                    "ERROR[{:?}]: {}",
                    entry.result.error.as_ref().unwrap().kind,
                    entry.result.error.as_ref().unwrap().message
                )
            };
            out.push_str(&format!(
                "- {}({}) -> {}\n",
                entry.request.tool.as_str(),
                entry.request.params,
                truncate_str(&summary, HISTORY_ENTRY_CHARS),
            ));
        }
        out
    }

    /// Sends one completion request and parses the reply into an action.
    /// Never returns an `Err` for a badly-formed model response — that
    /// becomes `AgentAction::Stop { reason: AgentGaveUp, .. }` instead, so a
    /// flaky model degrades the attempt rather than crashing the loop.
    /// `Err` is reserved for the completion call itself failing.
    pub async fn decide(&self, state: &AgentState, test_command: &str) -> anyhow::Result<AgentAction> {
        let agent = self
            .client
            .agent(&self.model)
            .preamble(&format!("{SYSTEM_PREAMBLE}{TOOL_SCHEMAS}"))
            .temperature(self.temperature.unwrap_or(0.0))
            .build();

        let observation = Self::format_observation(state, test_command);
        let response: String = agent
            .prompt(observation.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("llm completion failed: {e}"))?;

        let request_id = self.request_id(&state.run_id, state.step);
        Ok(Self::parse_response(&response, request_id, &state.history))
    }

    fn parse_response(response: &str, request_id: String, history: &[ToolHistoryEntry]) -> AgentAction {
        if let Some(action) = parse_structured(response, request_id.clone()) {
            return action;
        }
        if let Some(diff) = extract_unified_diff(response) {
            return AgentAction::CallTool(ToolRequest {
                request_id,
                tool: ToolName::ApplyPatch,
                params: serde_json::json!({ "patch": diff }),
            });
        }
        if let Some(path) = next_unread_listed_file(history) {
            return AgentAction::CallTool(ToolRequest {
                request_id,
                tool: ToolName::ReadFile,
                params: serde_json::json!({ "path": path }),
            });
        }
        AgentAction::Stop {
            reason: StopReason::AgentGaveUp,
            rationale: "could not parse a tool call or diff out of the model's response".to_string(),
        }
    }
}

/// When the model's response parses as neither a tool call nor a diff, falls
/// back to reading the first file from its most recent `LIST_FILES` listing
/// that it hasn't already asked to read — keeps a confused model making
/// progress instead of giving up immediately.
fn next_unread_listed_file(history: &[ToolHistoryEntry]) -> Option<String> {
    let last_listing = history.iter().rev().find(|entry| entry.request.tool == ToolName::ListFiles)?;
    let entries = last_listing.result.data.as_ref()?.get("entries")?.as_array()?;

    let already_read: std::collections::HashSet<&str> = history
        .iter()
        .filter(|entry| entry.request.tool == ToolName::ReadFile)
        .filter_map(|entry| entry.request.params.get("path").and_then(|v| v.as_str()))
        .collect();

    entries
        .iter()
        .filter_map(|v| v.as_str())
        .find(|path| !already_read.contains(path))
        .map(str::to_string)
}

fn parse_structured(response: &str, request_id: String) -> Option<AgentAction> {
    let json_str = extract_json_object(response)?;
    let value: serde_json::Value = serde_json::from_str(&json_str).ok()?;

    match value.get("action").and_then(|v| v.as_str())? {
        "call_tool" => {
            let tool = value.get("tool").and_then(|v| v.as_str()).and_then(parse_tool_name)?;
            let params = value.get("params").cloned().unwrap_or_else(|| serde_json::json!({}));
            Some(AgentAction::CallTool(ToolRequest { request_id, tool, params }))
        }
        "stop" => {
            let reason = match value.get("reason").and_then(|v| v.as_str()) {
                Some("success") => StopReason::Success,
                _ => StopReason::AgentGaveUp,
            };
            let rationale = value
                .get("rationale")
                .and_then(|v| v.as_str())
                .unwrap_or("no rationale given")
                .to_string();
            Some(AgentAction::Stop { reason, rationale })
        }
        _ => None,
    }
}

fn parse_tool_name(s: &str) -> Option<ToolName> {
    match s.to_ascii_uppercase().as_str() {
        "LIST_FILES" => Some(ToolName::ListFiles),
        "READ_FILE" => Some(ToolName::ReadFile),
        "SEARCH" => Some(ToolName::Search),
        "APPLY_PATCH" => Some(ToolName::ApplyPatch),
        "RUN" => Some(ToolName::Run),
        _ => None,
    }
}

/// Strips a markdown code fence if present, then takes the substring
/// between the first `{` and the last `}` — tolerant of the model prefacing
/// or trailing its JSON with explanatory prose.
fn extract_json_object(text: &str) -> Option<String> {
    let text = text.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```").trim())
        .unwrap_or(text);

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end >= start).then(|| text[start..=end].to_string())
}

/// Falls back to pulling a unified diff out of free text: a fenced
/// ` ```diff ` block if present, otherwise the first `--- ` onward.
fn extract_unified_diff(text: &str) -> Option<String> {
    if let Some(start) = text.find("```diff") {
        let after = &text[start + "```diff".len()..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim().to_string());
        }
    }
    let start = text.find("--- ")?;
    Some(text[start..].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ToolError, ToolHistoryEntry, ToolResult};
    use chrono::Utc;

    #[test]
    fn parses_a_clean_call_tool_response() {
        let action = LlmAgent::parse_response(
            r#"{"action": "call_tool", "tool": "RUN", "params": {"command": "pytest -q"}}"#,
            "r1".to_string(),
            &[],
        );
        match action {
            AgentAction::CallTool(req) => {
                assert_eq!(req.tool, ToolName::Run);
                assert_eq!(req.params["command"], "pytest -q");
            }
            _ => panic!("expected a tool call"),
        }
    }

    #[test]
    fn tolerates_prose_around_the_json_object() {
        let response = "Sure, here's my plan:\n{\"action\": \"stop\", \"reason\": \"success\", \"rationale\": \"tests pass\"}\nLet me know if you need anything else.";
        let action = LlmAgent::parse_response(response, "r1".to_string(), &[]);
        match action {
            AgentAction::Stop { reason, .. } => assert_eq!(reason, StopReason::Success),
            _ => panic!("expected stop"),
        }
    }

    #[test]
    fn falls_back_to_extracting_a_fenced_diff() {
        let response = "Here's the fix:\n```diff\n--- a/f.py\n+++ b/f.py\n@@ -1 +1 @@\n-old\n+new\n```";
        let action = LlmAgent::parse_response(response, "r1".to_string(), &[]);
        match action {
            AgentAction::CallTool(req) => assert_eq!(req.tool, ToolName::ApplyPatch),
            _ => panic!("expected an apply_patch call"),
        }
    }

    #[test]
    fn unparseable_response_is_a_give_up() {
        let action = LlmAgent::parse_response("I'm not sure what to do next.", "r1".to_string(), &[]);
        match action {
            AgentAction::Stop { reason, .. } => assert_eq!(reason, StopReason::AgentGaveUp),
            _ => panic!("expected stop"),
        }
    }

    fn list_files_entry(entries: &[&str]) -> ToolHistoryEntry {
        ToolHistoryEntry {
            request: ToolRequest {
                request_id: "r0".into(),
                tool: ToolName::ListFiles,
                params: serde_json::json!({"glob": "**/*"}),
            },
            result: ToolResult {
                request_id: "r0".into(),
                tool: ToolName::ListFiles,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                duration_sec: 0.1,
                data: Some(serde_json::json!({"entries": entries, "count": entries.len()})),
                error: None,
                exit_code: None,
                stdout_path: None,
                stderr_path: None,
            },
        }
    }

    #[test]
    fn unparseable_response_falls_back_to_reading_the_first_unread_listed_file() {
        let history = vec![list_files_entry(&["a.py", "b.py"])];
        let action = LlmAgent::parse_response("I'm not sure what to do next.", "r1".to_string(), &history);
        match action {
            AgentAction::CallTool(req) => {
                assert_eq!(req.tool, ToolName::ReadFile);
                assert_eq!(req.params["path"], "a.py");
            }
            _ => panic!("expected a read_file call"),
        }
    }

    #[test]
    fn the_read_file_fallback_skips_files_already_read() {
        let mut history = vec![list_files_entry(&["a.py", "b.py"])];
        history.push(ToolHistoryEntry {
            request: ToolRequest {
                request_id: "r1".into(),
                tool: ToolName::ReadFile,
                params: serde_json::json!({"path": "a.py"}),
            },
            result: ToolResult {
                request_id: "r1".into(),
                tool: ToolName::ReadFile,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                duration_sec: 0.1,
                data: Some(serde_json::json!({"content": "..."})),
                error: None,
                exit_code: None,
                stdout_path: None,
                stderr_path: None,
            },
        });
        let action = LlmAgent::parse_response("I'm not sure what to do next.", "r2".to_string(), &history);
        match action {
            AgentAction::CallTool(req) => {
                assert_eq!(req.tool, ToolName::ReadFile);
                assert_eq!(req.params["path"], "b.py");
            }
            _ => panic!("expected a read_file call"),
        }
    }

    #[test]
    fn with_every_listed_file_already_read_the_fallback_gives_up() {
        let mut history = vec![list_files_entry(&["a.py"])];
        history.push(ToolHistoryEntry {
            request: ToolRequest {
                request_id: "r1".into(),
                tool: ToolName::ReadFile,
                params: serde_json::json!({"path": "a.py"}),
            },
            result: ToolResult {
                request_id: "r1".into(),
                tool: ToolName::ReadFile,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                duration_sec: 0.1,
                data: Some(serde_json::json!({"content": "..."})),
                error: None,
                exit_code: None,
                stdout_path: None,
                stderr_path: None,
            },
        });
        let action = LlmAgent::parse_response("I'm not sure what to do next.", "r2".to_string(), &history);
        assert!(matches!(action, AgentAction::Stop { reason: StopReason::AgentGaveUp, .. }));
    }

    #[test]
    fn observation_includes_step_and_test_command() {
        let state = AgentState::new("run-1", "task-1", 10, 60.0);
        let observation = LlmAgent::format_observation(&state, "pytest -q");
        assert!(observation.contains("Step 0"));
        assert!(observation.contains("pytest -q"));
        assert!(observation.contains("No tool calls"));
    }

    #[test]
    fn observation_summarizes_prior_errors() {
        let mut state = AgentState::new("run-1", "task-1", 10, 60.0);
        state.history.push(ToolHistoryEntry {
            request: ToolRequest {
                request_id: "r0".into(),
                tool: ToolName::Run,
                params: serde_json::json!({"command": "pytest -q"}),
            },
            result: ToolResult {
                request_id: "r0".into(),
                tool: ToolName::Run,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                duration_sec: 0.1,
                data: None,
                error: Some(ToolError::new(crate::model::ToolErrorKind::AbnormalExit, "exit 1")),
                exit_code: Some(1),
                stdout_path: None,
                stderr_path: None,
            },
        });
        let observation = LlmAgent::format_observation(&state, "pytest -q");
        assert!(observation.contains("ERROR"));
    }
}
