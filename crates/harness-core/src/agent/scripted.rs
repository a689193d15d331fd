//! Deterministic scripted agent: a fixed sequence of tool calls with no
//! model in the loop at all, used to validate the harness end-to-end
//! (sandboxing, patch application, event logging, budget accounting)
//! without depending on LLM availability or quality.
//!
//! Bypasses `decide()`'s free-form parsing entirely — each step just looks
//! up the next entry in its script by index.

use serde_json::Value;

use crate::model::{AgentAction, AgentState, StopReason, ToolName, ToolRequest};

/// One planned call, executed unconditionally at its position in the
/// sequence regardless of how prior steps turned out.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub tool: ToolName,
    pub params: Value,
}

/// Plays back a fixed sequence of tool calls, then stops.
pub struct ScriptedAgent {
    steps: Vec<ScriptedStep>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self { steps }
    }

    /// The canonical fixture sequence: list the tree, read the file under
    /// test, search for the function being patched, apply a known-good
    /// diff, then run the test command. Exercises every tool exactly once.
    pub fn fixture(target_file: &str, search_term: &str, diff: &str, test_command: &str) -> Self {
        Self::new(vec![
            ScriptedStep {
                tool: ToolName::ListFiles,
                params: serde_json::json!({"glob": "**/*"}),
            },
            ScriptedStep {
                tool: ToolName::ReadFile,
                params: serde_json::json!({"path": target_file}),
            },
            ScriptedStep {
                tool: ToolName::Search,
                params: serde_json::json!({"query": search_term}),
            },
            ScriptedStep {
                tool: ToolName::ApplyPatch,
                params: serde_json::json!({"patch": diff}),
            },
            ScriptedStep {
                tool: ToolName::Run,
                params: serde_json::json!({"command": test_command}),
            },
        ])
    }

    /// Returns the next scripted action. `state.step` indexes directly into
    /// the script; once exhausted, the agent stops and reports success —
    /// the loop's own test re-run is what actually decides pass/fail.
    pub fn decide(&self, state: &AgentState) -> AgentAction {
        match self.steps.get(state.step as usize) {
            Some(step) => AgentAction::CallTool(ToolRequest {
                request_id: format!("scripted-{}", state.step),
                tool: step.tool,
                params: step.params.clone(),
            }),
            None => AgentAction::Stop {
                reason: StopReason::Success,
                rationale: "scripted sequence complete".to_string(),
            },
        }
    }
}
