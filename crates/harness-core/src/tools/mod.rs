//! The five tools an agent can call: `LIST_FILES`, `READ_FILE`, `SEARCH`,
//! `APPLY_PATCH`, `RUN`.
//!
//! Every tool takes a JSON params value and returns a JSON data value or a
//! [`ToolError`](crate::model::ToolError); dispatch lives in [`dispatch`].

pub mod apply_patch;
pub mod list_files;
pub mod read_file;
pub mod run;
pub mod search;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::config::HarnessConfig;
use crate::model::{ToolError, ToolErrorKind, ToolName, ToolRequest, ToolResult};
use crate::sandbox::Sandbox;

/// Everything a tool call needs beyond its own JSON params.
pub struct ToolContext {
    pub sandbox: Arc<dyn Sandbox>,
    pub workspace_root: String,
    pub config: HarnessConfig,
    /// The task's authoritative test command, used by `RUN` to flag when an
    /// invocation is (structurally) the test command rather than a generic
    /// shell command. `None` outside a task-bound run (e.g. a standalone
    /// tool test).
    pub test_command: Option<String>,
    /// Directory artifacts (tool stdout/stderr, applied patches) are written
    /// under. `None` skips artifact persistence entirely.
    pub artifacts_dir: Option<PathBuf>,
    /// The agent-loop step this call belongs to, used only to name artifact
    /// files.
    pub step_id: u64,
}

/// Executes one tool request, timing it and wrapping the result (or error)
/// into a [`ToolResult`] ready to log and hand back to the agent.
///
/// `exit_code`/`stdout_path`/`stderr_path` are lifted onto the result
/// whenever a tool's own payload (success data or error details) carries
/// them under those same keys — this is how `RUN`'s artifacts surface
/// without every other tool needing to know about them.
pub async fn dispatch(ctx: &ToolContext, request: ToolRequest) -> ToolResult {
    let started_at = Utc::now();
    let started = std::time::Instant::now();

    let outcome = match request.tool {
        ToolName::ListFiles => list_files::call(ctx, &request.params).await,
        ToolName::ReadFile => read_file::call(ctx, &request.params).await,
        ToolName::Search => search::call(ctx, &request.params).await,
        ToolName::ApplyPatch => apply_patch::call(ctx, &request.params).await,
        ToolName::Run => run::call(ctx, &request.params).await,
    };

    let ended_at = Utc::now();
    let duration_sec = started.elapsed().as_secs_f64();

    match outcome {
        Ok(data) => {
            let (exit_code, stdout_path, stderr_path) = lift_artifact_fields(&data);
            ToolResult {
                request_id: request.request_id,
                tool: request.tool,
                started_at,
                ended_at,
                duration_sec,
                data: Some(data),
                error: None,
                exit_code,
                stdout_path,
                stderr_path,
            }
        }
        Err(error) => {
            let details = serde_json::Value::Object(error.details.clone());
            let (exit_code, stdout_path, stderr_path) = lift_artifact_fields(&details);
            ToolResult {
                request_id: request.request_id,
                tool: request.tool,
                started_at,
                ended_at,
                duration_sec,
                data: None,
                error: Some(error),
                exit_code,
                stdout_path,
                stderr_path,
            }
        }
    }
}

fn lift_artifact_fields(value: &serde_json::Value) -> (Option<i32>, Option<String>, Option<String>) {
    let exit_code = value.get("exit_code").and_then(|v| v.as_i64()).map(|v| v as i32);
    let stdout_path = value.get("stdout_path").and_then(|v| v.as_str()).map(String::from);
    let stderr_path = value.get("stderr_path").and_then(|v| v.as_str()).map(String::from);
    (exit_code, stdout_path, stderr_path)
}

/// Extracts a required string field from a params object.
pub(crate) fn required_str<'a>(
    params: &'a serde_json::Value,
    field: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ToolError::new(
                ToolErrorKind::ParseError,
                format!("missing or non-string `{field}` parameter"),
            )
        })
}

/// Catch-all conversion for the small number of stdlib errors a tool can
/// surface that don't already carry a `ToolErrorKind`.
pub(crate) fn io_error(err: std::io::Error) -> ToolError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ToolError::new(ToolErrorKind::FileNotFound, err.to_string())
    } else {
        ToolError::catch_all("std::io::Error", err)
    }
}
