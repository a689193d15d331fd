//! `RUN`: executes a shell command through the configured sandbox.
//!
//! Unlike the other four tools this one is explicitly not path-restricted —
//! the command runs with the full authority the sandbox grants it — but it
//! is time-bounded and its stdout/stderr are captured rather than streamed,
//! matching how the reference harness treats command output as an artifact.
//!
//! A non-zero exit is not itself a tool failure from the shell's point of
//! view, but the agent loop needs to see it as an error to apply its
//! repeated-failure detection uniformly across tools — so it's surfaced as
//! an `abnormal_exit` [`ToolError`] carrying the same data a success would,
//! in `details`.

use std::time::Duration;

use serde_json::Value;

use crate::model::{ToolError, ToolErrorKind};
use crate::sandbox::{Network, SandboxCommand};

use super::{required_str, ToolContext};

pub async fn call(ctx: &ToolContext, params: &Value) -> Result<Value, ToolError> {
    let command = required_str(params, "command")?.to_string();
    let cwd = params
        .get("cwd")
        .and_then(|v| v.as_str())
        .unwrap_or(&ctx.workspace_root)
        .to_string();
    let timeout_sec = params
        .get("timeout_sec")
        .and_then(|v| v.as_u64())
        .unwrap_or(ctx.config.tool_timeouts.run_sec);

    let mut sandbox_cmd = SandboxCommand::new(command.clone(), cwd, Duration::from_secs(timeout_sec))
        .with_network(Network::None);

    if let Some(extra_env) = params.get("env").and_then(|v| v.as_object()) {
        for (key, value) in extra_env {
            if let Some(s) = value.as_str() {
                sandbox_cmd.env.insert(key.clone(), s.to_string());
            }
        }
    }

    let output = ctx.sandbox.run(sandbox_cmd).await?;

    let is_test_command = is_test_command(&command, ctx.test_command.as_deref());

    let stdout = crate::truncate::truncate_str(&output.stdout, ctx.config.output_truncation_chars);
    let stderr = crate::truncate::truncate_str(&output.stderr, ctx.config.output_truncation_chars);
    let stdout_truncated = stdout.len() != output.stdout.len();
    let stderr_truncated = stderr.len() != output.stderr.len();

    let combined = format!("{}{}", output.stdout, output.stderr);
    let (combined_output, combined_truncated, _, combined_lines_included) =
        crate::truncate::truncate_lines(&combined, ctx.config.output_truncation_lines);
    let (head_lines, tail_lines) = combined_lines_included
        .map(|r| (r.head.1 - r.head.0 + 1, r.tail.1 - r.tail.0 + 1))
        .unwrap_or((0, 0));

    let (stdout_path, stderr_path) = write_artifacts(ctx, &output.stdout, &output.stderr);

    let mut data = serde_json::json!({
        "command": command,
        "exit_code": output.exit_code,
        "stdout": stdout,
        "stderr": stderr,
        "duration_sec": output.duration.as_secs_f64(),
        "timed_out": output.timed_out,
        "is_test_command": is_test_command,
        "stdout_bytes": output.stdout.len(),
        "stderr_bytes": output.stderr.len(),
        "stdout_lines": output.stdout.lines().count(),
        "stderr_lines": output.stderr.lines().count(),
        "stdout_truncated": stdout_truncated,
        "stderr_truncated": stderr_truncated,
        "combined_output": combined_output,
        "combined_truncated": combined_truncated,
        "kept_head_lines": head_lines,
        "kept_tail_lines": tail_lines,
    });
    if let Some(p) = &stdout_path {
        data["stdout_path"] = serde_json::json!(p);
    }
    if let Some(p) = &stderr_path {
        data["stderr_path"] = serde_json::json!(p);
    }

    if output.exit_code != 0 {
        let mut err = ToolError::new(
            ToolErrorKind::AbnormalExit,
            format!("command exited with status {}", output.exit_code),
        );
        for (key, value) in data.as_object().unwrap() {
            err.details.insert(key.clone(), value.clone());
        }
        return Err(err);
    }

    Ok(data)
}

/// Normalizes a command to whitespace-collapsed tokens and checks it against
/// the task's configured test command. Falls back to `false` when the task
/// carries no test command (a standalone tool call outside an attempt).
pub(crate) fn is_test_command(command: &str, task_test_command: Option<&str>) -> bool {
    let Some(test_command) = task_test_command else {
        return false;
    };
    normalize_command(command) == normalize_command(test_command)
}

fn normalize_command(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Writes full (untruncated) stdout/stderr to the artifact directory, named
/// by step, if one is configured. Returns the written paths.
fn write_artifacts(ctx: &ToolContext, stdout: &str, stderr: &str) -> (Option<String>, Option<String>) {
    let Some(dir) = &ctx.artifacts_dir else {
        return (None, None);
    };
    let logs_dir = dir.join("logs");
    if std::fs::create_dir_all(&logs_dir).is_err() {
        return (None, None);
    }

    let stdout_file = logs_dir.join(format!("tool_step_{:04}_stdout.txt", ctx.step_id));
    let stderr_file = logs_dir.join(format!("tool_step_{:04}_stderr.txt", ctx.step_id));

    let stdout_path = std::fs::write(&stdout_file, stdout)
        .ok()
        .map(|_| stdout_file.to_string_lossy().to_string());
    let stderr_path = std::fs::write(&stderr_file, stderr)
        .ok()
        .map(|_| stderr_file.to_string_lossy().to_string());

    (stdout_path, stderr_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::sandbox::HostSandbox;
    use std::sync::Arc;

    fn ctx(root: &std::path::Path) -> ToolContext {
        ToolContext {
            sandbox: Arc::new(HostSandbox::new()),
            workspace_root: root.to_string_lossy().to_string(),
            config: HarnessConfig::test_config(),
            test_command: None,
            artifacts_dir: None,
            step_id: 0,
        }
    }

    fn ctx_with_test_command(root: &std::path::Path, test_command: &str) -> ToolContext {
        ToolContext {
            test_command: Some(test_command.to_string()),
            ..ctx(root)
        }
    }

    #[tokio::test]
    async fn runs_command_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = call(&ctx(dir.path()), &serde_json::json!({"command": "echo hi"}))
            .await
            .unwrap();
        assert_eq!(result["exit_code"], 0);
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "hi");
    }

    #[tokio::test]
    async fn flags_the_tasks_configured_test_command() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with_test_command(dir.path(), "echo hi");
        let result = call(&ctx, &serde_json::json!({"command": "echo   hi"})).await.unwrap();
        assert_eq!(result["is_test_command"], true);
    }

    #[tokio::test]
    async fn non_matching_command_not_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with_test_command(dir.path(), "pytest -q");
        let result = call(&ctx, &serde_json::json!({"command": "ls"})).await.unwrap();
        assert_eq!(result["is_test_command"], false);
    }

    #[tokio::test]
    async fn without_a_task_test_command_nothing_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let result = call(&ctx(dir.path()), &serde_json::json!({"command": "pytest -q"}))
            .await
            .unwrap();
        assert_eq!(result["is_test_command"], false);
    }

    #[tokio::test]
    async fn nonzero_exit_becomes_an_abnormal_exit_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = call(&ctx(dir.path()), &serde_json::json!({"command": "exit 3"}))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ToolErrorKind::AbnormalExit));
        assert_eq!(err.details["exit_code"], 3);
    }

    #[tokio::test]
    async fn respects_per_call_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let err = call(
            &ctx(dir.path()),
            &serde_json::json!({"command": "sleep 5", "timeout_sec": 1}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.details["timed_out"], true);
    }

    #[tokio::test]
    async fn reports_byte_and_line_counts() {
        let dir = tempfile::tempdir().unwrap();
        let result = call(&ctx(dir.path()), &serde_json::json!({"command": "printf 'a\\nb\\n'"}))
            .await
            .unwrap();
        assert_eq!(result["stdout_lines"], 2);
        assert_eq!(result["stdout_bytes"], 4);
        assert_eq!(result["stdout_truncated"], false);
        assert_eq!(result["combined_truncated"], false);
    }

    #[tokio::test]
    async fn combined_output_preview_is_line_truncated_for_long_output() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = "seq 1 500";
        let result = call(&ctx(dir.path()), &serde_json::json!({"command": cmd})).await.unwrap();
        assert_eq!(result["combined_truncated"], true);
        assert!(result["kept_head_lines"].as_u64().unwrap() > 0);
        assert!(result["kept_tail_lines"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn writes_stdout_and_stderr_artifacts_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        ctx.artifacts_dir = Some(artifacts.path().to_path_buf());
        ctx.step_id = 7;
        let result = call(&ctx, &serde_json::json!({"command": "echo hi"})).await.unwrap();
        let stdout_path = result["stdout_path"].as_str().unwrap();
        assert!(stdout_path.ends_with("tool_step_0007_stdout.txt"));
        assert!(std::path::Path::new(stdout_path).exists());
    }
}
