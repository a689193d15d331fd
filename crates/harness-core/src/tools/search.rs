//! `SEARCH`: delegates to `rg --json`, scoped to the workspace root.

use std::time::Duration;

use serde_json::Value;

use crate::model::{ToolError, ToolErrorKind};

use super::{required_str, ToolContext};

const DEFAULT_MAX_RESULTS: usize = 50;

pub async fn call(ctx: &ToolContext, params: &Value) -> Result<Value, ToolError> {
    let query = required_str(params, "query")?.to_string();
    let is_regex = params.get("is_regex").and_then(|v| v.as_bool()).unwrap_or(true);
    let glob = params.get("glob").and_then(|v| v.as_str()).map(String::from);
    let context_lines = params.get("context_lines").and_then(|v| v.as_u64()).unwrap_or(0);
    let max_results = params
        .get("max_results")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_RESULTS);

    let workspace_root = ctx.workspace_root.clone();
    let timeout = Duration::from_secs(ctx.config.tool_timeouts.search_sec);

    let output = tokio::task::spawn_blocking(move || {
        let mut cmd = std::process::Command::new("rg");
        cmd.arg("--json");
        if !is_regex {
            cmd.arg("--fixed-strings");
        }
        cmd.arg("--context").arg(context_lines.to_string());
        cmd.arg(&query);
        if let Some(g) = glob {
            cmd.arg("--glob").arg(g);
        }
        cmd.current_dir(&workspace_root);
        cmd.output()
    });

    let output = match tokio::time::timeout(timeout, output).await {
        Ok(Ok(Ok(out))) => out,
        Ok(Ok(Err(e))) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ToolError::new(ToolErrorKind::RipgrepUnavailable, e.to_string()));
        }
        Ok(Ok(Err(e))) => return Err(super::io_error(e)),
        Ok(Err(join_err)) => {
            return Err(ToolError::catch_all("tokio::task::JoinError", join_err));
        }
        Err(_) => return Err(ToolError::new(ToolErrorKind::Timeout, "search timed out")),
    };

    // rg exits 1 when there are no matches and 2 on a real error; only the
    // latter is a tool error.
    if output.status.code() == Some(2) {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(ToolError::new(ToolErrorKind::RipgrepError, stderr));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);

    // rg interleaves "match" and "context" records in file order; a context
    // record belongs to whichever match it's adjacent to in the stream, so a
    // single linear pass with a trailing buffer recovers before/after groups
    // without needing to re-sort by line number.
    #[derive(Clone)]
    struct Line {
        file: String,
        line: u64,
        text: String,
    }
    let mut records: Vec<(bool, Line)> = Vec::new();
    for raw in stdout.lines() {
        let Ok(obj) = serde_json::from_str::<serde_json::Value>(raw) else {
            continue;
        };
        let kind = obj.get("type").and_then(|t| t.as_str());
        if kind != Some("match") && kind != Some("context") {
            continue;
        }
        let Some(data) = obj.get("data") else { continue };
        let file = data.pointer("/path/text").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let line = data.get("line_number").and_then(|v| v.as_u64()).unwrap_or(0);
        let text = data
            .pointer("/lines/text")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim_end_matches('\n')
            .to_string();
        records.push((kind == Some("match"), Line { file, line, text }));
    }

    let total_matches = records.iter().filter(|(is_match, _)| *is_match).count();
    let mut matches = Vec::new();
    let mut pending_before: Vec<&Line> = Vec::new();
    let mut i = 0;
    while i < records.len() {
        let (is_match, line) = &records[i];
        if !is_match {
            pending_before.push(line);
            i += 1;
            continue;
        }
        if matches.len() >= max_results {
            pending_before.clear();
            i += 1;
            continue;
        }
        let mut after = Vec::new();
        let mut j = i + 1;
        while j < records.len() && !records[j].0 {
            after.push(&records[j].1);
            j += 1;
        }
        matches.push(serde_json::json!({
            "file": line.file,
            "line": line.line,
            "content": line.text,
            "context_before": pending_before.iter().map(|l| l.text.clone()).collect::<Vec<_>>(),
            "context_after": after.iter().map(|l| l.text.clone()).collect::<Vec<_>>(),
        }));
        pending_before.clear();
        i = j;
    }

    Ok(serde_json::json!({
        "matches": matches,
        "total_matches": total_matches,
        "truncated": total_matches > matches.len(),
    }))
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

    #[tokio::test]
    async fn finds_literal_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}\n").unwrap();
        let result = call(&ctx(dir.path()), &serde_json::json!({"query": "fn main"}))
            .await
            .unwrap();
        assert_eq!(result["total_matches"], 1);
    }

    #[tokio::test]
    async fn no_matches_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "nothing here\n").unwrap();
        let result = call(&ctx(dir.path()), &serde_json::json!({"query": "zzz_no_match"}))
            .await
            .unwrap();
        assert_eq!(result["total_matches"], 0);
    }

    #[tokio::test]
    async fn missing_pattern_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = call(&ctx(dir.path()), &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err.kind, ToolErrorKind::ParseError));
    }

    #[tokio::test]
    async fn match_carries_surrounding_context_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "one\ntwo\ndef target():\n    pass\nfour\n").unwrap();
        let result = call(
            &ctx(dir.path()),
            &serde_json::json!({"query": "def target", "context_lines": 1}),
        )
        .await
        .unwrap();
        let m = &result["matches"][0];
        assert_eq!(m["content"], "def target():");
        assert_eq!(m["context_before"], serde_json::json!(["two"]));
        assert_eq!(m["context_after"], serde_json::json!(["    pass"]));
    }
}
