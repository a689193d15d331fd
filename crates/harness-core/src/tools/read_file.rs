//! `READ_FILE`: reads a text file, optionally a line range, with an
//! explicit head/tail truncation marker when the requested range exceeds
//! the configured line budget (`spec.md` §4.4).

use serde_json::Value;

use crate::model::{ToolError, ToolErrorKind};
use crate::path_safety::resolve_within;
use crate::truncate::{truncate_lines, truncate_str};

use super::{required_str, ToolContext};

pub async fn call(ctx: &ToolContext, params: &Value) -> Result<Value, ToolError> {
    let path = required_str(params, "path")?;
    let start_line = params.get("start_line").and_then(|v| v.as_u64()).map(|n| n as usize);
    let end_line = params.get("end_line").and_then(|v| v.as_u64()).map(|n| n as usize);

    let full_path = resolve_within(std::path::Path::new(&ctx.workspace_root), path)?;

    let raw = std::fs::read(&full_path).map_err(super::io_error)?;
    let content = String::from_utf8(raw).map_err(|_| {
        ToolError::new(ToolErrorKind::BinaryFile, format!("`{path}` is not valid UTF-8 text"))
    })?;

    let total_lines = content.lines().count();
    let (selected, explicit_range) = match (start_line, end_line) {
        (None, None) => (content, None),
        _ => {
            let lines: Vec<&str> = content.lines().collect();
            let start = start_line.unwrap_or(1).max(1) - 1;
            let end = end_line.unwrap_or(total_lines).min(total_lines);
            if start >= end {
                (String::new(), Some((start + 1, end)))
            } else {
                (lines[start..end].join("\n"), Some((start + 1, end)))
            }
        }
    };

    let (line_truncated_content, was_line_truncated, selected_line_count, lines_included) =
        truncate_lines(&selected, ctx.config.output_truncation_lines);
    let final_content = truncate_str(&line_truncated_content, ctx.config.output_truncation_chars);
    let was_char_truncated = final_content.len() != line_truncated_content.len();

    let mut data = serde_json::json!({
        "path": path,
        "content": final_content,
        "total_lines": total_lines,
        "truncated": was_line_truncated || was_char_truncated,
    });
    if let Some((start, end)) = explicit_range {
        data["start_line"] = serde_json::json!(start);
        data["end_line"] = serde_json::json!(end);
    }
    if let Some(included) = lines_included {
        // Ranges from `truncate_lines` are relative to the selected slice;
        // re-base onto the file's own line numbering when an explicit
        // `start_line` shifted that slice away from line 1.
        let base = explicit_range.map(|(start, _)| start - 1).unwrap_or(0);
        data["lines_included"] = serde_json::json!([
            [included.head.0 + base, included.head.1 + base],
            [included.tail.0 + base, included.tail.1 + base],
        ]);
    } else {
        let (start, end) = explicit_range.unwrap_or((
            usize::from(selected_line_count > 0),
            selected_line_count,
        ));
        data["lines_included"] = serde_json::json!([[start, end]]);
    }
    Ok(data)
}
