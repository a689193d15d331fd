//! `APPLY_PATCH`: applies a unified diff to the workspace.
//!
//! The heavy lifting (normalization ladder, external `patch` binary, fuzzy
//! fallback) lives in [`crate::patch::apply_patch`]; this module is just the
//! tool-contract wrapper around it, plus writing the applied diff to the
//! artifact directory for post-attempt inspection.

use serde_json::Value;

use crate::model::ToolError;
use crate::patch::apply_patch as apply_diff;

use super::{required_str, ToolContext};

pub async fn call(ctx: &ToolContext, params: &Value) -> Result<Value, ToolError> {
    let diff_text = required_str(params, "patch")?;

    let outcome = apply_diff(
        ctx.sandbox.as_ref(),
        &ctx.workspace_root,
        diff_text,
        ctx.config.strict_patch_mode,
    )
    .await?;

    let patch_path = write_patch_artifact(ctx, diff_text);

    Ok(serde_json::json!({
        "stage_used": outcome.stage_used,
        "changed_files": outcome.files_changed,
        "via_fuzzy_fallback": outcome.via_fuzzy_fallback,
        "patch_size_bytes": diff_text.len(),
        "patch_path": patch_path,
    }))
}

fn write_patch_artifact(ctx: &ToolContext, diff_text: &str) -> Option<String> {
    let dir = ctx.artifacts_dir.as_ref()?;
    let diffs_dir = dir.join("diffs");
    std::fs::create_dir_all(&diffs_dir).ok()?;
    let path = diffs_dir.join(format!("step_{:04}.patch", ctx.step_id));
    std::fs::write(&path, diff_text).ok()?;
    Some(path.to_string_lossy().to_string())
}
