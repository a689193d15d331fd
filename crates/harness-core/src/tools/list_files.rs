//! `LIST_FILES`: recursive glob listing scoped to the workspace root.
//!
//! `root` selects the subdirectory to enumerate from (empty means the
//! workspace root itself); `glob` selects which files within it show up.
//! The default glob, `*`, lists one directory level; `**/*` walks the whole
//! subtree. Hidden entries, VCS/build noise, and symlinks are never listed,
//! matching [`crate::path_safety::glob_within`].

use serde_json::Value;

use crate::path_safety::{glob_within, resolve_within};

use super::ToolContext;
use crate::model::ToolError;

const DEFAULT_GLOB: &str = "*";

pub async fn call(ctx: &ToolContext, params: &Value) -> Result<Value, ToolError> {
    let root_param = params.get("root").and_then(|v| v.as_str()).unwrap_or("");
    let glob = params.get("glob").and_then(|v| v.as_str()).unwrap_or(DEFAULT_GLOB);
    let workspace_root = std::path::Path::new(&ctx.workspace_root);

    let scan_dir = if root_param.is_empty() {
        workspace_root.canonicalize().map_err(super::io_error)?
    } else {
        resolve_within(workspace_root, root_param)?
    };

    let entries = glob_within(&scan_dir, glob)?;
    let count = entries.len();

    Ok(serde_json::json!({
        "root": root_param,
        "glob": glob,
        "entries": entries,
        "count": count,
    }))
}
