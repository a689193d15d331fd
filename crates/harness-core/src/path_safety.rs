//! Path containment: every tool that touches the filesystem resolves its
//! path argument through here first.
//!
//! A path is accepted only if it canonicalizes to somewhere under the
//! workspace root and no component along the way is a symlink that would
//! carry it outside — a relative `../../etc/passwd` and an absolute
//! symlink planted mid-tree are refused the same way.

use std::path::{Path, PathBuf};

use crate::model::{ToolError, ToolErrorKind};

/// Prefixes an agent commonly prepends to a path because it is echoing back
/// the container-side view of the checkout rather than a workspace-relative
/// path. Stripped before the path is ever joined to `root`.
const WORKSPACE_PREFIXES: &[&str] = &["/workspace/repo/", "/workspace/", "workspace/repo/", "workspace/", "repo/"];

/// Strips a leading workspace/repo prefix an LLM-authored path commonly
/// carries, so `/workspace/repo/src/lib.rs` and `src/lib.rs` resolve
/// identically.
fn strip_workspace_prefix(relative_path: &str) -> &str {
    let stripped = relative_path.strip_prefix('/').unwrap_or(relative_path);
    for prefix in WORKSPACE_PREFIXES {
        if let Some(rest) = stripped.strip_prefix(prefix) {
            return rest;
        }
    }
    stripped
}

/// Resolves `relative_path` against `root`, rejecting escapes and symlinks.
///
/// Returns the canonicalized absolute path on success. If the path does not
/// exist yet (a write target), only the existing parent chain is
/// canonicalized and the leaf name is appended un-resolved.
///
/// Canonicalization happens first, so a symlink component is followed to its
/// real target before the escape check runs: a symlink landing outside the
/// workspace is rejected as `path_escape`, and a symlink landing safely
/// inside is allowed (the canonical path it resolves to has no symlink
/// components left for the walk below to find).
pub fn resolve_within(root: &Path, relative_path: &str) -> Result<PathBuf, ToolError> {
    let canon_root = root.canonicalize().map_err(|e| {
        ToolError::new(ToolErrorKind::PathEscape, format!("workspace root unreadable: {e}"))
    })?;

    let relative_path = strip_workspace_prefix(relative_path);
    let candidate = canon_root.join(relative_path);

    let resolved = match candidate.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            let parent = candidate.parent().ok_or_else(|| {
                ToolError::new(ToolErrorKind::PathEscape, "path has no parent")
            })?;
            let canon_parent = parent.canonicalize().map_err(|_| {
                ToolError::new(
                    ToolErrorKind::FileNotFound,
                    format!("parent directory of `{relative_path}` does not exist"),
                )
            })?;
            let file_name = candidate.file_name().ok_or_else(|| {
                ToolError::new(ToolErrorKind::PathEscape, "path has no file name")
            })?;
            canon_parent.join(file_name)
        }
    };

    // Canonicalization (which follows symlinks) happens before the escape
    // check and the symlink walk below — not after — so a symlink whose
    // target lands outside the workspace is caught here as `path_escape`
    // rather than surfacing as `symlink_blocked`.
    if !resolved.starts_with(&canon_root) {
        return Err(ToolError::new(
            ToolErrorKind::PathEscape,
            format!("`{relative_path}` resolves outside the workspace root"),
        )
        .with_detail("path", relative_path));
    }

    reject_symlink_components(&resolved, &canon_root)?;

    Ok(resolved)
}

/// Walks every already-existing component between `root` and `candidate`
/// and rejects the first symlink found.
fn reject_symlink_components(candidate: &Path, root: &Path) -> Result<(), ToolError> {
    let mut probe = root.to_path_buf();
    if let Ok(rel) = candidate.strip_prefix(root) {
        for component in rel.components() {
            probe.push(component);
            match std::fs::symlink_metadata(&probe) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(ToolError::new(
                        ToolErrorKind::SymlinkBlocked,
                        format!("`{}` is a symlink", probe.display()),
                    ));
                }
                _ => continue,
            }
        }
    }
    Ok(())
}

/// Directory entries `LIST_FILES` never descends into or reports, matching
/// the reference harness's notion of build/VCS noise.
const EXCLUDED_NAMES: &[&str] = &[".git", ".pytest_cache", "__pycache__", "build"];

/// Enumerates paths under `root` matching `glob`, relative to `root`, using
/// forward slashes regardless of platform.
///
/// `glob` supports `*` (any run of characters except `/`), `**` (any run of
/// characters including `/`), and `?` (a single character). Hidden entries
/// (dotfiles), [`EXCLUDED_NAMES`], and symlinks are never walked into or
/// returned. Results are sorted lexicographically.
pub fn glob_within(root: &Path, glob: &str) -> Result<Vec<String>, ToolError> {
    let canon_root = root.canonicalize().map_err(|e| {
        ToolError::new(ToolErrorKind::PathEscape, format!("workspace root unreadable: {e}"))
    })?;

    let pattern = glob_to_regex(glob);
    let mut matches = Vec::new();
    walk(&canon_root, &canon_root, &pattern, &mut matches)?;
    matches.sort();
    Ok(matches)
}

fn walk(
    root: &Path,
    dir: &Path,
    pattern: &regex::Regex,
    out: &mut Vec<String>,
) -> Result<(), ToolError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ToolError::new(ToolErrorKind::FileNotFound, format!("cannot list `{}`: {e}", dir.display()))
    })?;

    for entry in entries {
        let entry = entry.map_err(crate::tools::io_error)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || EXCLUDED_NAMES.contains(&name.as_str()) {
            continue;
        }
        let file_type = entry.file_type().map_err(super::tools::io_error)?;
        if file_type.is_symlink() {
            continue;
        }
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");

        if file_type.is_dir() {
            walk(root, &path, pattern, out)?;
        } else if pattern.is_match(&rel) {
            out.push(rel);
        }
    }
    Ok(())
}

/// Translates a shell-style glob into an anchored regex. `**` matches across
/// path separators, a lone `*` stops at one, `?` matches exactly one
/// character, and every other character is escaped literally.
fn glob_to_regex(glob: &str) -> regex::Regex {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    regex::Regex::new(&out).unwrap_or_else(|_| regex::Regex::new("$^").unwrap())
}
