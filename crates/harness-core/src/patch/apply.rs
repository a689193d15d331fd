//! Drives the external `patch` binary through the normalization retry
//! ladder, then falls back to in-process fuzzy hunk application when the
//! harness isn't running in strict mode.
//!
//! The `patch --dry-run -p1 -d <root> -i <file>` invocation is exactly how
//! the reference harness validates a diff before committing it, so a
//! successful dry run is re-run for real rather than risking divergent
//! behavior between validation and application.

use std::time::Duration;

use harness_support::{PatchConfig, PatchEngine, PatchHunk as FuzzyHunk};

use crate::model::{PatchHunk, PatchLine, ToolError, ToolErrorKind};
use crate::path_safety;
use crate::sandbox::{Network, Sandbox, SandboxCommand};

use super::dialects::{detect as detect_dialect, strip_markdown_wrapping, to_canonical, PatchDialect};
use super::normalize::{normalize_attempt, parses_cleanly, repair_headers_and_prefixes, rewrite_paths, NormalizeStage};

const PATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How far a hunk's anchor may have drifted from its declared `old_start`
/// before the pre-check gives up looking for a verbatim match — the same
/// tolerance the external `patch` tool's own `--fuzz` defaults to.
const FUZZ_WINDOW: isize = 3;

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub stage_used: String,
    pub files_changed: Vec<String>,
    pub via_fuzzy_fallback: bool,
}

/// Attempts to land `diff_text` in the working tree at `workspace_root`.
///
/// Tries each normalization stage against the real `patch` binary first; if
/// every stage fails and `strict` is false, falls back to matching each
/// hunk's old/new line blocks directly against file contents with
/// progressively fuzzier matching.
pub async fn apply_patch(
    sandbox: &dyn Sandbox,
    workspace_root: &str,
    diff_text: &str,
    strict: bool,
) -> Result<ApplyOutcome, ToolError> {
    // §4.3 pipeline step 2: strip markdown/quote wrapping. Dialect detection
    // happens on the unwrapped-but-otherwise-untouched text — steps 1 and 3
    // below both only make sense for (and are only applied to) the
    // unified-diff dialect, and running them first could corrupt an envelope
    // patch's `*** End Patch` terminator, which has no `--- `/`+++ ` lines to
    // key off of.
    let unwrapped = strip_markdown_wrapping(diff_text);
    let dialect = detect_dialect(&unwrapped);

    if dialect != PatchDialect::UnifiedDiff {
        if strict {
            return Err(ToolError::new(
                ToolErrorKind::PatchHunkFail,
                "patch is not a canonical unified diff (strict mode rejects the Begin Patch envelope and context-patch dialects)",
            ));
        }
        // Neither dialect carries trustworthy line numbers, so there is no
        // point handing them to the external `patch` binary: go straight to
        // content-based fuzzy application.
        let canonical = to_canonical(&unwrapped, dialect)?;
        validate_paths_and_existence(workspace_root, &canonical)?;
        return apply_fuzzy_fallback(workspace_root, &canonical);
    }

    // §4.3 pipeline steps 1, 3, 4: join a split `---`/`+++` header onto its
    // path line, add a leading space to a hunk body line that dropped its
    // sigil entirely, then rewrite file paths against the workspace's actual
    // layout. The first two are unconditional text repairs; the third needs
    // the filesystem, so it can't be folded into the pure-text stage ladder
    // below.
    let path_fixed = rewrite_paths(&repair_headers_and_prefixes(&unwrapped), workspace_root);

    // Pre-flight pass ahead of ever invoking the external `patch` binary:
    // path escapes and a missing old file are fatal regardless of mode, but
    // context that has drifted beyond the fuzz window just means the exact
    // `patch` tool has no chance of landing it — skip straight to the fuzzy
    // fallback rather than burning a dry-run attempt per normalization stage.
    validate_paths_and_existence(workspace_root, &path_fixed)?;
    if !fuzz_window_matches(workspace_root, &path_fixed)? {
        if strict {
            return Err(ToolError::new(
                ToolErrorKind::PatchHunkFail,
                "hunk context has drifted beyond the fuzz window (strict mode: no fuzzy fallback)",
            ));
        }
        return apply_fuzzy_fallback(workspace_root, &path_fixed);
    }

    // Stages apply cumulatively — each stage's output feeds the next, so by
    // the time `NormalizedNoEofMarkers` runs it sees the already-recounted
    // text from `RecomputedHunkCounts` rather than a fresh copy of the
    // original, matching §4.3's "each step re-invoking dry-run apply"
    // description of one pipeline being built up in sequence.
    let mut candidate = path_fixed.clone();
    for stage in NormalizeStage::all() {
        candidate = normalize_attempt(&candidate, *stage);
        if parses_cleanly(&candidate).is_none() {
            continue;
        }

        if try_patch_binary(sandbox, workspace_root, &candidate).await? {
            let files = parses_cleanly(&candidate)
                .unwrap_or_default()
                .iter()
                .filter_map(|f| f.new_path.clone().or_else(|| f.old_path.clone()))
                .collect();
            return Ok(ApplyOutcome {
                stage_used: format!("{stage:?}"),
                files_changed: files,
                via_fuzzy_fallback: false,
            });
        }
    }

    if strict {
        return Err(ToolError::new(
            ToolErrorKind::PatchHunkFail,
            "patch did not apply under any normalization stage (strict mode: no fuzzy fallback)",
        ));
    }

    apply_fuzzy_fallback(workspace_root, &path_fixed)
}

/// Fatal regardless of mode: a path that escapes the workspace, or a
/// non-create hunk naming an old file that doesn't exist. Fuzzy matching
/// can't rescue either — there is nothing on disk to match against.
fn validate_paths_and_existence(workspace_root: &str, diff_text: &str) -> Result<(), ToolError> {
    let files = super::parse(diff_text)?;
    let root = std::path::Path::new(workspace_root);

    for file in &files {
        for path in [&file.old_path, &file.new_path].into_iter().flatten() {
            path_safety::resolve_within(root, path).map_err(|e| {
                ToolError::new(ToolErrorKind::PatchHunkFail, e.message).with_detail("path", path.clone())
            })?;
        }

        if let Some(old_path) = &file.old_path {
            if !root.join(old_path).is_file() {
                return Err(ToolError::new(
                    ToolErrorKind::PatchHunkFail,
                    format!("`{old_path}` does not exist; cannot apply hunks against it"),
                )
                .with_detail("path", old_path.clone()));
            }
        }
    }
    Ok(())
}

/// Whether every hunk's old-side lines (context + removals) appear verbatim
/// as a contiguous block somewhere within [`FUZZ_WINDOW`] lines of their
/// declared `old_start` — mirroring the window the external `patch` tool's
/// own fuzz tolerance searches once the exact line number no longer lines
/// up. Assumes [`validate_paths_and_existence`] already confirmed every old
/// file exists.
fn fuzz_window_matches(workspace_root: &str, diff_text: &str) -> Result<bool, ToolError> {
    let files = super::parse(diff_text)?;
    let root = std::path::Path::new(workspace_root);

    for file in &files {
        let Some(old_path) = &file.old_path else { continue };
        let contents = std::fs::read_to_string(root.join(old_path)).map_err(|e| {
            ToolError::new(ToolErrorKind::PatchHunkFail, format!("cannot read `{old_path}`: {e}"))
                .with_detail("path", old_path.clone())
        })?;
        let file_lines: Vec<&str> = contents.lines().collect();

        for hunk in &file.hunks {
            if !hunk_matches_within_fuzz_window(hunk, &file_lines) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn hunk_matches_within_fuzz_window(hunk: &PatchHunk, file_lines: &[&str]) -> bool {
    let old_lines: Vec<&str> = hunk
        .lines
        .iter()
        .filter_map(|l| match l {
            PatchLine::Context(s) | PatchLine::Removal(s) => Some(s.as_str()),
            PatchLine::Addition(_) | PatchLine::NoNewlineMarker => None,
        })
        .collect();

    if old_lines.is_empty() {
        return true;
    }

    let declared_start = hunk.old_start.saturating_sub(1) as isize;
    for offset in -FUZZ_WINDOW..=FUZZ_WINDOW {
        let start = declared_start + offset;
        if start < 0 {
            continue;
        }
        let start = start as usize;
        let end = start + old_lines.len();
        if end > file_lines.len() {
            continue;
        }
        if file_lines[start..end] == old_lines[..] {
            return true;
        }
    }
    false
}

async fn try_patch_binary(
    sandbox: &dyn Sandbox,
    workspace_root: &str,
    diff_text: &str,
) -> Result<bool, ToolError> {
    let patch_file = tempfile::NamedTempFile::new().map_err(|e| {
        ToolError::new(ToolErrorKind::SandboxError, format!("cannot create temp patch file: {e}"))
    })?;
    std::fs::write(patch_file.path(), diff_text).map_err(|e| {
        ToolError::new(ToolErrorKind::SandboxError, format!("cannot write temp patch file: {e}"))
    })?;
    let patch_path = patch_file.path().to_string_lossy().to_string();

    let dry_run = SandboxCommand::new(
        format!("patch --dry-run -p1 -d {workspace_root} -i {patch_path}"),
        ".",
        PATCH_TIMEOUT,
    )
    .with_network(Network::None);

    let dry_out = sandbox.run(dry_run).await?;
    if dry_out.exit_code != 0 {
        return Ok(false);
    }

    let real_run = SandboxCommand::new(
        format!("patch -p1 -d {workspace_root} -i {patch_path}"),
        ".",
        PATCH_TIMEOUT,
    )
    .with_network(Network::None);
    let real_out = sandbox.run(real_run).await?;
    Ok(real_out.exit_code == 0)
}

/// Applies every hunk of every file patch directly against disk, using
/// `harness_support`'s whitespace/fuzzy matcher when an exact match fails.
fn apply_fuzzy_fallback(workspace_root: &str, diff_text: &str) -> Result<ApplyOutcome, ToolError> {
    let files = super::parse(diff_text)?;
    let engine = PatchEngine::new(PatchConfig::default());
    let mut changed = Vec::new();

    for file in &files {
        let rel_path = file
            .new_path
            .clone()
            .or_else(|| file.old_path.clone())
            .ok_or_else(|| ToolError::new(ToolErrorKind::ParseError, "patch names no path"))?;
        let full_path = std::path::Path::new(workspace_root).join(&rel_path);

        let original = if file.old_path.is_some() {
            std::fs::read_to_string(&full_path).map_err(|e| {
                ToolError::new(
                    ToolErrorKind::FileNotFound,
                    format!("cannot read `{rel_path}` for patching: {e}"),
                )
            })?
        } else {
            String::new()
        };

        let fuzzy_hunks = file.hunks.iter().map(to_fuzzy_hunk).collect::<Vec<_>>();
        let result = engine.apply(&original, &fuzzy_hunks);
        if !result.success {
            return Err(ToolError::new(
                ToolErrorKind::PatchHunkFail,
                format!("fuzzy fallback failed to apply all hunks in `{rel_path}`"),
            )
            .with_detail("path", rel_path));
        }

        let patched = result.patched_content.unwrap_or_default();
        if file.new_path.is_none() {
            std::fs::remove_file(&full_path).map_err(|e| {
                ToolError::new(ToolErrorKind::SandboxError, format!("cannot delete `{rel_path}`: {e}"))
            })?;
        } else {
            if let Some(parent) = full_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::write(&full_path, patched).map_err(|e| {
                ToolError::new(ToolErrorKind::SandboxError, format!("cannot write `{rel_path}`: {e}"))
            })?;
        }
        changed.push(rel_path);
    }

    Ok(ApplyOutcome {
        stage_used: "fuzzy_fallback".to_string(),
        files_changed: changed,
        via_fuzzy_fallback: true,
    })
}

fn to_fuzzy_hunk(hunk: &crate::model::PatchHunk) -> FuzzyHunk {
    let mut old_lines = Vec::new();
    let mut new_lines = Vec::new();
    for line in &hunk.lines {
        match line {
            PatchLine::Context(s) => {
                old_lines.push(s.clone());
                new_lines.push(s.clone());
            }
            PatchLine::Removal(s) => old_lines.push(s.clone()),
            PatchLine::Addition(s) => new_lines.push(s.clone()),
            PatchLine::NoNewlineMarker => {}
        }
    }
    FuzzyHunk {
        old_lines,
        new_lines,
        description: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_hunk_to_fuzzy_old_new_lines() {
        let hunk = crate::model::PatchHunk {
            old_start: 1,
            old_count: 2,
            new_start: 1,
            new_count: 2,
            lines: vec![
                PatchLine::Context("same".to_string()),
                PatchLine::Removal("old".to_string()),
                PatchLine::Addition("new".to_string()),
            ],
        };
        let fuzzy = to_fuzzy_hunk(&hunk);
        assert_eq!(fuzzy.old_lines, vec!["same", "old"]);
        assert_eq!(fuzzy.new_lines, vec!["same", "new"]);
    }

    #[test]
    fn fuzzy_fallback_applies_simple_patch_to_new_file_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "line1\nline2\nline3\n").unwrap();
        let diff = "--- a/a.txt\n+++ b/a.txt\n@@ -1,3 +1,3 @@\n line1\n-line2\n+LINE2\n line3\n";
        let outcome = apply_fuzzy_fallback(dir.path().to_str().unwrap(), diff).unwrap();
        assert!(outcome.via_fuzzy_fallback);
        let content = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert!(content.contains("LINE2"));
    }

    #[tokio::test]
    async fn envelope_dialect_is_routed_straight_to_fuzzy_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "old_line\n").unwrap();
        let diff = "*** Begin Patch\n*** Update File: a.py\n@@\n-old_line\n+new_line\n*** End Patch\n";

        let sandbox = crate::sandbox::HostSandbox;
        let outcome = apply_patch(&sandbox, dir.path().to_str().unwrap(), diff, false)
            .await
            .unwrap();
        assert!(outcome.via_fuzzy_fallback);
        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert_eq!(content, "new_line\n");
    }

    #[tokio::test]
    async fn envelope_dialect_rejected_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let diff = "*** Begin Patch\n*** Update File: a.py\n@@\n-old\n+new\n*** End Patch\n";
        let sandbox = crate::sandbox::HostSandbox;
        let err = apply_patch(&sandbox, dir.path().to_str().unwrap(), diff, true)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ToolErrorKind::PatchHunkFail));
    }

    #[test]
    fn fuzzy_fallback_creates_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let diff = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+hello\n+world\n";
        let outcome = apply_fuzzy_fallback(dir.path().to_str().unwrap(), diff).unwrap();
        assert!(outcome.files_changed.contains(&"new.txt".to_string()));
        assert!(dir.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn apply_patch_rejects_path_escape_before_touching_the_patch_binary() {
        let dir = tempfile::tempdir().unwrap();
        let diff = "--- a/../../etc/passwd\n+++ b/../../etc/passwd\n@@ -1,1 +1,1 @@\n-root\n+nobody\n";
        let sandbox = crate::sandbox::HostSandbox;
        let err = apply_patch(&sandbox, dir.path().to_str().unwrap(), diff, false)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ToolErrorKind::PatchHunkFail));
    }

    #[tokio::test]
    async fn apply_patch_rejects_a_missing_old_file_before_touching_the_patch_binary() {
        let dir = tempfile::tempdir().unwrap();
        let diff = "--- a/missing.txt\n+++ b/missing.txt\n@@ -1,1 +1,1 @@\n-old\n+new\n";
        let sandbox = crate::sandbox::HostSandbox;
        let err = apply_patch(&sandbox, dir.path().to_str().unwrap(), diff, false)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ToolErrorKind::PatchHunkFail));
        assert!(err.message.contains("does not exist"));
    }

    #[tokio::test]
    async fn a_fuzz_window_miss_falls_through_to_the_fuzzy_fallback_in_non_strict_mode() {
        // The declared `@@ -1,2` header is 10 lines off from where "target"
        // and "    return a - b" actually live, well past FUZZ_WINDOW, so
        // the external `patch` binary is skipped entirely and the content
        // matcher lands it instead.
        let dir = tempfile::tempdir().unwrap();
        let padding = "pad\n".repeat(10);
        std::fs::write(
            dir.path().join("a.py"),
            format!("{padding}def target():\n    return a - b\n"),
        )
        .unwrap();
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,2 +1,2 @@\n def target():\n-    return a - b\n+    return a + b\n";
        let sandbox = crate::sandbox::HostSandbox;
        let outcome = apply_patch(&sandbox, dir.path().to_str().unwrap(), diff, false)
            .await
            .unwrap();
        assert!(outcome.via_fuzzy_fallback);
        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert!(content.contains("return a + b"));
    }

    #[tokio::test]
    async fn a_fuzz_window_miss_is_fatal_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let padding = "pad\n".repeat(10);
        std::fs::write(
            dir.path().join("a.py"),
            format!("{padding}def target():\n    return a - b\n"),
        )
        .unwrap();
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,2 +1,2 @@\n def target():\n-    return a - b\n+    return a + b\n";
        let sandbox = crate::sandbox::HostSandbox;
        let err = apply_patch(&sandbox, dir.path().to_str().unwrap(), diff, true)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ToolErrorKind::PatchHunkFail));
    }
}
