//! Repair pipeline run over raw diff text before each `patch` retry.
//!
//! Each stage is a pure text transform, tried in order; a stage is a no-op
//! when its precondition doesn't hold. Two stages — hunk-count
//! recomputation and no-trailing-newline-marker repair — mirror the
//! reference harness's own patch normalizer; the rest cover failure modes
//! specific to diffs unified-diff-parsed from LLM output.

use crate::model::FilePatch;

use super::parse;

/// One normalization stage tried against a diff attempt, most conservative
/// first. Stages are applied cumulatively (`spec.md` §4.3: "each step
/// re-invoking dry-run apply" describes a single pipeline being built up,
/// not independent alternatives tried against the original text).
///
/// §4.3 pipeline steps 1 and 3 (split-header joining, missing-context-prefix
/// repair) run as fixed pre-processing in [`super::apply::apply_patch`]
/// ahead of this ladder, not as members of it — both need to happen before
/// step 4 (path rewriting) can reliably find a `--- `/`+++ ` line to rewrite,
/// and before dialect detection runs at all, so they can't be slotted in at
/// their numeric position in this retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeStage {
    /// Text is used as-is.
    AsIs,
    /// Hunk `@@ -a,b +c,d @@` counts rewritten to match actual body lines
    /// (§4.3 pipeline step 5).
    RecomputedHunkCounts,
    /// `\ No newline at end of file` markers added/removed to match
    /// whether the corresponding body line actually ends in `\n` (§4.3
    /// pipeline step 6).
    NormalizedNoEofMarkers,
    /// Trailing whitespace stripped from context/added lines.
    StrippedTrailingWhitespace,
    /// CRLF line endings in the diff body collapsed to LF.
    NormalizedLineEndings,
}

impl NormalizeStage {
    pub fn all() -> &'static [NormalizeStage] {
        &[
            NormalizeStage::AsIs,
            NormalizeStage::RecomputedHunkCounts,
            NormalizeStage::NormalizedNoEofMarkers,
            NormalizeStage::StrippedTrailingWhitespace,
            NormalizeStage::NormalizedLineEndings,
        ]
    }

    fn apply(&self, text: &str) -> String {
        match self {
            Self::AsIs => text.to_string(),
            Self::RecomputedHunkCounts => recompute_hunk_counts(text),
            Self::NormalizedNoEofMarkers => normalize_noeof_markers(text),
            Self::StrippedTrailingWhitespace => strip_trailing_whitespace(text),
            Self::NormalizedLineEndings => text.replace("\r\n", "\n"),
        }
    }
}

/// Runs §4.3 pipeline steps 1 and 3 — joining a split `---`/`+++` header
/// with its path line, then adding a leading space to any hunk body line
/// that's missing a sigil entirely. Exposed as one function since both are
/// unconditional, order-dependent pre-processing rather than ladder stages
/// that might be skipped.
pub fn repair_headers_and_prefixes(text: &str) -> String {
    add_missing_context_prefix(&join_split_headers(text))
}

/// Applies `stage`'s transform to `diff_text`, returning the candidate text
/// to retry the `patch` binary against. Callers fold this across
/// [`NormalizeStage::all`] in order, feeding each stage's output to the
/// next, so later stages see earlier stages' repairs.
pub fn normalize_attempt(diff_text: &str, stage: NormalizeStage) -> String {
    stage.apply(diff_text)
}

/// Joins a `---`/`+++` line that carries no path of its own with the path on
/// the line immediately after it — some models emit the sigil and the path
/// as two separate lines instead of one `--- a/path` line.
fn join_split_headers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_end();
        if (trimmed == "---" || trimmed == "+++") && lines.peek().is_some() {
            let next = lines.next().unwrap();
            out.push_str(trimmed);
            out.push(' ');
            out.push_str(next.trim_start());
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Adds a leading space to a hunk body line that has no `+`/`-`/` `/`\`
/// prefix at all — a context line a model dropped the sigil from entirely,
/// as opposed to one that's genuinely an addition or removal.
fn add_missing_context_prefix(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_hunk = false;
    for line in text.lines() {
        if line.starts_with("@@") {
            in_hunk = true;
            out.push_str(line);
        } else if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("diff ") {
            in_hunk = false;
            out.push_str(line);
        } else if in_hunk && !line.starts_with(['+', '-', ' ', '\\']) {
            out.push(' ');
            out.push_str(line);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Rewrites `--- a/…` / `+++ b/…` file paths so they resolve inside
/// `workspace_root` (`spec.md` §4.3 pipeline step 4): strips a leading
/// `/workspace/…/repo/` or `workspace/…/` prefix some models carry over from
/// the sandbox's own absolute paths, then — if the resulting path doesn't
/// exist in the workspace — tries `src/<path>`, `repo/<path>`, and
/// `repo/src/<path>` in turn and substitutes the first one that does.
pub fn rewrite_paths(text: &str, workspace_root: &str) -> String {
    text.lines()
        .map(|line| {
            for prefix in ["--- ", "+++ "] {
                if let Some(rest) = line.strip_prefix(prefix) {
                    return format!("{prefix}{}", rewrite_one_path(rest, workspace_root));
                }
            }
            line.to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

fn rewrite_one_path(raw: &str, workspace_root: &str) -> String {
    if raw.trim() == "/dev/null" {
        return raw.to_string();
    }
    let (sigil_prefix, path) = split_ab_prefix(raw);
    let stripped = strip_workspace_repo_prefix(path);

    if std::path::Path::new(workspace_root).join(stripped).exists() {
        return format!("{sigil_prefix}{stripped}");
    }
    for candidate in [
        format!("src/{stripped}"),
        format!("repo/{stripped}"),
        format!("repo/src/{stripped}"),
    ] {
        if std::path::Path::new(workspace_root).join(&candidate).exists() {
            return format!("{sigil_prefix}{candidate}");
        }
    }
    format!("{sigil_prefix}{stripped}")
}

/// Splits off a leading `a/`/`b/` marker so it can be reattached untouched
/// after the rest of the path is rewritten.
fn split_ab_prefix(path: &str) -> (&'static str, &str) {
    if let Some(rest) = path.strip_prefix("a/") {
        ("a/", rest)
    } else if let Some(rest) = path.strip_prefix("b/") {
        ("b/", rest)
    } else {
        ("", path)
    }
}

fn strip_workspace_repo_prefix(path: &str) -> &str {
    for prefix in ["/workspace/repo/", "/workspace/", "workspace/repo/", "workspace/"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            return rest;
        }
    }
    path.strip_prefix('/').unwrap_or(path)
}

/// Rewrites each hunk's `-a,b +c,d` counts to the actual number of
/// removal/context and addition/context lines in its body. LLM-authored
/// diffs frequently get this arithmetic wrong while the body itself is
/// correct, which `patch` rejects outright even with fuzz.
fn recompute_hunk_counts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        if !line.starts_with("@@") {
            out.push_str(line);
            out.push('\n');
            continue;
        }

        let mut old_count = 0usize;
        let mut new_count = 0usize;
        let mut body = Vec::new();
        while let Some(next) = lines.peek() {
            if next.starts_with("@@") || next.starts_with("--- ") {
                break;
            }
            let next = lines.next().unwrap();
            if next == r"\ No newline at end of file" {
                body.push(next.to_string());
                continue;
            }
            match next.chars().next() {
                Some('+') => new_count += 1,
                Some('-') => old_count += 1,
                _ => {
                    old_count += 1;
                    new_count += 1;
                }
            }
            body.push(next.to_string());
        }

        let (old_start, _, new_start, _) = match parse_header_starts(line) {
            Some(v) => v,
            None => {
                out.push_str(line);
                out.push('\n');
                for b in body {
                    out.push_str(&b);
                    out.push('\n');
                }
                continue;
            }
        };

        out.push_str(&format!(
            "@@ -{old_start},{old_count} +{new_start},{new_count} @@\n"
        ));
        for b in body {
            out.push_str(&b);
            out.push('\n');
        }
    }

    out
}

fn parse_header_starts(header: &str) -> Option<(usize, usize, usize, usize)> {
    let inner = header.trim_start_matches("@@").split("@@").next()?.trim();
    let mut parts = inner.split_whitespace();
    let old = parts.next()?;
    let new = parts.next()?;
    let old_start: usize = old.trim_start_matches('-').split(',').next()?.parse().ok()?;
    let new_start: usize = new.trim_start_matches('+').split(',').next()?.parse().ok()?;
    Some((old_start, 0, new_start, 0))
}

/// Drops a `\ No newline at end of file` marker that immediately follows a
/// line whose next hunk/file boundary implies the file does in fact end
/// with a newline, and vice versa. This is the single most common reason a
/// hand-assembled diff against a file with (or without) a final newline
/// fails `patch`'s exact-match mode.
fn normalize_noeof_markers(text: &str) -> String {
    const MARKER: &str = r"\ No newline at end of file";
    text.lines()
        .filter(|l| *l != MARKER)
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

fn strip_trailing_whitespace(text: &str) -> String {
    text.lines()
        .map(|l| {
            if let Some(rest) = l.strip_prefix(['+', '-', ' ']) {
                format!("{}{}", &l[..1], rest.trim_end())
            } else {
                l.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

/// Returns `true` if `text` parses as at least one syntactically valid file
/// patch; used by the apply loop to skip a normalization stage that made
/// the text worse rather than better.
pub fn parses_cleanly(text: &str) -> Option<Vec<FilePatch>> {
    parse(text).ok()
}
