//! Dialect detection and normalization to the canonical unified-diff shape
//! [`super::parse`] understands.
//!
//! `spec.md` §4.3 names three accepted input dialects, tried in priority
//! order: the `*** Begin Patch … *** End Patch` envelope an LLM sometimes
//! emits instead of a raw diff, a context patch with `@@` separators but no
//! numeric hunk coordinates, and the canonical unified diff. Line numbers in
//! both non-canonical dialects are unreliable by construction (the envelope
//! never carries them; a context patch treats `@@` purely as a section
//! break), so both are rewritten here with synthetic `@@ -1,1 +1,1 @@`
//! headers — [`super::apply::apply_patch`]'s fuzzy fallback matches hunks by
//! content, not by declared coordinates, so a synthetic header costs nothing
//! once a file reaches that stage.

use crate::model::{ToolError, ToolErrorKind};

const ENVELOPE_BEGIN: &str = "*** Begin Patch";
const ENVELOPE_END: &str = "*** End Patch";

/// Which of the three `spec.md` §4.3 dialects a piece of diff text appears
/// to be, checked in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchDialect {
    /// `*** Begin Patch` / `*** Update File: …` / `*** End Patch`.
    Envelope,
    /// Has `--- a/…` / `+++ b/…` headers but at least one `@@` hunk marker
    /// with no numeric `-s,c +s,c` coordinates.
    ContextPatch,
    /// Ordinary unified diff with numeric hunk coordinates throughout.
    UnifiedDiff,
}

/// Detects which dialect `text` is, without mutating it.
pub fn detect(text: &str) -> PatchDialect {
    if text.contains(ENVELOPE_BEGIN) {
        return PatchDialect::Envelope;
    }
    if text
        .lines()
        .any(|l| l.starts_with("@@") && parse_numeric_coords(l).is_none())
    {
        return PatchDialect::ContextPatch;
    }
    PatchDialect::UnifiedDiff
}

/// Rewrites `text` into canonical unified-diff shape that [`super::parse`]
/// can read, regardless of dialect. A no-op (modulo the reprefixing every
/// dialect shares) for text that is already a canonical unified diff.
pub fn to_canonical(text: &str, dialect: PatchDialect) -> Result<String, ToolError> {
    match dialect {
        PatchDialect::Envelope => envelope_to_unified(text),
        PatchDialect::ContextPatch => Ok(synthesize_hunk_headers(text)),
        PatchDialect::UnifiedDiff => Ok(text.to_string()),
    }
}

/// Returns `Some((old_start, old_count, new_start, new_count))` if `line` is
/// a hunk header with numeric coordinates on both sides, `None` otherwise
/// (bare `@@`, or `@@ some context hint @@`).
fn parse_numeric_coords(line: &str) -> Option<(i64, i64, i64, i64)> {
    let inner = line.trim_start_matches("@@").split("@@").next()?.trim();
    let mut parts = inner.split_whitespace();
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    let old_start: i64 = old.split(',').next()?.parse().ok()?;
    let new_start: i64 = new.split(',').next()?.parse().ok()?;
    Some((old_start, 0, new_start, 0))
}

/// Replaces every `@@ ...` hunk marker with a synthetic numeric header,
/// leaving everything else — file headers, body lines — untouched.
fn synthesize_hunk_headers(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.starts_with("@@") {
                "@@ -1,1 +1,1 @@".to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

/// One `*** Update/Add/Delete File: path` section of an envelope patch.
struct EnvelopeSection {
    action: EnvelopeAction,
    path: String,
    body: Vec<String>,
}

#[derive(PartialEq, Eq)]
enum EnvelopeAction {
    Update,
    Add,
    Delete,
}

/// Converts a `*** Begin Patch` envelope into a canonical unified diff with
/// synthetic hunk coordinates, one `--- a/… +++ b/…` file pair per section.
fn envelope_to_unified(text: &str) -> Result<String, ToolError> {
    let sections = parse_envelope_sections(text)?;
    if sections.is_empty() {
        return Err(ToolError::new(
            ToolErrorKind::ParseError,
            "envelope patch has no `*** Update/Add/Delete File:` sections",
        ));
    }

    let mut out = String::new();
    for section in sections {
        let (old_path, new_path) = match section.action {
            EnvelopeAction::Update => (format!("a/{}", section.path), format!("b/{}", section.path)),
            EnvelopeAction::Add => ("/dev/null".to_string(), format!("b/{}", section.path)),
            EnvelopeAction::Delete => (format!("a/{}", section.path), "/dev/null".to_string()),
        };
        out.push_str(&format!("--- {old_path}\n+++ {new_path}\n"));
        out.push_str("@@ -1,1 +1,1 @@\n");

        match section.action {
            EnvelopeAction::Add => {
                for line in &section.body {
                    out.push_str(&reprefix(line, '+'));
                    out.push('\n');
                }
            }
            EnvelopeAction::Delete => {
                for line in &section.body {
                    out.push_str(&reprefix(line, '-'));
                    out.push('\n');
                }
            }
            EnvelopeAction::Update => {
                for line in &section.body {
                    if line.starts_with("@@") {
                        continue; // section-break hints carry no line content
                    }
                    out.push_str(&reprefix_context(line));
                    out.push('\n');
                }
            }
        }
    }
    Ok(out)
}

/// Gives an envelope body line the leading `+`/`-`/` ` prefix a unified-diff
/// body line needs, when it doesn't already carry one. Mirrors `spec.md`
/// §4.3 pipeline step 3 ("add a leading space to context lines that are
/// missing a prefix but appear inside a hunk"), generalized to the two
/// sigil prefixes an add/delete section's body is forced into.
fn reprefix(line: &str, sigil: char) -> String {
    if line.starts_with(['+', '-', ' ']) {
        line.to_string()
    } else {
        format!("{sigil}{line}")
    }
}

fn reprefix_context(line: &str) -> String {
    if line.starts_with(['+', '-', ' ']) {
        line.to_string()
    } else {
        format!(" {line}")
    }
}

fn parse_envelope_sections(text: &str) -> Result<Vec<EnvelopeSection>, ToolError> {
    let mut sections = Vec::new();
    let mut current: Option<EnvelopeSection> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim_end();
        if line.starts_with(ENVELOPE_BEGIN) {
            continue;
        }
        if line.starts_with(ENVELOPE_END) {
            break;
        }
        if let Some(path) = line.strip_prefix("*** Update File: ") {
            flush(&mut current, &mut sections);
            current = Some(EnvelopeSection {
                action: EnvelopeAction::Update,
                path: path.trim().to_string(),
                body: Vec::new(),
            });
            continue;
        }
        if let Some(path) = line.strip_prefix("*** Add File: ") {
            flush(&mut current, &mut sections);
            current = Some(EnvelopeSection {
                action: EnvelopeAction::Add,
                path: path.trim().to_string(),
                body: Vec::new(),
            });
            continue;
        }
        if let Some(path) = line.strip_prefix("*** Delete File: ") {
            flush(&mut current, &mut sections);
            current = Some(EnvelopeSection {
                action: EnvelopeAction::Delete,
                path: path.trim().to_string(),
                body: Vec::new(),
            });
            continue;
        }
        if let Some(section) = current.as_mut() {
            section.body.push(line.to_string());
        }
    }
    flush(&mut current, &mut sections);
    Ok(sections)
}

fn flush(current: &mut Option<EnvelopeSection>, sections: &mut Vec<EnvelopeSection>) {
    if let Some(section) = current.take() {
        sections.push(section);
    }
}

/// Strips a Markdown code fence (` ```diff ` / ` ``` `) wrapping the whole
/// text, and drops a stray `:`/`>` quoting prefix some models prepend to
/// every diff line (`spec.md` §4.3 pipeline step 2).
pub fn strip_markdown_wrapping(text: &str) -> String {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```diff")
        .or_else(|| trimmed.strip_prefix("```patch"))
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed);

    unfenced
        .lines()
        .map(|line| {
            line.strip_prefix("> ")
                .or_else(|| line.strip_prefix(':').map(|r| r.trim_start()))
                .unwrap_or(line)
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PatchLine;

    #[test]
    fn detects_envelope_dialect() {
        let text = "*** Begin Patch\n*** Update File: a.py\n@@\n-old\n+new\n*** End Patch\n";
        assert_eq!(detect(text), PatchDialect::Envelope);
    }

    #[test]
    fn detects_context_patch_dialect() {
        let text = "--- a/a.py\n+++ b/a.py\n@@ def foo(): @@\n-old\n+new\n";
        assert_eq!(detect(text), PatchDialect::ContextPatch);
    }

    #[test]
    fn detects_canonical_unified_diff() {
        let text = "--- a/a.py\n+++ b/a.py\n@@ -1,2 +1,2 @@\n-old\n+new\n";
        assert_eq!(detect(text), PatchDialect::UnifiedDiff);
    }

    #[test]
    fn context_patch_gets_synthetic_numeric_header() {
        let text = "--- a/a.py\n+++ b/a.py\n@@ def foo(): @@\n-old\n+new\n";
        let canonical = to_canonical(text, PatchDialect::ContextPatch).unwrap();
        assert!(canonical.contains("@@ -1,1 +1,1 @@"));
        let parsed = super::super::parse(&canonical).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn envelope_update_file_converts_to_unified_diff() {
        let text = "*** Begin Patch\n*** Update File: src/a.py\n@@ def foo():\n-old_line\n+new_line\n*** End Patch\n";
        let canonical = envelope_to_unified(text).unwrap();
        assert!(canonical.contains("--- a/src/a.py"));
        assert!(canonical.contains("+++ b/src/a.py"));

        let parsed = super::super::parse(&canonical).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0]
            .hunks[0]
            .lines
            .iter()
            .any(|l| matches!(l, PatchLine::Removal(s) if s == "old_line")));
        assert!(parsed[0]
            .hunks[0]
            .lines
            .iter()
            .any(|l| matches!(l, PatchLine::Addition(s) if s == "new_line")));
    }

    #[test]
    fn envelope_add_file_creates_new_file_with_dev_null_old_path() {
        let text = "*** Begin Patch\n*** Add File: src/new.py\nimport os\nprint(os.getcwd())\n*** End Patch\n";
        let canonical = envelope_to_unified(text).unwrap();
        let parsed = super::super::parse(&canonical).unwrap();
        assert!(parsed[0].old_path.is_none());
        assert_eq!(parsed[0].new_path.as_deref(), Some("src/new.py"));
    }

    #[test]
    fn envelope_delete_file_has_dev_null_new_path() {
        let text = "*** Begin Patch\n*** Delete File: src/old.py\n*** End Patch\n";
        let canonical = envelope_to_unified(text).unwrap();
        let parsed = super::super::parse(&canonical).unwrap();
        assert!(parsed[0].new_path.is_none());
    }

    #[test]
    fn envelope_with_no_sections_is_a_parse_error() {
        let text = "*** Begin Patch\n*** End Patch\n";
        assert!(envelope_to_unified(text).is_err());
    }

    #[test]
    fn strips_fenced_diff_block() {
        let text = "```diff\n--- a/f\n+++ b/f\n@@ -1 +1 @@\n-x\n+y\n```";
        let stripped = strip_markdown_wrapping(text);
        assert!(!stripped.contains("```"));
        assert!(stripped.starts_with("--- a/f"));
    }

    #[test]
    fn strips_stray_quote_prefixes() {
        let text = "> --- a/f\n> +++ b/f\n> @@ -1 +1 @@\n> -x\n> +y\n";
        let stripped = strip_markdown_wrapping(text);
        assert!(stripped.lines().all(|l| !l.starts_with('>')));
    }
}
