//! Unified-diff parsing, normalization, and application.
//!
//! `parse` turns raw diff text into the typed [`FilePatch`]/[`PatchHunk`]
//! model; `normalize` runs the retry pipeline that repairs the common ways
//! an LLM-authored diff is slightly wrong; `apply` drives the external
//! `patch` binary (and, outside strict mode, the fuzzy matcher) to land the
//! result on disk.

mod apply;
pub mod dialects;
mod normalize;

pub use apply::{apply_patch, ApplyOutcome};
pub use dialects::{detect as detect_dialect, strip_markdown_wrapping, to_canonical, PatchDialect};
pub use normalize::{normalize_attempt, NormalizeStage};

use crate::model::{FilePatch, PatchHunk, PatchLine, ToolError, ToolErrorKind};

/// Parses unified-diff text into per-file patches.
///
/// Accepts the conventional `--- a/path` / `+++ b/path` header pair per
/// file, `/dev/null` for creates and deletes, and any number of `@@ ... @@`
/// hunks per file.
pub fn parse(diff_text: &str) -> Result<Vec<FilePatch>, ToolError> {
    let mut files = Vec::new();
    let mut lines = diff_text.lines().peekable();

    while let Some(line) = lines.peek() {
        if line.starts_with("--- ") {
            files.push(parse_one_file(&mut lines)?);
        } else {
            lines.next();
        }
    }

    if files.is_empty() {
        return Err(ToolError::new(
            ToolErrorKind::ParseError,
            "no file headers found in patch text",
        ));
    }
    Ok(files)
}

fn parse_one_file<'a, I>(lines: &mut std::iter::Peekable<I>) -> Result<FilePatch, ToolError>
where
    I: Iterator<Item = &'a str>,
{
    let old_header = lines
        .next()
        .ok_or_else(|| ToolError::new(ToolErrorKind::ParseError, "truncated patch header"))?;
    let new_header = lines
        .next()
        .ok_or_else(|| ToolError::new(ToolErrorKind::ParseError, "missing +++ header"))?;

    let old_path = strip_header(old_header, "--- ");
    let new_path = strip_header(new_header, "+++ ");

    let mut hunks = Vec::new();
    while let Some(line) = lines.peek() {
        if line.starts_with("@@") {
            hunks.push(parse_hunk(lines)?);
        } else if line.starts_with("--- ") {
            break;
        } else {
            lines.next();
        }
    }

    if hunks.is_empty() {
        return Err(ToolError::new(
            ToolErrorKind::ParseError,
            format!("patch for `{old_path:?}` has no hunks"),
        ));
    }

    Ok(FilePatch {
        old_path,
        new_path,
        hunks,
    })
}

fn strip_header(header: &str, prefix: &str) -> Option<String> {
    let rest = header.strip_prefix(prefix)?.trim();
    let path = rest.split('\t').next().unwrap_or(rest);
    if path == crate::model::DEV_NULL {
        return None;
    }
    Some(
        path.strip_prefix("a/")
            .or_else(|| path.strip_prefix("b/"))
            .unwrap_or(path)
            .to_string(),
    )
}

fn parse_hunk<'a, I>(lines: &mut std::iter::Peekable<I>) -> Result<PatchHunk, ToolError>
where
    I: Iterator<Item = &'a str>,
{
    let header = lines
        .next()
        .ok_or_else(|| ToolError::new(ToolErrorKind::ParseError, "missing hunk header"))?;
    let (old_start, old_count, new_start, new_count) = parse_hunk_header(header)?;

    let mut body = Vec::new();
    while let Some(line) = lines.peek() {
        if line.starts_with("@@") || line.starts_with("--- ") {
            break;
        }
        let line = lines.next().unwrap();
        if line == r"\ No newline at end of file" {
            body.push(PatchLine::NoNewlineMarker);
            continue;
        }
        if let Some(rest) = line.strip_prefix('+') {
            body.push(PatchLine::Addition(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            body.push(PatchLine::Removal(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            body.push(PatchLine::Context(rest.to_string()));
        } else if line.is_empty() {
            body.push(PatchLine::Context(String::new()));
        }
    }

    Ok(PatchHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: body,
    })
}

/// Parses a `@@ -old_start,old_count +new_start,new_count @@` header. A
/// missing count defaults to 1, matching diff's own convention for
/// single-line ranges.
fn parse_hunk_header(header: &str) -> Result<(usize, usize, usize, usize), ToolError> {
    let inner = header
        .trim_start_matches("@@")
        .split("@@")
        .next()
        .unwrap_or("")
        .trim();

    let mut parts = inner.split_whitespace();
    let old = parts
        .next()
        .ok_or_else(|| ToolError::new(ToolErrorKind::ParseError, "malformed hunk header"))?;
    let new = parts
        .next()
        .ok_or_else(|| ToolError::new(ToolErrorKind::ParseError, "malformed hunk header"))?;

    let (old_start, old_count) = parse_range(old, '-')?;
    let (new_start, new_count) = parse_range(new, '+')?;
    Ok((old_start, old_count, new_start, new_count))
}

fn parse_range(token: &str, sigil: char) -> Result<(usize, usize), ToolError> {
    let token = token
        .strip_prefix(sigil)
        .ok_or_else(|| ToolError::new(ToolErrorKind::ParseError, format!("expected `{sigil}` prefix in `{token}`")))?;
    let mut split = token.splitn(2, ',');
    let start: usize = split
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ToolError::new(ToolErrorKind::ParseError, format!("bad range `{token}`")))?;
    let count: usize = match split.next() {
        Some(c) => c
            .parse()
            .map_err(|_| ToolError::new(ToolErrorKind::ParseError, format!("bad count in `{token}`")))?,
        None => 1,
    };
    Ok((start, count))
}
