//! Symmetric head/tail truncation of long string fields, recursively applied
//! through arbitrary JSON payloads.
//!
//! Grounded in the event logger's truncation behavior: long strings keep
//! half the configured budget from the front and half from the back, with a
//! marker noting how much was dropped in between.

use serde_json::Value;

/// Truncates `s` to at most `budget` chars, keeping `budget / 2` from the
/// front and the remainder from the back, joined by a marker that states how
/// many characters were elided. No-op if `s` already fits.
pub fn truncate_str(s: &str, budget: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= budget || budget == 0 {
        return s.to_string();
    }

    let head_len = budget / 2;
    let tail_len = budget - head_len;
    let chars: Vec<char> = s.chars().collect();
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[char_count - tail_len..].iter().collect();
    let elided = char_count - head_len - tail_len;

    format!("{head}... [{elided} chars truncated] ...{tail}")
}

/// Describes which line ranges of the original text survived
/// [`truncate_lines`], 1-indexed and inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinesIncluded {
    pub head: (usize, usize),
    pub tail: (usize, usize),
}

/// Keeps the first `max_lines / 2` and last `max_lines - max_lines / 2`
/// lines of `text`, joined by an explicit `... [truncated] ...` marker when
/// the total line count exceeds `max_lines`. Returns the (possibly
/// rewritten) text, whether it was truncated, the original line count, and
/// — only when truncated — the surviving head/tail ranges.
///
/// Grounded in `READ_FILE`'s truncation contract (`spec.md` §4.4): unlike
/// [`truncate_str`]'s char-budget symmetric split, this is line-granular so
/// a truncated file never splits mid-line.
pub fn truncate_lines(text: &str, max_lines: usize) -> (String, bool, usize, Option<LinesIncluded>) {
    let lines: Vec<&str> = text.lines().collect();
    let total = lines.len();

    if max_lines == 0 || total <= max_lines {
        return (text.to_string(), false, total, None);
    }

    let head_len = max_lines / 2;
    let tail_len = max_lines - head_len;
    let head = &lines[..head_len];
    let tail = &lines[total - tail_len..];
    let elided = total - head_len - tail_len;

    let mut out = head.join("\n");
    out.push_str(&format!("\n... [truncated {elided} lines] ...\n"));
    out.push_str(&tail.join("\n"));

    let included = LinesIncluded {
        head: (1, head_len),
        tail: (total - tail_len + 1, total),
    };
    (out, true, total, Some(included))
}

/// Recursively walks a JSON value, truncating every string it finds to
/// `budget` characters. Object keys are left untouched; array and object
/// structure is preserved.
pub fn truncate_json(value: &Value, budget: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_str(s, budget)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| truncate_json(v, budget)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_json(v, budget)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_string_unchanged() {
        assert_eq!(truncate_str("hello", 100), "hello");
    }

    #[test]
    fn long_string_truncated_symmetrically() {
        let s = "a".repeat(50) + &"b".repeat(50);
        let out = truncate_str(&s, 20);
        assert!(out.starts_with(&"a".repeat(10)));
        assert!(out.ends_with(&"b".repeat(10)));
        assert!(out.contains("chars truncated"));
    }

    #[test]
    fn zero_budget_is_noop() {
        assert_eq!(truncate_str("anything", 0), "anything");
    }

    #[test]
    fn json_recurses_into_nested_structures() {
        let long = "x".repeat(200);
        let value = serde_json::json!({
            "stdout": long,
            "nested": { "stderr": long },
            "list": [long.clone(), long.clone()],
        });
        let out = truncate_json(&value, 20);
        assert!(out["stdout"].as_str().unwrap().len() < 200);
        assert!(out["nested"]["stderr"].as_str().unwrap().len() < 200);
        assert!(out["list"][0].as_str().unwrap().len() < 200);
    }

    #[test]
    fn numbers_and_bools_untouched() {
        let value = serde_json::json!({"exit_code": 1, "ok": false});
        let out = truncate_json(&value, 5);
        assert_eq!(out, value);
    }

    #[test]
    fn short_text_is_not_line_truncated() {
        let (out, truncated, total, included) = truncate_lines("a\nb\nc\n", 10);
        assert_eq!(out, "a\nb\nc");
        assert!(!truncated);
        assert_eq!(total, 3);
        assert!(included.is_none());
    }

    #[test]
    fn long_text_keeps_head_and_tail_lines() {
        let text = (1..=100).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        let (out, truncated, total, included) = truncate_lines(&text, 10);
        assert!(truncated);
        assert_eq!(total, 100);
        assert!(out.starts_with("1\n2\n3\n4\n5\n"));
        assert!(out.ends_with("96\n97\n98\n99\n100"));
        assert!(out.contains("truncated 90 lines"));
        let included = included.unwrap();
        assert_eq!(included.head, (1, 5));
        assert_eq!(included.tail, (96, 100));
    }

    #[test]
    fn zero_max_lines_is_noop() {
        let (out, truncated, _, _) = truncate_lines("a\nb\n", 0);
        assert_eq!(out, "a\nb\n");
        assert!(!truncated);
    }
}
