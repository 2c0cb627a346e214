//! Delimiter-aware rule splitting
//!
//! Rules are split on operators (`&&`, `||`, `%%`, `@`) only at the top
//! level: never inside a quoted literal and never inside `()`, `[]` or `{}`
//! nesting. A backslash escapes the following character so regex fragments
//! such as `\(` do not disturb the bracket depth.

/// Composite operator joining several sub-rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Composite {
    /// `&&`: evaluate all, concatenate non-empty results.
    All,
    /// `||`: first non-empty result wins.
    Any,
    /// `%%`: round-robin interleave of list results.
    Interleave,
}

impl Composite {
    pub fn token(self) -> &'static str {
        match self {
            Composite::All => "&&",
            Composite::Any => "||",
            Composite::Interleave => "%%",
        }
    }

    /// Combine the list results of the sub-rules.
    pub fn combine<T>(self, lists: impl Iterator<Item = Vec<T>>) -> Vec<T> {
        match self {
            Composite::All => lists.flatten().collect(),
            Composite::Any => lists.into_iter().find(|l| !l.is_empty()).unwrap_or_default(),
            Composite::Interleave => interleave(lists.collect()),
        }
    }
}

const COMPOSITE_TOKENS: [&str; 3] = ["&&", "||", "%%"];

/// Byte offsets of top-level separator matches, with the index of the
/// separator that matched.
fn top_level_matches(text: &str, separators: &[&str]) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut escaped = false;

    let mut iter = text.char_indices().peekable();
    while let Some((pos, ch)) = iter.next() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                continue;
            }
            '"' | '\'' => {
                match quote {
                    None => quote = Some(ch),
                    Some(q) if q == ch => quote = None,
                    Some(_) => {}
                }
                continue;
            }
            _ if quote.is_some() => continue,
            '(' | '[' | '{' => {
                depth += 1;
                continue;
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                continue;
            }
            _ => {}
        }

        if depth != 0 {
            continue;
        }
        if let Some(idx) = separators
            .iter()
            .position(|sep| !sep.is_empty() && text[pos..].starts_with(sep))
        {
            found.push((pos, idx));
            // Skip the rest of the separator so `&&&` is not matched twice.
            let end = pos + separators[idx].len();
            while iter.peek().is_some_and(|(p, _)| *p < end) {
                iter.next();
            }
        }
    }
    found
}

/// Split `text` on any of `separators`, honouring quotes and nesting.
///
/// Returns the non-empty trimmed segments. When no top-level separator is
/// present the whole (trimmed) string comes back as a single element.
pub fn split<'a>(text: &'a str, separators: &[&str]) -> Vec<&'a str> {
    let matches = top_level_matches(text, separators);
    if matches.is_empty() {
        return vec![text.trim()];
    }

    let mut parts = Vec::with_capacity(matches.len() + 1);
    let mut start = 0;
    for (pos, idx) in matches {
        parts.push(&text[start..pos]);
        start = pos + separators[idx].len();
    }
    parts.push(&text[start..]);

    parts
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Detect a composite rule. The first top-level operator found decides
/// which operator the rule is split on; `None` means "not composite".
pub fn split_composite(rule: &str) -> Option<(Composite, Vec<&str>)> {
    let (_, first) = *top_level_matches(rule, &COMPOSITE_TOKENS).first()?;
    let op = match first {
        0 => Composite::All,
        1 => Composite::Any,
        _ => Composite::Interleave,
    };
    let parts = split(rule, &[op.token()]);
    if parts.len() < 2 {
        // `a&&` or `&&a` still selects the operator but only one operand
        // survives; treat it as a plain rule.
        return None;
    }
    Some((op, parts))
}

/// Replace every balanced `open … close` span using `transform`.
///
/// Nested occurrences of `open` deepen the span, so only the outermost
/// span is handed to `transform`; resolving inner spans is up to the
/// transform itself. When `transform` returns `None` the span is kept as
/// literal text and scanning resumes after it.
///
/// Returns `None` when the text holds no complete span at all, so callers
/// can tell "no templates" apart from "templates resolved to empty".
pub fn balanced_span<F>(text: &str, open: &str, close: &str, mut transform: F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    if open.is_empty() || close.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut found = false;

    while let Some(rel) = text[copied..].find(open) {
        let start = copied + rel;
        let Some(end) = matching_close(text, start + open.len(), open, close) else {
            break;
        };
        found = true;

        out.push_str(&text[copied..start]);
        let inner = &text[start + open.len()..end];
        match transform(inner) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(&text[start..end + close.len()]),
        }
        copied = end + close.len();
    }

    if !found {
        return None;
    }
    out.push_str(&text[copied..]);
    Some(out)
}

/// Deepest nesting of `open … close` spans anywhere in `text`.
pub fn span_depth(text: &str, open: &str, close: &str) -> usize {
    if open.is_empty() || close.is_empty() {
        return 0;
    }
    let mut depth = 0usize;
    let mut deepest = 0;
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        if rest.starts_with(close) {
            depth = depth.saturating_sub(1);
            i += close.len();
        } else if rest.starts_with(open) {
            depth += 1;
            deepest = deepest.max(depth);
            i += open.len();
        } else {
            i += rest.chars().next().map_or(1, char::len_utf8);
        }
    }
    deepest
}

/// Offset of the `close` that balances an `open` whose body starts at `from`.
fn matching_close(text: &str, from: usize, open: &str, close: &str) -> Option<usize> {
    let mut depth = 1usize;
    let mut i = from;
    while i < text.len() {
        let rest = &text[i..];
        if rest.starts_with(close) {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
            i += close.len();
        } else if rest.starts_with(open) {
            depth += 1;
            i += open.len();
        } else {
            i += rest.chars().next().map_or(1, char::len_utf8);
        }
    }
    None
}

/// Round-robin merge: first item of every list, then every second item, ...
pub fn interleave<T>(lists: Vec<Vec<T>>) -> Vec<T> {
    let total = lists.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        for it in iters.iter_mut() {
            if let Some(item) = it.next() {
                out.push(item);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ignores_nested_operators() {
        assert_eq!(split("a(b&&c)&&d", &["&&"]), vec!["a(b&&c)", "d"]);
        assert_eq!(split("[x||y]||z", &["||"]), vec!["[x||y]", "z"]);
        assert_eq!(split("{a&&b}", &["&&"]), vec!["{a&&b}"]);
    }

    #[test]
    fn test_split_ignores_quoted_operators() {
        assert_eq!(
            split(r#"a[title="x&&y"]&&b"#, &["&&"]),
            vec![r#"a[title="x&&y"]"#, "b"]
        );
        // A double quote inside single quotes does not open a new literal.
        assert_eq!(split(r#"'say "hi'&&b"#, &["&&"]), vec![r#"'say "hi'"#, "b"]);
    }

    #[test]
    fn test_split_escaped_brackets() {
        assert_eq!(split(r"a\(&&b", &["&&"]), vec![r"a\(", "b"]);
    }

    #[test]
    fn test_split_without_separator_returns_whole() {
        assert_eq!(split("  class.item  ", &["@"]), vec!["class.item"]);
    }

    #[test]
    fn test_split_drops_empty_segments() {
        assert_eq!(split("a@@b@", &["@"]), vec!["a", "b"]);
        assert_eq!(split("a && b", &["&&"]), vec!["a", "b"]);
    }

    #[test]
    fn test_split_composite_first_operator_wins() {
        let (op, parts) = split_composite("$.a||$.b&&$.c").unwrap();
        assert_eq!(op, Composite::Any);
        assert_eq!(parts, vec!["$.a", "$.b&&$.c"]);

        assert!(split_composite("$.a").is_none());
        assert!(split_composite("tag.a(x%%y)").is_none());
    }

    #[test]
    fn test_balanced_span_nested_innermost_first() {
        let mut seen = Vec::new();
        let out = balanced_span("{$.{$.x}}", "{$.", "}", |inner| {
            seen.push(inner.to_string());
            // resolve nested spans before this one, as a path evaluator would
            let resolved = balanced_span(inner, "{$.", "}", |i| Some(format!("<{i}>")))
                .unwrap_or_else(|| inner.to_string());
            Some(format!("[{resolved}]"))
        });
        assert_eq!(out.as_deref(), Some("[<x>]"));
        assert_eq!(seen, vec!["{$.x}"]);
    }

    #[test]
    fn test_balanced_span_no_spans() {
        assert_eq!(balanced_span("plain", "{{", "}}", |_| Some(String::new())), None);
        assert_eq!(balanced_span("{{open", "{{", "}}", |_| Some(String::new())), None);
    }

    #[test]
    fn test_balanced_span_empty_replacement_is_not_none() {
        assert_eq!(
            balanced_span("{{x}}", "{{", "}}", |_| Some(String::new())).as_deref(),
            Some("")
        );
    }

    #[test]
    fn test_balanced_span_unresolved_left_literal() {
        let out = balanced_span("a{{x}}b{{y}}c", "{{", "}}", |inner| {
            (inner == "y").then(|| "Y".to_string())
        });
        assert_eq!(out.as_deref(), Some("a{{x}}bYc"));
    }

    #[test]
    fn test_span_depth() {
        assert_eq!(span_depth("plain", "{{", "}}"), 0);
        assert_eq!(span_depth("{{a}}{{b}}", "{{", "}}"), 1);
        assert_eq!(span_depth("x{$.a{$.b{$.c}}}/{$.d}", "{$.", "}"), 3);
        assert_eq!(span_depth("}}}}{{a", "{{", "}}"), 1);
    }

    #[test]
    fn test_interleave() {
        let merged = interleave(vec![vec![1, 2, 3], vec![10], vec![20, 21]]);
        assert_eq!(merged, vec![1, 10, 20, 2, 21, 3]);
        assert!(interleave::<i32>(vec![]).is_empty());
    }
}
