//! Rule mode detection
//!
//! A rule addresses a document as a selector chain, a JSON path, an XPath
//! expression or an embedded script. Explicit tags win; otherwise the
//! leading characters decide, and the document kind is the fallback.

/// How a rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `@`-separated selector chain.
    Default,
    Json,
    XPath,
    Script,
}

/// Tags that force a mode, with the mode they force.
const MODE_TAGS: [(&str, Mode); 9] = [
    ("@XPath:", Mode::XPath),
    ("XPath:", Mode::XPath),
    ("@Json:", Mode::Json),
    ("@JSon:", Mode::Json),
    ("Json:", Mode::Json),
    ("JSon:", Mode::Json),
    ("@css:", Mode::Default),
    ("Css:", Mode::Default),
    ("@@", Mode::Default),
];

fn leading_tag(rule: &str) -> Option<(&'static str, Mode)> {
    MODE_TAGS.iter().copied().find(|(tag, _)| {
        rule.len() >= tag.len()
            && rule.is_char_boundary(tag.len())
            && rule[..tag.len()].eq_ignore_ascii_case(tag)
    })
}

/// True when the rule carries an embedded script segment.
pub fn has_script(rule: &str) -> bool {
    let lower = rule.to_ascii_lowercase();
    lower.contains("@js:") || (lower.contains("<js>") && lower.contains("</js>"))
}

/// Classify `rule`. The precedence is XPath, Json, Script, explicit
/// selector tags, then the document kind.
pub fn detect(rule: &str, document_is_json: bool) -> Mode {
    let rule = rule.trim();
    let tag = leading_tag(rule).map(|(_, mode)| mode);

    if rule.starts_with('/') || tag == Some(Mode::XPath) {
        return Mode::XPath;
    }
    if rule.starts_with('$') || tag == Some(Mode::Json) {
        return Mode::Json;
    }
    if has_script(rule) {
        return Mode::Script;
    }
    if tag == Some(Mode::Default) {
        return Mode::Default;
    }
    if rule.contains("{$.") || document_is_json {
        Mode::Json
    } else {
        Mode::Default
    }
}

/// Whether the rule starts with an explicit selector tag (`@css:`, `@@`),
/// meaning the remainder is a structural selector used verbatim.
pub fn is_css_tagged(rule: &str) -> bool {
    matches!(leading_tag(rule.trim()), Some((tag, _)) if tag.eq_ignore_ascii_case("@css:") || tag.eq_ignore_ascii_case("Css:"))
}

/// Remove a leading mode tag, returning the remainder untouched otherwise.
pub fn strip_prefix_tags(rule: &str) -> &str {
    let trimmed = rule.trim_start();
    match leading_tag(trimmed) {
        Some((tag, _)) => trimmed[tag.len()..].trim_start(),
        None => rule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_precedence() {
        assert_eq!(detect("//div[@class='x']", false), Mode::XPath);
        assert_eq!(detect("@XPath:div", true), Mode::XPath);
        assert_eq!(detect("$.data", false), Mode::Json);
        assert_eq!(detect("@Json:data.name", false), Mode::Json);
        assert_eq!(detect("tag.a@href<js>result</js>", false), Mode::Script);
        assert_eq!(detect("tag.a@text@js:result.trim()", true), Mode::Script);
    }

    #[test]
    fn test_detect_falls_back_on_document_kind() {
        assert_eq!(detect("class.item", false), Mode::Default);
        assert_eq!(detect("data", true), Mode::Json);
        assert_eq!(detect("@css:div.item", true), Mode::Default);
        assert_eq!(detect("@@div", true), Mode::Default);
        assert_eq!(detect("http://x/{$.id}", false), Mode::Json);
    }

    #[test]
    fn test_strip_prefix_tags() {
        assert_eq!(strip_prefix_tags("@css:div > a@href"), "div > a@href");
        assert_eq!(strip_prefix_tags("@json:$.a"), "$.a");
        assert_eq!(strip_prefix_tags("XPath://a"), "//a");
        assert_eq!(strip_prefix_tags("@@tag.a"), "tag.a");
        assert_eq!(strip_prefix_tags("tag.a@text"), "tag.a@text");
    }

    #[test]
    fn test_is_css_tagged() {
        assert!(is_css_tagged("@CSS:div"));
        assert!(!is_css_tagged("@@div"));
        assert!(!is_css_tagged("div"));
    }
}
