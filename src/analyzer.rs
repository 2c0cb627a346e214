//! Rule orchestration
//!
//! [`RuleAnalyzer`] is the entry point for evaluating one rule against a
//! node. It splits off embedded scripts, substitutes `{{…}}` templates,
//! runs `@put`/`@get` directives against the record's [`Session`],
//! dispatches to the evaluator for the rule's mode and applies the
//! optional `##pattern##replacement` suffix.
//!
//! Nothing here returns an error: a rule that cannot be evaluated yields
//! an empty result, and a failing script yields its base result.

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::config::AnalyzerOptions;
use crate::document::{Document, JsonNode, Node};
use crate::error::compile_regex;
use crate::extractors::{
    format_value, js_replacement, parse_js_value, run_script, segments, xpath_extractor, JsValue,
    JsonPath, Segment, SelectorChain,
};
use crate::mode::{detect, has_script, strip_prefix_tags, Mode};
use crate::session::Session;
use crate::splitter::{balanced_span, span_depth, split};

/// Markers that make a `{{…}}` body a nested rule rather than a script.
const RULE_MARKERS: [&str; 5] = ["tag.", "class.", "id.", "text.", "children"];

/// Deepest `{{…}}` nesting resolved; deeper spans stay literal.
const MAX_TEMPLATE_DEPTH: usize = 64;

/// Evaluates rules with a fixed set of options.
#[derive(Debug, Clone, Default)]
pub struct RuleAnalyzer {
    options: AnalyzerOptions,
}

impl RuleAnalyzer {
    pub fn new(options: AnalyzerOptions) -> Self {
        Self { options }
    }

    /// Evaluate `rule` against `node` to a string.
    pub fn get_string(&self, session: &mut Session, node: &Node<'_>, rule: &str) -> String {
        if has_script(rule) {
            return self.eval_segments(session, node, rule).to_output();
        }
        self.eval_rule(session, node, rule)
    }

    /// Evaluate `rule` against `node` to a node list.
    ///
    /// A leading `-` reverses the list and a leading `+` is ignored. Script
    /// results become JSON nodes: one per array item, or a single node.
    pub fn get_elements<'a>(
        &self,
        session: &mut Session,
        node: &Node<'a>,
        rule: &str,
    ) -> Vec<Node<'a>> {
        let rule = rule.trim();
        let (reverse, rule) = match rule.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, rule.strip_prefix('+').unwrap_or(rule)),
        };

        let mut nodes = if has_script(rule) {
            script_nodes(self.eval_segments(session, node, rule))
        } else {
            let mode = detect(rule, node.is_json());
            trace!("list rule `{}` dispatched as {:?}", rule, mode);
            match mode {
                Mode::Json => match node.json() {
                    Some(value) => JsonPath::new(&value)
                        .get_list(strip_prefix_tags(rule))
                        .into_iter()
                        .enumerate()
                        .map(|(index, v)| Node::Json(JsonNode::new(v, index)))
                        .collect(),
                    None => Vec::new(),
                },
                Mode::XPath => xpath_extractor::get_elements(node, rule),
                Mode::Default | Mode::Script => {
                    SelectorChain::new(&self.options).get_elements(node, rule)
                }
            }
        };

        if reverse {
            nodes.reverse();
        }
        nodes
    }

    /// Run the rule and script segments of `rule` in order, each feeding
    /// the next.
    fn eval_segments(&self, session: &mut Session, node: &Node<'_>, rule: &str) -> JsValue {
        let mut current: Option<JsValue> = None;

        for segment in segments(rule) {
            match segment {
                Segment::Rule(text) => {
                    let value = match &current {
                        None => self.eval_rule(session, node, text),
                        Some(previous) => {
                            let document = Document::parse(&previous.to_output());
                            self.eval_rule(session, &document.root(), text)
                        }
                    };
                    current = Some(JsValue::Str(value));
                }
                Segment::Script(source) => {
                    let base = current
                        .take()
                        .unwrap_or_else(|| JsValue::Str(node.outer_html()));
                    if !self.options.scripts {
                        current = Some(base);
                        continue;
                    }
                    let outcome = run_script(
                        source,
                        base.clone(),
                        self.options.base_url.as_deref(),
                        session,
                        self.options.script_step_limit,
                    );
                    current = Some(match outcome {
                        Ok(value) => value,
                        Err(e) => {
                            warn!("script failed, keeping base result: {}", e);
                            base
                        }
                    });
                }
            }
        }

        current.unwrap_or_default()
    }

    /// Evaluate a rule without script segments.
    fn eval_rule(&self, session: &mut Session, node: &Node<'_>, rule: &str) -> String {
        let rule = rule.trim();
        if rule.is_empty() {
            return String::new();
        }

        match self.substitute_templates(session, node, rule) {
            Some(substituted) if addresses_document(rule) => {
                self.eval_directives(session, node, &substituted)
            }
            Some(substituted) => {
                let (text, suffix) = RegexSuffix::split(&substituted);
                suffix.apply(text.trim().to_string())
            }
            None => self.eval_directives(session, node, rule),
        }
    }

    /// Run `@put`/`@get`, then dispatch the main rule by mode and apply
    /// the `##` suffix.
    fn eval_directives(&self, session: &mut Session, node: &Node<'_>, rule: &str) -> String {
        let rule = self.apply_puts(session, node, rule);
        let rule = substitute_gets(session, &rule);
        let (main, suffix) = RegexSuffix::split(&rule);
        let main = main.trim();
        if main.is_empty() {
            return String::new();
        }

        let mode = detect(main, node.is_json());
        trace!("rule `{}` dispatched as {:?}", main, mode);
        let value = match mode {
            Mode::Json => match node.json() {
                Some(value) => JsonPath::new(&value).get_string(strip_prefix_tags(main)),
                None => String::new(),
            },
            Mode::XPath => xpath_extractor::get_string(node, main),
            Mode::Default | Mode::Script => {
                SelectorChain::new(&self.options).get_string(node, main)
            }
        };

        suffix.apply(value)
    }

    /// Replace `{{…}}` spans. `None` when the rule has none.
    fn substitute_templates(
        &self,
        session: &mut Session,
        node: &Node<'_>,
        rule: &str,
    ) -> Option<String> {
        balanced_span(rule, "{{", "}}", |inner| {
            self.resolve_template(session, node, inner)
        })
    }

    /// A template body is a session key, a nested rule, or a script.
    fn resolve_template(
        &self,
        session: &mut Session,
        node: &Node<'_>,
        inner: &str,
    ) -> Option<String> {
        let inner = inner.trim();
        if span_depth(inner, "{{", "}}") >= MAX_TEMPLATE_DEPTH {
            debug!("template nested deeper than {} left as is", MAX_TEMPLATE_DEPTH);
            return None;
        }
        if let Some(value) = session.get(inner) {
            return Some(value.to_string());
        }

        if looks_like_rule(inner) {
            return Some(self.get_string(session, node, inner));
        }

        if !self.options.scripts {
            return None;
        }
        match run_script(
            inner,
            JsValue::Str(node.outer_html()),
            self.options.base_url.as_deref(),
            session,
            self.options.script_step_limit,
        ) {
            Ok(value) => Some(value.to_output()),
            Err(e) => {
                debug!("template `{}` left as is: {}", inner, e);
                None
            }
        }
    }

    /// Run and erase every `@put:{key: rule, …}` directive.
    fn apply_puts(&self, session: &mut Session, node: &Node<'_>, rule: &str) -> String {
        let mut rule = rule.to_string();
        let mut from = 0;

        while let Some(rel) = rule[from..].find("@put:{") {
            let start = from + rel;
            let body_start = start + "@put:".len();
            let Some(end) = matching_brace(&rule[body_start..]).map(|e| body_start + e) else {
                break;
            };

            for (key, value_rule) in parse_put_body(&rule[body_start..=end]) {
                let value = self.get_string(session, node, &value_rule);
                debug!("put `{}` = `{}`", key, value);
                session.put(key, value);
            }
            rule.replace_range(start..=end, "");
            from = start;
        }
        rule
    }
}

/// Replace `@get:{key}` with the session value, empty when unset.
fn substitute_gets(session: &Session, rule: &str) -> String {
    balanced_span(rule, "@get:{", "}", |key| {
        Some(session.get(key.trim()).unwrap_or_default().to_string())
    })
    .unwrap_or_else(|| rule.to_string())
}

fn looks_like_rule(text: &str) -> bool {
    text.starts_with(['@', '$', '/']) || RULE_MARKERS.iter().any(|m| text.contains(m))
}

/// Whether the text of a templated rule outside its `{{…}}` spans still
/// selects from the document. Plain text such as a URL pattern does not,
/// so its substitution is the result.
fn addresses_document(rule: &str) -> bool {
    let outside = balanced_span(rule, "{{", "}}", |_| Some(String::new()))
        .unwrap_or_else(|| rule.to_string());
    let (main, _) = RegexSuffix::split(&outside);
    let main = main.trim();
    if main.is_empty() {
        return false;
    }

    let steps = split(main, &["@"]);
    has_script(main)
        || main.starts_with(['@', '$'])
        || main.starts_with("//")
        || (steps.len() > 1 && !main.contains("://"))
        || steps
            .iter()
            .any(|step| RULE_MARKERS.iter().any(|m| step.starts_with(m)))
}

/// Offset of the `}` closing the `{` that starts `text`, skipping quoted
/// text.
fn matching_brace(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Key/rule pairs of a `{key: rule, …}` body, in source order.
fn parse_put_body(body: &str) -> Vec<(String, String)> {
    if let Ok(Value::Object(map)) = parse_js_value(body) {
        return map
            .iter()
            .map(|(k, v)| (k.clone(), format_value(v)))
            .collect();
    }

    let inner = body
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}');
    split(inner, &[","])
        .into_iter()
        .filter_map(|pair| pair.split_once(':'))
        .map(|(k, v)| (unquote(k), unquote(v)))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn unquote(text: &str) -> String {
    text.trim().trim_matches(['"', '\'']).to_string()
}

/// The `##pattern##replacement` tail of a rule. A fourth `##` part
/// restricts the replacement to the first match.
#[derive(Debug, Default)]
struct RegexSuffix<'r> {
    pattern: &'r str,
    replacement: &'r str,
    single: bool,
}

impl<'r> RegexSuffix<'r> {
    fn split(rule: &'r str) -> (&'r str, Self) {
        let mut parts = rule.split("##");
        let main = parts.next().unwrap_or_default();
        let suffix = Self {
            pattern: parts.next().unwrap_or_default(),
            replacement: parts.next().unwrap_or_default(),
            single: parts.next().is_some(),
        };
        (main, suffix)
    }

    /// An invalid pattern empties the result.
    fn apply(&self, value: String) -> String {
        if value.is_empty() || self.pattern.is_empty() {
            return value;
        }
        match compile_regex(self.pattern) {
            Ok(re) => {
                let replacement = js_replacement(self.replacement);
                if self.single {
                    re.replace(&value, replacement.as_str()).into_owned()
                } else {
                    re.replace_all(&value, replacement.as_str()).into_owned()
                }
            }
            Err(e) => {
                debug!("{}", e);
                String::new()
            }
        }
    }
}

/// Nodes made from a script's list result.
fn script_nodes<'a>(value: JsValue) -> Vec<Node<'a>> {
    let json = match value {
        JsValue::Str(text) => match serde_json::from_str::<Value>(text.trim()) {
            Ok(parsed @ (Value::Array(_) | Value::Object(_))) => parsed,
            _ if text.trim().is_empty() => return Vec::new(),
            _ => Value::String(text),
        },
        other => match other.to_json() {
            Some(json) => json,
            None => return Vec::new(),
        },
    };

    match json {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, v)| Node::Json(JsonNode::new(v, index)))
            .collect(),
        Value::Null => Vec::new(),
        other => vec![Node::Json(JsonNode::new(other, 0))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAGE: &str = r#"
        <html><body>
          <h1>foobaz foo</h1>
          <div class="book" data-id="42">
            <a class="name" href="/b/42">Dune</a>
            <span class="author">Frank Herbert</span>
          </div>
        </body></html>
    "#;

    fn eval(doc: &Document, rule: &str) -> String {
        let mut session = Session::new();
        RuleAnalyzer::default().get_string(&mut session, &doc.root(), rule)
    }

    #[test]
    fn test_regex_suffix() {
        let doc = Document::html(PAGE);
        assert_eq!(eval(&doc, "h1@text##foo##bar"), "barbaz bar");
        assert_eq!(eval(&doc, "h1@text##foo##bar###"), "barbaz foo");
        assert_eq!(eval(&doc, "h1@text##(\\w+)baz##$1"), "foo foo");
        assert_eq!(eval(&doc, "h1@text##o+"), "fbaz f");
        // invalid pattern empties the result
        assert_eq!(eval(&doc, "h1@text##(##x"), "");
        // nothing matched, nothing to replace
        assert_eq!(eval(&doc, "h2@text##a##b"), "");
    }

    #[test]
    fn test_mode_dispatch() {
        let doc = Document::html(PAGE);
        assert_eq!(eval(&doc, "class.name@text"), "Dune");
        assert_eq!(eval(&doc, "//span[@class='author']/text()"), "Frank Herbert");
        assert_eq!(eval(&doc, "@css:div.book > a@href"), "/b/42");

        let doc = Document::json(json!({"a": {"b": 5}, "x": {"y": {"z": 3}}}));
        assert_eq!(eval(&doc, "$.a.b"), "5");
        assert_eq!(eval(&doc, ".z"), "3");
    }

    #[test]
    fn test_script_segments() {
        let doc = Document::html(PAGE);
        assert_eq!(eval(&doc, "class.name@text@js:result.toUpperCase()"), "DUNE");
        assert_eq!(eval(&doc, "class.name@text<js>result + '!'</js>"), "Dune!");
        // a rule after a script runs on the script output
        let rule = r#"class.name@text<js>JSON.stringify({t: result})</js>$.t"#;
        assert_eq!(eval(&doc, rule), "Dune");
    }

    #[test]
    fn test_script_failure_keeps_base() {
        let doc = Document::html(PAGE);
        assert_eq!(eval(&doc, "class.name@text@js:throw 'nope'"), "Dune");
        assert_eq!(eval(&doc, "class.name@text@js:while (true) {}"), "Dune");
        assert_eq!(eval(&doc, "class.name@text@js:)("), "Dune");
        let doubling = "class.name@text@js:var s = 'x'; for (var i = 0; i < 26; i++) { s = s + s; } s.length";
        assert_eq!(eval(&doc, doubling), "Dune");
        let nested = format!("class.name@text@js:{}1{}", "(".repeat(20_000), ")".repeat(20_000));
        assert_eq!(eval(&doc, &nested), "Dune");
    }

    #[test]
    fn test_scripts_disabled() {
        let doc = Document::html(PAGE);
        let analyzer = RuleAnalyzer::new(AnalyzerOptions {
            scripts: false,
            ..Default::default()
        });
        let mut session = Session::new();
        let value = analyzer.get_string(&mut session, &doc.root(), "class.name@text@js:'x'");
        assert_eq!(value, "Dune");
    }

    #[test]
    fn test_put_and_get() {
        let doc = Document::html(PAGE);
        let analyzer = RuleAnalyzer::default();
        let root = doc.root();
        let mut session = Session::new();

        let value = analyzer.get_string(
            &mut session,
            &root,
            "@put:{bid: \"class.book@data-id\"}class.name@text",
        );
        assert_eq!(value, "Dune");
        assert_eq!(session.get("bid"), Some("42"));

        let url = analyzer.get_string(&mut session, &root, "{{bid}}");
        assert_eq!(url, "42");
        let text = analyzer.get_string(&mut session, &root, "class.author@text##Frank##@get:{bid}");
        assert_eq!(text, "42 Herbert");
        let script = analyzer.get_string(&mut session, &root, "@js:'id=' + context.get('bid')");
        assert_eq!(script, "id=42");
    }

    #[test]
    fn test_templates() {
        let doc = Document::json(json!({"id": 7, "slug": "dune"}));
        assert_eq!(eval(&doc, "https://x.test/{{$.id}}/{{$.slug}}"), "https://x.test/7/dune");
        assert_eq!(eval(&doc, "page-{{1 + 1}}"), "page-2");
        // unresolvable span is kept literally
        assert_eq!(eval(&doc, "a{{)(}}b"), "a{{)(}}b");
    }

    #[test]
    fn test_templated_selectors_are_evaluated() {
        let doc = Document::html(PAGE);
        let analyzer = RuleAnalyzer::default();
        let root = doc.root();
        let mut session = Session::new();
        session.put("cls", "name");
        session.put("tag", "span");

        assert_eq!(analyzer.get_string(&mut session, &root, "class.{{cls}}@text"), "Dune");
        assert_eq!(analyzer.get_string(&mut session, &root, "class.book@{{tag}}@text"), "Frank Herbert");
        assert_eq!(analyzer.get_string(&mut session, &root, "class.{{cls}}@href##\\d+##n"), "/b/n");
        assert_eq!(analyzer.get_string(&mut session, &root, "//a[@class='{{cls}}']/text()"), "Dune");
        // plain text around a template is still the result
        assert_eq!(analyzer.get_string(&mut session, &root, "/books/{{cls}}.html"), "/books/name.html");
        assert_eq!(analyzer.get_string(&mut session, &root, "https://x.test/{{cls}}@2x"), "https://x.test/name@2x");

        assert!(addresses_document("tag.{{t}}"));
        assert!(addresses_document("{{t}}@text"));
        assert!(!addresses_document("page-{{n}}##-##_"));
        assert!(!addresses_document("/context.json?id={{n}}"));
    }

    #[test]
    fn test_template_nesting_is_bounded() {
        let doc = Document::json(json!({"k": "k"}));
        let deep = format!("{}k{}", "{{".repeat(5000), "}}".repeat(5000));
        assert_eq!(eval(&doc, &deep), deep);
        let json_deep = format!("{}a{}", "{$.".repeat(5000), "}".repeat(5000));
        let _ = eval(&doc, &json_deep);
    }

    #[test]
    fn test_sessions_do_not_leak() {
        let doc = Document::html(PAGE);
        let analyzer = RuleAnalyzer::default();
        let root = doc.root();

        let mut first = Session::new();
        analyzer.get_string(&mut first, &root, "@put:{k: \"class.name@text\"}h1@text");
        assert_eq!(first.get("k"), Some("Dune"));

        let mut second = Session::new();
        assert_eq!(analyzer.get_string(&mut second, &root, "@get:{k}"), "");
        assert_eq!(analyzer.get_string(&mut second, &root, "@js:context.get('k')"), "");
    }

    fn texts(nodes: Vec<Node<'_>>) -> Vec<String> {
        nodes.iter().map(Node::text).collect()
    }

    #[test]
    fn test_get_elements() {
        let doc = Document::html("<ul><li>a</li><li>b</li><li>c</li></ul>");
        let analyzer = RuleAnalyzer::default();
        let mut session = Session::new();
        let root = doc.root();

        assert_eq!(texts(analyzer.get_elements(&mut session, &root, "tag.li")), ["a", "b", "c"]);
        assert_eq!(texts(analyzer.get_elements(&mut session, &root, "-tag.li")), ["c", "b", "a"]);
        assert_eq!(texts(analyzer.get_elements(&mut session, &root, "+tag.li.0")), ["a"]);
        assert_eq!(texts(analyzer.get_elements(&mut session, &root, "//li[last()]")), ["c"]);

        let nodes = analyzer.get_elements(&mut session, &root, "@js:[{n: 1}, {n: 2}]");
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].attr("n").as_deref(), Some("2"));
    }

    #[test]
    fn test_put_body_fallback() {
        assert_eq!(
            parse_put_body("{a: '@href', b: \"$.x\"}"),
            vec![("a".to_string(), "@href".to_string()), ("b".to_string(), "$.x".to_string())]
        );
        assert_eq!(
            parse_put_body("{a: tag.b@text, c: $.d}"),
            vec![("a".to_string(), "tag.b@text".to_string()), ("c".to_string(), "$.d".to_string())]
        );
    }
}
