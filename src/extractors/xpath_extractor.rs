//! XPath extraction over HTML elements
//!
//! A practical subset of XPath 1.0 location paths:
//! - absolute (`/html/body`) and relative (`div/a`, `./p`, `.//li`) paths
//! - `/` child and `//` descendant steps, name tests, `*`, `.`, `..`
//! - terminal `text()` and `@attr` steps
//! - predicates `[n]`, `[last()]`, `[@a]`, `[@a='v']`, `[text()='v']`,
//!   `[.='v']`, `[contains(@a,'v')]`, `[starts-with(text(),'v')]`
//! - `|` union of paths
//!
//! An absolute path is evaluated from a virtual document node whose only
//! child is the context element, so `/html/...` works against a page root
//! and `//x` searches the context element and everything below it.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::ElementRef;

use crate::document::{normalize_ws, Node};
use crate::error::{Result, RuleError};
use crate::mode::strip_prefix_tags;
use crate::splitter::{split, split_composite};

static PREDICATE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)^\s*(?:
            (?P<pos>\d+)
          | (?P<last>last\(\))
          | @(?P<has>[\w:.-]+)
          | @(?P<eq_attr>[\w:.-]+)\s*=\s*(?:'(?P<eq_sq>[^']*)'|"(?P<eq_dq>[^"]*)")
          | (?P<text_op>text\(\)|\.)\s*=\s*(?:'(?P<text_sq>[^']*)'|"(?P<text_dq>[^"]*)")
          | (?P<func>contains|starts-with)\(\s*(?P<arg>@[\w:.-]+|text\(\)|\.)\s*,\s*(?:'(?P<fn_sq>[^']*)'|"(?P<fn_dq>[^"]*)")\s*\)
        )\s*$"#,
    )
    .ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Test {
    Name(String),
    Any,
    SelfNode,
    Parent,
    Text,
    Attr(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Attr(String),
    OwnText,
    StringValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    Position(usize),
    Last,
    HasAttr(String),
    Equals(Operand, String),
    Contains(Operand, String),
    StartsWith(Operand, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    axis: Axis,
    test: Test,
    predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Path {
    absolute: bool,
    steps: Vec<Step>,
}

/// One result of a location path.
#[derive(Debug, Clone)]
pub enum Item<'a> {
    /// The virtual document node above the context element.
    Root(ElementRef<'a>),
    Element(ElementRef<'a>),
    Text(String),
}

impl Item<'_> {
    pub fn string_value(&self) -> String {
        match self {
            Item::Root(el) | Item::Element(el) => normalize_ws(&el.text().collect::<String>()),
            Item::Text(text) => text.trim().to_string(),
        }
    }
}

/// A compiled XPath expression (a union of location paths).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XPathQuery {
    paths: Vec<Path>,
}

impl XPathQuery {
    pub fn parse(expr: &str) -> Result<Self> {
        let paths = split(expr, &["|"])
            .into_iter()
            .map(parse_path)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { paths })
    }

    /// Evaluate against `context`, results in path order without
    /// duplicate elements.
    pub fn select<'a>(&self, context: ElementRef<'a>) -> Vec<Item<'a>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for path in &self.paths {
            for item in evaluate(path, context) {
                match &item {
                    Item::Root(el) | Item::Element(el) => {
                        if seen.insert(el.id()) {
                            out.push(item);
                        }
                    }
                    Item::Text(_) => out.push(item),
                }
            }
        }
        out
    }
}

/// Elements selected by `rule` below `node`. JSON nodes select nothing.
pub fn get_elements<'a>(node: &Node<'a>, rule: &str) -> Vec<Node<'a>> {
    let rule = rule.trim();
    if let Some((op, parts)) = split_composite(rule) {
        return op.combine(parts.iter().map(|p| get_elements(node, p)));
    }
    query(node, rule)
        .into_iter()
        .filter_map(|item| match item {
            Item::Element(el) => Some(Node::Element(el)),
            Item::Root(_) | Item::Text(_) => None,
        })
        .collect()
}

/// Non-empty string values of everything `rule` selects.
pub fn get_string_list(node: &Node<'_>, rule: &str) -> Vec<String> {
    let rule = rule.trim();
    if let Some((op, parts)) = split_composite(rule) {
        return op.combine(parts.iter().map(|p| get_string_list(node, p)));
    }
    query(node, rule)
        .iter()
        .map(Item::string_value)
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn get_string(node: &Node<'_>, rule: &str) -> String {
    get_string_list(node, rule).join("\n")
}

fn query<'a>(node: &Node<'a>, rule: &str) -> Vec<Item<'a>> {
    let Some(context) = node.as_element() else {
        return Vec::new();
    };
    let expr = strip_prefix_tags(rule);
    if expr.is_empty() {
        return Vec::new();
    }
    match XPathQuery::parse(expr) {
        Ok(q) => q.select(context),
        Err(e) => {
            tracing::debug!("{}", e);
            Vec::new()
        }
    }
}

fn parse_path(expr: &str) -> Result<Path> {
    let invalid = || RuleError::Selector(expr.to_string());
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(invalid());
    }

    let absolute = expr.starts_with('/');
    let mut steps = Vec::new();
    let mut rest = expr;
    while !rest.is_empty() {
        let axis = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            Axis::Descendant
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            Axis::Child
        } else if steps.is_empty() {
            Axis::Child
        } else {
            return Err(invalid());
        };

        let end = step_end(rest);
        let text = rest[..end].trim();
        if text.is_empty() {
            return Err(invalid());
        }
        steps.push(parse_step(axis, text).ok_or_else(invalid)?);
        rest = &rest[end..];
    }
    Ok(Path { absolute, steps })
}

/// Offset of the next top-level `/`, or the end of `text`.
fn step_end(text: &str) -> usize {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth = depth.saturating_sub(1),
            (None, '/') if depth == 0 => return i,
            _ => {}
        }
    }
    text.len()
}

fn parse_step(axis: Axis, text: &str) -> Option<Step> {
    let (head, mut rest) = match text.find('[') {
        Some(pos) => (text[..pos].trim(), &text[pos..]),
        None => (text, ""),
    };

    let test = match head {
        "*" | "node()" => Test::Any,
        "." => Test::SelfNode,
        ".." => Test::Parent,
        "text()" => Test::Text,
        _ => {
            if let Some(attr) = head.strip_prefix('@') {
                Test::Attr(attr.to_string())
            } else if !head.is_empty()
                && head.chars().all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | ':'))
            {
                Test::Name(head.to_ascii_lowercase())
            } else {
                return None;
            }
        }
    };

    let mut predicates = Vec::new();
    while !rest.is_empty() {
        let inner_end = predicate_end(rest)?;
        predicates.push(parse_predicate(&rest[1..inner_end])?);
        rest = rest[inner_end + 1..].trim_start();
    }
    Some(Step {
        axis,
        test,
        predicates,
    })
}

/// Offset of the `]` closing the predicate `text` starts with.
fn predicate_end(text: &str) -> Option<usize> {
    if !text.starts_with('[') {
        return None;
    }
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_predicate(text: &str) -> Option<Predicate> {
    let caps = PREDICATE.as_ref()?.captures(text)?;
    let quoted = |a: &str, b: &str| {
        caps.name(a)
            .or_else(|| caps.name(b))
            .map_or_else(String::new, |m| m.as_str().to_string())
    };
    let operand = |name: &str| match caps.name(name).map(|m| m.as_str()) {
        Some("text()") => Some(Operand::OwnText),
        Some(".") => Some(Operand::StringValue),
        Some(attr) => attr.strip_prefix('@').map(|a| Operand::Attr(a.to_string())),
        None => None,
    };

    if let Some(pos) = caps.name("pos") {
        let n = pos.as_str().parse::<usize>().ok()?;
        return (n > 0).then_some(Predicate::Position(n));
    }
    if caps.name("last").is_some() {
        return Some(Predicate::Last);
    }
    if let Some(attr) = caps.name("has") {
        return Some(Predicate::HasAttr(attr.as_str().to_string()));
    }
    if let Some(attr) = caps.name("eq_attr") {
        let op = Operand::Attr(attr.as_str().to_string());
        return Some(Predicate::Equals(op, quoted("eq_sq", "eq_dq")));
    }
    if caps.name("text_op").is_some() {
        return Some(Predicate::Equals(operand("text_op")?, quoted("text_sq", "text_dq")));
    }
    let arg = operand("arg")?;
    let value = quoted("fn_sq", "fn_dq");
    match caps.name("func")?.as_str() {
        "contains" => Some(Predicate::Contains(arg, value)),
        _ => Some(Predicate::StartsWith(arg, value)),
    }
}

fn evaluate<'a>(path: &Path, context: ElementRef<'a>) -> Vec<Item<'a>> {
    let mut items = vec![if path.absolute {
        Item::Root(context)
    } else {
        Item::Element(context)
    }];
    for step in &path.steps {
        items = apply_step(step, &items);
        if items.is_empty() {
            break;
        }
    }
    items
}

fn apply_step<'a>(step: &Step, contexts: &[Item<'a>]) -> Vec<Item<'a>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for ctx in contexts {
        let (el, is_root) = match ctx {
            Item::Root(el) => (*el, true),
            Item::Element(el) => (*el, false),
            Item::Text(_) => continue,
        };

        let groups: Vec<Vec<ElementRef<'a>>> = match &step.test {
            Test::Text => {
                out.extend(text_values(el, is_root, step.axis).into_iter().map(Item::Text));
                continue;
            }
            Test::Attr(name) => {
                let owners = match step.axis {
                    Axis::Child if is_root => Vec::new(),
                    Axis::Child => vec![el],
                    Axis::Descendant => descendants(el, is_root),
                };
                out.extend(
                    owners
                        .into_iter()
                        .filter_map(|o| o.value().attr(name).map(|v| Item::Text(v.to_string()))),
                );
                continue;
            }
            Test::SelfNode => {
                if is_root {
                    out.push(Item::Root(el));
                    continue;
                }
                vec![vec![el]]
            }
            Test::Parent => {
                if is_root {
                    continue;
                }
                vec![el.parent().and_then(ElementRef::wrap).into_iter().collect()]
            }
            Test::Name(_) | Test::Any => match step.axis {
                Axis::Child => vec![children(el, is_root)
                    .into_iter()
                    .filter(|c| name_matches(&step.test, *c))
                    .collect()],
                Axis::Descendant => group_by_parent(
                    descendants(el, is_root)
                        .into_iter()
                        .filter(|c| name_matches(&step.test, *c))
                        .collect(),
                ),
            },
        };

        for group in groups {
            let kept = step
                .predicates
                .iter()
                .fold(group, |group, pred| filter_group(group, pred));
            for found in kept {
                if seen.insert(found.id()) {
                    out.push(Item::Element(found));
                }
            }
        }
    }
    out
}

fn children(el: ElementRef<'_>, is_root: bool) -> Vec<ElementRef<'_>> {
    if is_root {
        return vec![el];
    }
    el.children().filter_map(ElementRef::wrap).collect()
}

fn descendants(el: ElementRef<'_>, is_root: bool) -> Vec<ElementRef<'_>> {
    let skip = usize::from(!is_root);
    el.descendants().skip(skip).filter_map(ElementRef::wrap).collect()
}

fn text_values(el: ElementRef<'_>, is_root: bool, axis: Axis) -> Vec<String> {
    match axis {
        Axis::Child if is_root => Vec::new(),
        Axis::Child => el
            .children()
            .filter_map(|c| c.value().as_text().map(|t| t.to_string()))
            .collect(),
        Axis::Descendant => el.text().map(String::from).collect(),
    }
}

fn name_matches(test: &Test, el: ElementRef<'_>) -> bool {
    match test {
        Test::Name(name) => el.value().name().eq_ignore_ascii_case(name),
        Test::Any => true,
        _ => false,
    }
}

/// Split descendants into sibling groups so positional predicates count
/// within each parent, as `//li[1]` does.
fn group_by_parent(found: Vec<ElementRef<'_>>) -> Vec<Vec<ElementRef<'_>>> {
    let mut groups: Vec<Vec<ElementRef<'_>>> = Vec::new();
    let mut keys = Vec::new();
    for el in found {
        let parent = el.parent().map(|p| p.id());
        match keys.iter().position(|k| *k == parent) {
            Some(i) => groups[i].push(el),
            None => {
                keys.push(parent);
                groups.push(vec![el]);
            }
        }
    }
    groups
}

fn filter_group<'a>(group: Vec<ElementRef<'a>>, pred: &Predicate) -> Vec<ElementRef<'a>> {
    match pred {
        Predicate::Position(n) => group.into_iter().nth(n - 1).into_iter().collect(),
        Predicate::Last => group.last().copied().into_iter().collect(),
        _ => group.into_iter().filter(|el| matches_predicate(*el, pred)).collect(),
    }
}

fn matches_predicate(el: ElementRef<'_>, pred: &Predicate) -> bool {
    match pred {
        Predicate::Position(_) | Predicate::Last => true,
        Predicate::HasAttr(name) => el.value().attr(name).is_some(),
        Predicate::Equals(op, value) => operand_value(el, op).is_some_and(|v| v == *value),
        Predicate::Contains(op, value) => {
            operand_value(el, op).is_some_and(|v| v.contains(value.as_str()))
        }
        Predicate::StartsWith(op, value) => {
            operand_value(el, op).is_some_and(|v| v.starts_with(value.as_str()))
        }
    }
}

fn operand_value(el: ElementRef<'_>, op: &Operand) -> Option<String> {
    match op {
        Operand::Attr(name) => el.value().attr(name).map(String::from),
        Operand::OwnText => Some(
            el.children()
                .filter_map(|c| c.value().as_text().map(|t| t.to_string()))
                .collect::<String>()
                .trim()
                .to_string(),
        ),
        Operand::StringValue => Some(normalize_ws(&el.text().collect::<String>())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, JsonNode};
    use serde_json::json;

    const PAGE: &str = r#"
    <html><body>
      <div id="main" class="content">
        <h2>Title</h2>
        <p>Hello</p>
        <p>Hello <b>world</b></p>
        <ul class="items">
          <li><a href="/one">One</a></li>
          <li><a href="/two">Two</a></li>
          <li data-x="1"><a href="/three">Three</a></li>
        </ul>
      </div>
    </body></html>
    "#;

    fn with_root<F: FnOnce(&Node<'_>)>(f: F) {
        let doc = Document::html(PAGE);
        f(&doc.root());
    }

    #[test]
    fn test_absolute_paths() {
        with_root(|root| {
            assert_eq!(get_string(root, "/html/body/div[@id='main']/h2/text()"), "Title");
            assert_eq!(get_string(root, "/html/body/div/h2"), "Title");
            assert!(get_elements(root, "/body").is_empty());
        });
    }

    #[test]
    fn test_descendant_and_attributes() {
        with_root(|root| {
            assert_eq!(get_string(root, "//a/@href"), "/one\n/two\n/three");
            assert_eq!(get_elements(root, "//li").len(), 3);
            assert_eq!(get_string(root, "//*[@data-x]/a"), "Three");
        });
    }

    #[test]
    fn test_positions_count_per_parent() {
        with_root(|root| {
            assert_eq!(get_string(root, "//ul[@class='items']/li[2]"), "Two");
            assert_eq!(get_string(root, "//li[last()]"), "Three");
            // every link is the first link of its own list item
            assert_eq!(get_elements(root, "//a[1]").len(), 3);
        });
    }

    #[test]
    fn test_text_predicates() {
        with_root(|root| {
            assert_eq!(get_string(root, "//a[contains(@href,'two')]"), "Two");
            assert_eq!(get_string(root, "//a[starts-with(text(),'Th')]/@href"), "/three");
            assert_eq!(get_string(root, "//p[.='Hello world']/b/text()"), "world");
            assert_eq!(get_string(root, "//h2[text()=\"Title\"]"), "Title");
        });
    }

    #[test]
    fn test_relative_paths() {
        with_root(|root| {
            let list = get_elements(root, "//ul").remove(0);
            assert_eq!(get_string(&list, "./li/a"), "One\nTwo\nThree");
            assert_eq!(get_string(&list, ".//a[2]"), "");
            assert_eq!(get_string(&list, "li[1]/a/@href"), "/one");
            let parent = get_elements(&list, "..");
            assert_eq!(parent[0].attr("id").as_deref(), Some("main"));
        });
    }

    #[test]
    fn test_union_and_composites() {
        with_root(|root| {
            assert_eq!(get_string(root, "//li[1] | //li[3]"), "One\nThree");
            assert_eq!(get_string(root, "//h3/text()||//h2/text()"), "Title");
            assert_eq!(get_string(root, "//h2&&//li[1]"), "Title\nOne");
        });
    }

    #[test]
    fn test_malformed_expressions_are_empty() {
        with_root(|root| {
            assert_eq!(get_string(root, "//div["), "");
            assert_eq!(get_string(root, "//div[foo bar]"), "");
            assert_eq!(get_string(root, "//"), "");
            assert!(XPathQuery::parse("//a[0]").is_err());
        });
    }

    #[test]
    fn test_json_node_selects_nothing() {
        let node = Node::Json(JsonNode::new(json!({"a": 1}), 0));
        assert!(get_elements(&node, "//a").is_empty());
        assert_eq!(get_string(&node, "//a"), "");
    }
}
