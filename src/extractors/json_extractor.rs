//! JSON path evaluation
//!
//! Dot/bracket paths over a parsed JSON value:
//! - `$.a.b`, `a.b`, `$['a'].b` - key access
//! - `a[0]`, `a[-1]`, `[2].b` - index access, negative counts from the end
//! - `a[*].b` - project the rest of the path over every item
//! - `$..name`, `.name` - first `name` key found anywhere (depth-first)
//! - `$`, `$[*]` - the whole document as a list
//! - `{$.a}/{$.b}` - template spans replaced by their own lookups
//!
//! Composite rules (`&&`, `||`, `%%`) split at the top level first.

use std::borrow::Cow;

use serde_json::{Map, Value};
use tracing::debug;

use crate::splitter::{balanced_span, span_depth, split_composite, Composite};

/// Deepest `{$.…}` nesting resolved; deeper spans stay literal.
const MAX_TEMPLATE_DEPTH: usize = 64;

/// Render a JSON value as rule output: strings verbatim, arrays one item
/// per line, `null` as empty, objects as compact JSON.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(format_value)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => value.to_string(),
    }
}

/// Path evaluator bound to one JSON document.
#[derive(Debug, Clone)]
pub struct JsonPath<'v> {
    root: Cow<'v, Value>,
}

impl<'v> JsonPath<'v> {
    /// Wrap `value`. When it carries a string `body` holding a JSON object
    /// (a proxied HTTP envelope), the body's keys are merged in.
    pub fn new(value: &'v Value) -> Self {
        let root = match unwrap_body(value) {
            Some(merged) => Cow::Owned(Value::Object(merged)),
            None => Cow::Borrowed(value),
        };
        Self { root }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Evaluate `path` to a string; missing values render as empty.
    pub fn get_string(&self, path: &str) -> String {
        let path = path.trim();
        if path.is_empty() {
            return String::new();
        }

        if let Some((op, parts)) = split_composite(path) {
            return match op {
                Composite::All => parts
                    .iter()
                    .map(|p| self.get_string(p))
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n"),
                Composite::Any => parts
                    .iter()
                    .map(|p| self.get_string(p))
                    .find(|s| !s.is_empty())
                    .unwrap_or_default(),
                Composite::Interleave => format_value(&Value::Array(self.get_list(path))),
            };
        }

        if let Some(substituted) = self.substitute_templates(path) {
            return substituted;
        }

        self.resolve(path).map(|v| format_value(&v)).unwrap_or_default()
    }

    /// Evaluate `path` to a list. Non-array results become a single item;
    /// missing values give an empty list.
    pub fn get_list(&self, path: &str) -> Vec<Value> {
        let path = path.trim();
        if path.is_empty() {
            return Vec::new();
        }

        if let Some((op, parts)) = split_composite(path) {
            return op.combine(parts.iter().map(|p| self.get_list(p)));
        }

        match self.resolve(path) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        }
    }

    /// Replace `{$.…}` spans, resolving nested spans before the outer one.
    fn substitute_templates(&self, text: &str) -> Option<String> {
        balanced_span(text, "{$.", "}", |inner| {
            if span_depth(inner, "{$.", "}") >= MAX_TEMPLATE_DEPTH {
                debug!("template nested deeper than {} left as is", MAX_TEMPLATE_DEPTH);
                return None;
            }
            let inner = self
                .substitute_templates(inner)
                .unwrap_or_else(|| inner.to_string());
            Some(self.get_string(&format!("$.{inner}")))
        })
    }

    /// Resolve a single (non-composite) path.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        let root: &Value = &self.root;

        if path == "$" || path == "$[*]" {
            return Some(match root {
                Value::Array(_) => root.clone(),
                other => Value::Array(vec![other.clone()]),
            });
        }

        let mut rest = if let Some(r) = path.strip_prefix("$.") {
            r
        } else if let Some(r) = path.strip_prefix('$') {
            r
        } else {
            path
        };

        let mut cursor = Cursor::One(root.clone());
        if let Some(recursive) = rest.strip_prefix('.') {
            let end = recursive.find(['.', '[']).unwrap_or(recursive.len());
            let name = &recursive[..end];
            cursor = Cursor::One(find_key(root, name)?.clone());
            rest = &recursive[end..];
        }

        for step in parse_steps(rest)? {
            cursor = cursor.apply(&step)?;
        }
        Some(cursor.into_value())
    }
}

fn unwrap_body(value: &Value) -> Option<Map<String, Value>> {
    let obj = value.as_object()?;
    let body = obj.get("body")?.as_str()?;
    let Value::Object(inner) = serde_json::from_str::<Value>(body).ok()? else {
        return None;
    };
    let mut merged = obj.clone();
    merged.extend(inner);
    Some(merged)
}

/// Depth-first search for the first `name` key at any depth.
fn find_key<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == name {
                    return Some(child);
                }
                if let Some(found) = find_key(child, name) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(|item| find_key(item, name)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(i64),
    Wildcard,
}

/// Tokenize `a.b[0]['c'][*]` into steps. `None` on malformed brackets.
fn parse_steps(path: &str) -> Option<Vec<Step>> {
    let mut steps = Vec::new();
    let mut rest = path;
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix('.') {
            rest = r;
        } else if let Some(r) = rest.strip_prefix('[') {
            let end = r.find(']')?;
            let content = r[..end].trim();
            rest = &r[end + 1..];
            let step = if content == "*" {
                Step::Wildcard
            } else if let Ok(idx) = content.parse::<i64>() {
                Step::Index(idx)
            } else {
                Step::Key(content.trim_matches(|c| c == '\'' || c == '"').to_string())
            };
            steps.push(step);
        } else {
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            let name = rest[..end].trim();
            if name == "*" {
                steps.push(Step::Wildcard);
            } else if !name.is_empty() {
                steps.push(Step::Key(name.to_string()));
            }
            rest = &rest[end..];
        }
    }
    Some(steps)
}

/// Either a single value, or a projection over several after `[*]`.
enum Cursor {
    One(Value),
    Many(Vec<Value>),
}

impl Cursor {
    fn apply(self, step: &Step) -> Option<Cursor> {
        match self {
            Cursor::One(value) => match step {
                Step::Wildcard => Some(Cursor::Many(match value {
                    Value::Array(items) => items,
                    Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
                    scalar => vec![scalar],
                })),
                Step::Key(key) => match value {
                    // A key applied to a list projects over its items.
                    Value::Array(items) => Cursor::Many(items).apply(step),
                    other => match other.get(key.as_str()) {
                        Some(Value::Null) | None => None,
                        Some(v) => Some(Cursor::One(v.clone())),
                    },
                },
                Step::Index(idx) => index(&value, *idx).cloned().map(Cursor::One),
            },
            Cursor::Many(values) => {
                let projected: Vec<Value> = match step {
                    Step::Wildcard => values
                        .into_iter()
                        .flat_map(|v| match v {
                            Value::Array(items) => items,
                            other => vec![other],
                        })
                        .collect(),
                    Step::Key(key) => values
                        .iter()
                        .filter_map(|v| v.get(key.as_str()))
                        .filter(|v| !v.is_null())
                        .cloned()
                        .collect(),
                    Step::Index(idx) => values
                        .iter()
                        .filter_map(|v| index(v, *idx))
                        .cloned()
                        .collect(),
                };
                Some(Cursor::Many(projected))
            }
        }
    }

    fn into_value(self) -> Value {
        match self {
            Cursor::One(v) => v,
            Cursor::Many(vs) => Value::Array(vs),
        }
    }
}

fn index(value: &Value, idx: i64) -> Option<&Value> {
    let items = value.as_array()?;
    let len = items.len() as i64;
    let pos = if idx < 0 { len + idx } else { idx };
    if (0..len).contains(&pos) {
        items.get(pos as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_paths() {
        let doc = json!({"a": {"b": 5}, "list": [{"n": "x"}, {"n": "y"}]});
        let jp = JsonPath::new(&doc);
        assert_eq!(jp.get_string("$.a.b"), "5");
        assert_eq!(jp.get_string("a.b"), "5");
        assert_eq!(jp.get_string("$['a'].b"), "5");
        assert_eq!(jp.get_string("$.list[1].n"), "y");
        assert_eq!(jp.get_string("$.list[-1].n"), "y");
        assert_eq!(jp.get_string("$.list[*].n"), "x\ny");
        assert_eq!(jp.get_string("$.missing.deeper"), "");
    }

    #[test]
    fn test_recursive_search() {
        let doc = json!({"x": {"y": {"z": 3}}});
        let jp = JsonPath::new(&doc);
        assert_eq!(jp.get_string(".z"), "3");
        assert_eq!(jp.get_string("$..z"), "3");
        assert_eq!(jp.get_string("$..y.z"), "3");
    }

    #[test]
    fn test_recursive_search_first_match_wins() {
        let doc = json!({"a": {"id": 1}, "id": 2});
        assert_eq!(JsonPath::new(&doc).get_string("$..id"), "1");
    }

    #[test]
    fn test_null_short_circuits() {
        let doc = json!({"a": null});
        assert_eq!(JsonPath::new(&doc).get_string("$.a.b.c"), "");
        assert!(JsonPath::new(&doc).get_list("$.a").is_empty());
    }

    #[test]
    fn test_whole_document() {
        let doc = json!({"k": 1});
        let jp = JsonPath::new(&doc);
        assert_eq!(jp.get_list("$").len(), 1);
        let arr = json!([1, 2, 3]);
        assert_eq!(JsonPath::new(&arr).get_list("$[*]").len(), 3);
        assert_eq!(JsonPath::new(&arr).get_string("[1]"), "2");
    }

    #[test]
    fn test_composite_string() {
        let doc = json!({"a": "A", "b": "B", "e": ""});
        let jp = JsonPath::new(&doc);
        assert_eq!(jp.get_string("$.a&&$.b"), "A\nB");
        assert_eq!(jp.get_string("$.e||$.b"), "B");
        assert_eq!(jp.get_string("$.missing&&$.b"), "B");
    }

    #[test]
    fn test_composite_list() {
        let doc = json!({"a": [1, 2], "b": [10, 20, 30], "empty": []});
        let jp = JsonPath::new(&doc);
        assert_eq!(jp.get_list("$.a||$.b"), vec![json!(1), json!(2)]);
        assert_eq!(jp.get_list("$.empty||$.b").len(), 3);
        assert_eq!(jp.get_list("$.a&&$.b").len(), 5);
        assert_eq!(
            jp.get_list("$.a%%$.b"),
            vec![json!(1), json!(10), json!(2), json!(20), json!(30)]
        );
    }

    #[test]
    fn test_templates() {
        let doc = json!({"id": 7, "name": "x", "key": "name"});
        let jp = JsonPath::new(&doc);
        assert_eq!(jp.get_string("/book/{$.id}/{$.name}.html"), "/book/7/x.html");
        assert_eq!(jp.get_string("{$.{$.key}}"), "x");
    }

    #[test]
    fn test_template_nesting_is_bounded() {
        let doc = json!({"k": "k"});
        let jp = JsonPath::new(&doc);
        let nested = |depth: usize| format!("{}k{}", "{$.".repeat(depth), "}".repeat(depth));

        assert_eq!(jp.get_string(&nested(MAX_TEMPLATE_DEPTH)), "k");
        let too_deep = nested(MAX_TEMPLATE_DEPTH + 1);
        assert_eq!(jp.get_string(&too_deep), too_deep);
        let huge = nested(5000);
        assert_eq!(jp.get_string(&huge), huge);
    }

    #[test]
    fn test_scalar_list_wrap() {
        let doc = json!({"s": "one"});
        assert_eq!(JsonPath::new(&doc).get_list("$.s"), vec![json!("one")]);
    }

    #[test]
    fn test_body_envelope_is_merged() {
        let doc = json!({"status": 200, "body": "{\"data\": {\"title\": \"T\"}}"});
        let jp = JsonPath::new(&doc);
        assert_eq!(jp.get_string("$.data.title"), "T");
        assert_eq!(jp.get_string("$.status"), "200");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&json!(null)), "");
        assert_eq!(format_value(&json!(true)), "true");
        assert_eq!(format_value(&json!(["a", null, 2])), "a\n2");
        assert_eq!(format_value(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
