//! Values manipulated by rule scripts
//!
//! Values have copy semantics: arrays and objects are owned by the
//! variable holding them, and mutating methods write the new value back
//! to wherever it was read from.

use std::fmt;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};
use swc_ecma_ast::{BlockStmt, Expr, Pat};

use crate::error::Result;

/// Largest hole a script may open by assigning past an array's end.
const MAX_ARRAY_GAP: usize = 10_000;

static TRAILING_COMMA: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").ok());
static UNQUOTED_KEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"([{,]\s*)([\w$]+)\s*:"#).ok());

/// A user-defined function or arrow callback.
#[derive(Debug)]
pub struct JsFunction {
    pub params: Vec<Pat>,
    pub body: FunctionBody,
}

#[derive(Debug)]
pub enum FunctionBody {
    Expr(Box<Expr>),
    Block(BlockStmt),
}

#[derive(Debug, Clone, Default)]
pub enum JsValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Array(Vec<JsValue>),
    /// Properties in insertion order.
    Object(Vec<(String, JsValue)>),
    Regex {
        source: String,
        flags: String,
    },
    Function(Rc<JsFunction>),
}

impl JsValue {
    pub fn str(text: impl Into<String>) -> Self {
        JsValue::Str(text.into())
    }

    pub fn truthy(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Bool(b) => *b,
            JsValue::Num(n) => *n != 0.0 && !n.is_nan(),
            JsValue::Str(s) => !s.is_empty(),
            JsValue::Array(_) | JsValue::Object(_) | JsValue::Regex { .. } | JsValue::Function(_) => {
                true
            }
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Undefined | JsValue::Null)
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Bool(_) => "boolean",
            JsValue::Num(_) => "number",
            JsValue::Str(_) => "string",
            JsValue::Function(_) => "function",
            JsValue::Null | JsValue::Array(_) | JsValue::Object(_) | JsValue::Regex { .. } => {
                "object"
            }
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            JsValue::Undefined => f64::NAN,
            JsValue::Null => 0.0,
            JsValue::Bool(b) => f64::from(u8::from(*b)),
            JsValue::Num(n) => *n,
            JsValue::Str(s) => string_to_number(s),
            JsValue::Array(items) if items.len() <= 1 => string_to_number(&self.to_js_string()),
            _ => f64::NAN,
        }
    }

    /// The value as JavaScript's `String(value)` renders it.
    pub fn to_js_string(&self) -> String {
        match self {
            JsValue::Undefined => "undefined".to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Bool(b) => b.to_string(),
            JsValue::Num(n) => number_to_string(*n),
            JsValue::Str(s) => s.clone(),
            JsValue::Array(items) => items
                .iter()
                .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string() })
                .collect::<Vec<_>>()
                .join(","),
            JsValue::Object(_) => "[object Object]".to_string(),
            JsValue::Regex { source, flags } => format!("/{source}/{flags}"),
            JsValue::Function(_) => "function () { [native code] }".to_string(),
        }
    }

    /// The value handed back to rule evaluation: nothing for
    /// null/undefined, one line per item for arrays of primitives, JSON
    /// for structured values.
    pub fn to_output(&self) -> String {
        match self {
            JsValue::Undefined | JsValue::Null | JsValue::Function(_) => String::new(),
            JsValue::Array(items) if items.iter().all(JsValue::is_primitive) => items
                .iter()
                .filter(|v| !v.is_nullish())
                .map(JsValue::to_js_string)
                .collect::<Vec<_>>()
                .join("\n"),
            JsValue::Array(_) | JsValue::Object(_) => {
                self.to_json().map(|v| v.to_string()).unwrap_or_default()
            }
            other => other.to_js_string(),
        }
    }

    fn is_primitive(&self) -> bool {
        !matches!(
            self,
            JsValue::Array(_) | JsValue::Object(_) | JsValue::Function(_)
        )
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => JsValue::Null,
            Value::Bool(b) => JsValue::Bool(*b),
            Value::Number(n) => JsValue::Num(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => JsValue::Str(s.clone()),
            Value::Array(items) => JsValue::Array(items.iter().map(JsValue::from_json).collect()),
            Value::Object(map) => JsValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), JsValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON form as `JSON.stringify` sees it; `None` for values it skips.
    pub fn to_json(&self) -> Option<Value> {
        match self {
            JsValue::Undefined | JsValue::Function(_) => None,
            JsValue::Null => Some(Value::Null),
            JsValue::Bool(b) => Some(Value::Bool(*b)),
            JsValue::Num(n) => Some(number_to_json(*n)),
            JsValue::Str(s) => Some(Value::String(s.clone())),
            JsValue::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|v| v.to_json().unwrap_or(Value::Null))
                    .collect(),
            )),
            JsValue::Object(props) => Some(Value::Object(
                props
                    .iter()
                    .filter_map(|(k, v)| v.to_json().map(|j| (k.clone(), j)))
                    .collect::<Map<_, _>>(),
            )),
            JsValue::Regex { .. } => Some(Value::Object(Map::new())),
        }
    }

    pub fn get_property(&self, key: &str) -> JsValue {
        match self {
            JsValue::Str(s) => match key {
                "length" => JsValue::Num(s.chars().count() as f64),
                _ => key
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map_or(JsValue::Undefined, |c| JsValue::Str(c.to_string())),
            },
            JsValue::Array(items) => match key {
                "length" => JsValue::Num(items.len() as f64),
                _ => key
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .unwrap_or_default(),
            },
            JsValue::Object(props) => props
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
            JsValue::Regex { source, flags } => match key {
                "source" => JsValue::Str(source.clone()),
                "flags" => JsValue::Str(flags.clone()),
                "global" => JsValue::Bool(flags.contains('g')),
                _ => JsValue::Undefined,
            },
            _ => JsValue::Undefined,
        }
    }

    /// Set a property in place. Returns false when the value cannot hold
    /// properties.
    pub fn set_property(&mut self, key: &str, value: JsValue) -> bool {
        match self {
            JsValue::Array(items) => match key.parse::<usize>() {
                Ok(i) if i > items.len() + MAX_ARRAY_GAP => false,
                Ok(i) => {
                    if i >= items.len() {
                        items.resize(i + 1, JsValue::Undefined);
                    }
                    items[i] = value;
                    true
                }
                Err(_) if key == "length" => {
                    let len = value.to_number();
                    if !(0.0..=(items.len() + MAX_ARRAY_GAP) as f64).contains(&len) {
                        return false;
                    }
                    items.resize(len as usize, JsValue::Undefined);
                    true
                }
                Err(_) => false,
            },
            JsValue::Object(props) => {
                match props.iter_mut().find(|(k, _)| k == key) {
                    Some(slot) => slot.1 = value,
                    None => props.push((key.to_string(), value)),
                }
                true
            }
            _ => false,
        }
    }

    pub fn strict_equals(&self, other: &JsValue) -> bool {
        match (self, other) {
            (JsValue::Undefined, JsValue::Undefined) | (JsValue::Null, JsValue::Null) => true,
            (JsValue::Bool(a), JsValue::Bool(b)) => a == b,
            (JsValue::Num(a), JsValue::Num(b)) => a == b,
            (JsValue::Str(a), JsValue::Str(b)) => a == b,
            (JsValue::Function(a), JsValue::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn loose_equals(&self, other: &JsValue) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (JsValue::Num(_), JsValue::Str(_))
            | (JsValue::Str(_), JsValue::Num(_))
            | (JsValue::Bool(_), _)
            | (_, JsValue::Bool(_)) => self.to_number() == other.to_number(),
            (JsValue::Array(_) | JsValue::Object(_), JsValue::Str(_) | JsValue::Num(_)) => {
                JsValue::Str(self.to_js_string()).loose_equals(other)
            }
            (JsValue::Str(_) | JsValue::Num(_), JsValue::Array(_) | JsValue::Object(_)) => {
                self.loose_equals(&JsValue::Str(other.to_js_string()))
            }
            _ => self.strict_equals(other),
        }
    }
}

impl fmt::Display for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_js_string())
    }
}

pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

/// `Number(text)`: blank is zero, anything not wholly numeric is NaN.
pub fn string_to_number(text: &str) -> f64 {
    let t = text.trim();
    if t.is_empty() {
        return 0.0;
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).map_or(f64::NAN, |v| v as f64);
    }
    match t {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if !t
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
    {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

/// Parse a JavaScript object or array literal written loosely: single
/// quotes, trailing commas and unquoted keys are accepted.
pub fn parse_js_value(text: &str) -> Result<Value> {
    if let Ok(v) = serde_json::from_str(text) {
        return Ok(v);
    }

    let mut json = text.replace('\'', "\"");
    if let Some(re) = TRAILING_COMMA.as_ref() {
        json = re.replace_all(&json, "$1").into_owned();
    }
    if let Some(re) = UNQUOTED_KEY.as_ref() {
        json = re.replace_all(&json, r#"$1"$2":"#).into_owned();
    }
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(3.0), "3");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(2.5), "2.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(-12.0), "-12");
    }

    #[test]
    fn test_string_to_number() {
        assert_eq!(string_to_number(" 42 "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("0x1f"), 31.0);
        assert!(string_to_number("12px").is_nan());
        assert!(string_to_number("inf").is_nan());
    }

    #[test]
    fn test_equality() {
        assert!(JsValue::Num(1.0).loose_equals(&JsValue::str("1")));
        assert!(!JsValue::Num(1.0).strict_equals(&JsValue::str("1")));
        assert!(JsValue::Null.loose_equals(&JsValue::Undefined));
        assert!(!JsValue::Null.loose_equals(&JsValue::Num(0.0)));
        assert!(JsValue::Bool(true).loose_equals(&JsValue::Num(1.0)));
    }

    #[test]
    fn test_json_conversion() {
        let v = JsValue::from_json(&json!({"a": [1, "x", null], "b": true}));
        assert_eq!(v.get_property("a").get_property("length").to_number(), 3.0);
        assert_eq!(v.to_json(), Some(json!({"a": [1, "x", null], "b": true})));
        assert_eq!(JsValue::Undefined.to_json(), None);
    }

    #[test]
    fn test_output_forms() {
        let list = JsValue::Array(vec![JsValue::str("a"), JsValue::Num(2.0)]);
        assert_eq!(list.to_output(), "a\n2");
        assert_eq!(list.to_js_string(), "a,2");
        let obj = JsValue::Object(vec![("k".into(), JsValue::str("v"))]);
        assert_eq!(obj.to_output(), r#"{"k":"v"}"#);
        assert_eq!(JsValue::Null.to_output(), "");
    }

    #[test]
    fn test_set_property() {
        let mut arr = JsValue::Array(vec![]);
        assert!(arr.set_property("2", JsValue::Num(1.0)));
        assert_eq!(arr.get_property("length").to_number(), 3.0);
        let mut obj = JsValue::Object(vec![]);
        obj.set_property("x", JsValue::str("1"));
        obj.set_property("x", JsValue::str("2"));
        assert_eq!(obj.get_property("x").to_js_string(), "2");
        assert!(!JsValue::Num(1.0).set_property("x", JsValue::Null));
    }

    #[test]
    fn test_parse_js_value() {
        let v = parse_js_value(r#"{"name": "test"}"#).unwrap();
        assert_eq!(v["name"], "test");

        let v = parse_js_value(r#"{'name': 'test'}"#).unwrap();
        assert_eq!(v["name"], "test");

        let v = parse_js_value(r#"{"name": "test",}"#).unwrap();
        assert_eq!(v["name"], "test");

        let v = parse_js_value(r#"{name: "a@href", id: "tag.b@text"}"#).unwrap();
        assert_eq!(v["id"], "tag.b@text");

        assert!(parse_js_value("{name: a@href}").is_err());
    }
}
