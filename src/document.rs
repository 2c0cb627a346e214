//! Documents and the nodes rules are evaluated against
//!
//! A [`Document`] owns either a parsed HTML tree or a JSON value. Rules
//! run against a [`Node`]: a borrowed HTML element, or a synthetic element
//! wrapping a JSON fragment and its position in the list it came from.
//! Both variants answer the same questions (select, children, attribute,
//! text), so the selector-chain machinery works over either.

use std::borrow::Cow;

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use crate::extractors::format_value;

/// A parsed source document, owned by the caller for one extraction.
#[derive(Debug)]
pub enum Document {
    Html(Html),
    Json(Value),
}

impl Document {
    /// Parse `text` as JSON when it looks like a JSON object or array and
    /// parses cleanly, otherwise as HTML.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<Value>(text) {
                return Document::Json(value);
            }
        }
        Document::Html(Html::parse_document(text))
    }

    pub fn html(text: &str) -> Self {
        Document::Html(Html::parse_document(text))
    }

    pub fn json(value: Value) -> Self {
        Document::Json(value)
    }

    pub fn is_json(&self) -> bool {
        matches!(self, Document::Json(_))
    }

    /// The node rules start from.
    pub fn root(&self) -> Node<'_> {
        match self {
            Document::Html(html) => Node::Element(html.root_element()),
            Document::Json(value) => Node::Json(JsonNode::new(value.clone(), 0)),
        }
    }
}

/// A JSON fragment materialized as an element, remembering its index in
/// the list it was selected from.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonNode {
    pub value: Value,
    pub index: usize,
}

impl JsonNode {
    pub fn new(value: Value, index: usize) -> Self {
        Self { value, index }
    }
}

/// An element handle a rule can be applied to, re-enterable as the root
/// of nested field rules.
#[derive(Debug, Clone)]
pub enum Node<'a> {
    Element(ElementRef<'a>),
    Json(JsonNode),
}

impl<'a> Node<'a> {
    pub fn is_json(&self) -> bool {
        matches!(self, Node::Json(_))
    }

    pub fn as_element(&self) -> Option<ElementRef<'a>> {
        match self {
            Node::Element(el) => Some(*el),
            Node::Json(_) => None,
        }
    }

    /// Lower-case tag name; JSON nodes have none.
    pub fn tag_name(&self) -> Option<&str> {
        match self {
            Node::Element(el) => Some(el.value().name()),
            Node::Json(_) => None,
        }
    }

    /// Descendants matching a structural selector. JSON nodes never match.
    pub fn select(&self, selector: &Selector) -> Vec<Node<'a>> {
        match self {
            Node::Element(el) => el.select(selector).map(Node::Element).collect(),
            Node::Json(_) => Vec::new(),
        }
    }

    /// Direct child elements; for JSON, array items or object values.
    pub fn children(&self) -> Vec<Node<'a>> {
        match self {
            Node::Element(el) => el
                .children()
                .filter_map(ElementRef::wrap)
                .map(Node::Element)
                .collect(),
            Node::Json(node) => match &node.value {
                Value::Array(items) => json_nodes(items.iter().cloned()),
                Value::Object(map) => json_nodes(map.values().cloned()),
                _ => Vec::new(),
            },
        }
    }

    /// Elements addressed by a tag name. For JSON the tag is an object key
    /// and array values fan out into one node per item.
    pub fn by_tag(&self, name: &str) -> Vec<Node<'a>> {
        match self {
            Node::Element(_) => match Selector::parse(name) {
                Ok(sel) => self.select(&sel),
                Err(_) => {
                    tracing::debug!("invalid tag name `{}`", name);
                    Vec::new()
                }
            },
            Node::Json(node) => match node.value.get(name) {
                Some(Value::Array(items)) => json_nodes(items.iter().cloned()),
                Some(Value::Null) | None => Vec::new(),
                Some(other) => vec![Node::Json(JsonNode::new(other.clone(), 0))],
            },
        }
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        match self {
            Node::Element(el) => el.value().attr(name).map(String::from),
            Node::Json(node) => node.value.get(name).map(format_value),
        }
    }

    /// Whitespace-normalized text of the element and its descendants.
    pub fn text(&self) -> String {
        match self {
            Node::Element(el) => normalize_ws(&el.text().collect::<String>()),
            Node::Json(node) => format_value(&node.value),
        }
    }

    /// Text of the element's own text nodes, children excluded.
    pub fn own_text(&self) -> String {
        match self {
            Node::Element(_) => normalize_ws(&self.text_nodes().join(" ")),
            Node::Json(node) => format_value(&node.value),
        }
    }

    /// Non-blank own text nodes, each trimmed.
    pub fn text_nodes(&self) -> Vec<String> {
        match self {
            Node::Element(el) => el
                .children()
                .filter_map(|child| child.value().as_text().map(|t| t.trim().to_string()))
                .filter(|t| !t.is_empty())
                .collect(),
            Node::Json(node) => vec![format_value(&node.value)],
        }
    }

    /// Outer HTML, or compact JSON for JSON nodes.
    pub fn outer_html(&self) -> String {
        match self {
            Node::Element(el) => el.html(),
            Node::Json(node) => node.value.to_string(),
        }
    }

    pub fn inner_html(&self) -> String {
        match self {
            Node::Element(el) => el.inner_html(),
            Node::Json(node) => node.value.to_string(),
        }
    }

    /// The JSON this node carries. An HTML element yields its text parsed
    /// as JSON, which covers payloads embedded in `<script>` or `<pre>`.
    pub fn json(&self) -> Option<Cow<'_, Value>> {
        match self {
            Node::Json(node) => Some(Cow::Borrowed(&node.value)),
            Node::Element(el) => {
                let text = el.text().collect::<String>();
                serde_json::from_str::<Value>(text.trim()).ok().map(Cow::Owned)
            }
        }
    }
}

fn json_nodes<'a>(values: impl Iterator<Item = Value>) -> Vec<Node<'a>> {
    values
        .enumerate()
        .map(|(index, value)| Node::Json(JsonNode::new(value, index)))
        .collect()
}

pub(crate) fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_detects_json() {
        assert!(Document::parse(r#"{"a": 1}"#).is_json());
        assert!(Document::parse(" [1, 2]").is_json());
        assert!(!Document::parse("<p>hi</p>").is_json());
        // Looks like JSON but is not: falls back to HTML
        assert!(!Document::parse("{not json").is_json());
    }

    #[test]
    fn test_element_text_variants() {
        let doc = Document::html("<div id='d'> Hello <b>big</b>\n world </div>");
        let sel = Selector::parse("#d").unwrap();
        let div = doc.root().select(&sel).remove(0);
        assert_eq!(div.text(), "Hello big world");
        assert_eq!(div.own_text(), "Hello world");
        assert_eq!(div.text_nodes(), vec!["Hello", "world"]);
        assert_eq!(div.attr("id").as_deref(), Some("d"));
        assert_eq!(div.tag_name(), Some("div"));
    }

    #[test]
    fn test_json_node_capabilities() {
        let node = Node::Json(JsonNode::new(json!({"name": "A", "tags": ["x", "y"]}), 0));
        assert_eq!(node.attr("name").as_deref(), Some("A"));
        let tags = node.by_tag("tags");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[1].text(), "y");
        assert_eq!(node.children().len(), 2);
        assert!(node.select(&Selector::parse("div").unwrap()).is_empty());
    }

    #[test]
    fn test_element_json_payload() {
        let doc = Document::html(r#"<pre id="p">{"k": [1, 2]}</pre>"#);
        let pre = doc.root().select(&Selector::parse("#p").unwrap()).remove(0);
        assert_eq!(pre.json().unwrap()["k"][1], 2);
    }
}
