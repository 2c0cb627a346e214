//! Selector-chain extraction
//!
//! A chain is a list of `@`-separated steps applied left to right, each
//! step run against every node the previous step produced:
//! - `tag.NAME`, `class.NAME [NAME…]`, `id.NAME`, `text.NEEDLE`, `children`
//! - any CSS selector, optionally ending in `:eq(n)`, `:first` or `:last`
//! - each optionally filtered by a trailing index set (`.1`, `!0`, `[1:3]`)
//!
//! When a string is wanted, the last step names what to read from the
//! selected elements: `text`, `textNodes`, `ownText`, `html`, `all`,
//! `href`, `src`, or any attribute name. `@css:` rules skip the chain
//! syntax and use the selector verbatim.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Selector};

use super::index_set::{split_index_suffix, IndexSet};
use crate::config::AnalyzerOptions;
use crate::document::Node;
use crate::mode::{is_css_tagged, strip_prefix_tags};
use crate::splitter::{split, split_composite};

const EXTRACTORS: [&str; 7] = ["text", "textNodes", "ownText", "html", "all", "href", "src"];

/// Attributes commonly carrying the real image URL on lazy-loaded pages.
const LAZY_SRC_ATTRS: [&str; 5] = ["data-src", "data-original", "data-lazy-src", "data-echo", "original"];

/// Link text that is site navigation rather than content.
const BOILERPLATE_TEXT: [&str; 10] = [
    "home", "search", "login", "log in", "sign in", "register", "首页", "搜索", "登录", "注册",
];

static SCRIPT_STYLE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>").ok());

/// Evaluates selector-chain rules against document nodes.
#[derive(Debug, Clone, Copy)]
pub struct SelectorChain<'o> {
    options: &'o AnalyzerOptions,
}

impl<'o> SelectorChain<'o> {
    pub fn new(options: &'o AnalyzerOptions) -> Self {
        Self { options }
    }

    /// Nodes selected by `rule` below `node`.
    pub fn get_elements<'a>(&self, node: &Node<'a>, rule: &str) -> Vec<Node<'a>> {
        let rule = rule.trim();
        if rule.is_empty() {
            return Vec::new();
        }

        if let Some((op, parts)) = split_composite(rule) {
            let lists = parts.iter().map(|p| self.get_elements(node, p));
            return op.combine(lists);
        }

        // A trailing extractor names what to read, not what to select.
        let selected = if is_css_tagged(rule) {
            let parts = split(strip_prefix_tags(rule), &["@"]);
            self.select_css(node, &without_extractor(&parts).join("@"))
        } else {
            let steps = split(strip_prefix_tags(rule), &["@"]);
            self.select_steps(vec![node.clone()], without_extractor(&steps))
        };

        if self.options.unwrap_lists && selected.len() == 1 {
            if let Some(rows) = list_rows(&selected[0]) {
                return rows;
            }
        }
        selected
    }

    /// All strings `rule` produces, one per selected element.
    pub fn get_string_list(&self, node: &Node<'_>, rule: &str) -> Vec<String> {
        let rule = rule.trim();
        if rule.is_empty() {
            return Vec::new();
        }

        if let Some((op, parts)) = split_composite(rule) {
            let lists = parts.iter().map(|p| self.get_string_list(node, p));
            return op.combine(lists);
        }

        let (elements, extractor, last_step) = if is_css_tagged(rule) {
            let css = strip_prefix_tags(rule);
            let parts = split(css, &["@"]);
            match parts.split_last() {
                Some((last, rest)) if !rest.is_empty() => {
                    let selector = rest.join("@");
                    (self.select_css(node, &selector), (*last).to_string(), selector)
                }
                _ => (self.select_css(node, css), "text".to_string(), css.to_string()),
            }
        } else {
            let steps = split(strip_prefix_tags(rule), &["@"]);
            match steps.split_last() {
                Some((last, rest)) => {
                    let extractor = classify_last(node, last, rest.is_empty());
                    let chain: &[&str] = if extractor.is_some() { rest } else { &steps };
                    let selected = self.select_steps(vec![node.clone()], chain);
                    let last_step = chain.last().copied().unwrap_or_default().to_string();
                    (selected, extractor.unwrap_or("text").to_string(), last_step)
                }
                None => return Vec::new(),
            }
        };

        let single_link = matches!(extractor.as_str(), "href" | "src")
            && (elements.len() == 1 || names_one_index(&last_step));
        let values = elements
            .iter()
            .flat_map(|el| self.extract(el, &extractor))
            .filter(|v| !v.is_empty());

        if single_link {
            // The first valid candidate of a targeted link wins.
            values.take(1).collect()
        } else {
            values.collect()
        }
    }

    /// `rule` evaluated to a single string, multiple matches joined by `\n`.
    pub fn get_string(&self, node: &Node<'_>, rule: &str) -> String {
        self.get_string_list(node, rule).join("\n")
    }

    fn select_steps<'a>(&self, mut nodes: Vec<Node<'a>>, steps: &[&str]) -> Vec<Node<'a>> {
        for step in steps {
            let mut seen = HashSet::new();
            let mut next = Vec::new();
            for node in &nodes {
                for found in self.select_step(node, step) {
                    if let Some(el) = found.as_element() {
                        if !seen.insert(el.id()) {
                            continue;
                        }
                    }
                    next.push(found);
                }
            }
            nodes = next;
            if nodes.is_empty() {
                break;
            }
        }
        nodes
    }

    fn select_step<'a>(&self, node: &Node<'a>, step: &str) -> Vec<Node<'a>> {
        let step = step.trim();

        // `.list li!0` descends selector by selector, filtering where marked.
        if step.contains('!') && step.contains(char::is_whitespace) {
            let parts: Vec<&str> = step.split_whitespace().collect();
            return self.select_steps(vec![node.clone()], &parts);
        }

        let (body, index) = split_index_suffix(step);

        let candidates = if let Some(name) = body.strip_prefix("tag.") {
            node.by_tag(name.trim())
        } else if let Some(names) = body.strip_prefix("class.") {
            select_by_class(node, names)
        } else if let Some(id) = body.strip_prefix("id.") {
            parse_selector(&format!("[id=\"{}\"]", id.trim().replace('"', "\\\"")))
                .map(|sel| node.select(&sel))
                .unwrap_or_default()
        } else if let Some(needle) = body.strip_prefix("text.") {
            select_by_own_text(node, needle)
        } else if body == "children" {
            node.children()
        } else {
            let (css, position) = split_position_suffix(body);
            let found = self.select_css(node, css);
            return match index.or(position) {
                Some(set) => set.apply(found),
                None => found,
            };
        };

        match index {
            Some(set) => set.apply(candidates),
            None => candidates,
        }
    }

    fn select_css<'a>(&self, node: &Node<'a>, css: &str) -> Vec<Node<'a>> {
        let css = css.trim();
        if css.is_empty() {
            return Vec::new();
        }
        if node.is_json() {
            // Object keys stand in for tag names on JSON nodes.
            return node.by_tag(css);
        }
        match parse_selector(css) {
            Some(sel) => node.select(&sel),
            None => Vec::new(),
        }
    }

    fn extract(&self, node: &Node<'_>, extractor: &str) -> Vec<String> {
        let filter = self.options.noise_filter;
        match extractor {
            "text" => {
                let text = node.text();
                if filter && node.tag_name() == Some("a") && is_boilerplate(&text) {
                    return Vec::new();
                }
                vec![text]
            }
            "textNodes" => vec![node.text_nodes().join("\n")],
            "ownText" => vec![node.own_text()],
            "html" => vec![strip_scripts(&node.outer_html())],
            "all" => vec![node.outer_html()],
            "href" => self.link(node.attr("href")).into_iter().collect(),
            "src" => {
                let src = LAZY_SRC_ATTRS
                    .iter()
                    .filter_map(|name| node.attr(name))
                    .find(|v| !v.trim().is_empty())
                    .or_else(|| node.attr("src"));
                self.link(src).into_iter().collect()
            }
            attr => node.attr(attr).into_iter().collect(),
        }
    }

    /// Drop non-navigable links and resolve against the page URL.
    fn link(&self, raw: Option<String>) -> Option<String> {
        let raw = raw?;
        let href = raw.trim();
        if self.options.noise_filter {
            let lower = href.to_ascii_lowercase();
            if href.is_empty() || href.starts_with('#') || lower.starts_with("javascript:") {
                return None;
            }
        }
        let Some(base) = self.options.base_url.as_deref() else {
            return Some(href.to_string());
        };
        match url::Url::parse(base).and_then(|b| b.join(href)) {
            Ok(absolute) => Some(absolute.to_string()),
            Err(e) => {
                tracing::debug!("cannot resolve `{}` against `{}`: {}", href, base, e);
                Some(href.to_string())
            }
        }
    }
}

/// Decide whether the last chain segment is an extractor. A lone segment
/// is an extractor when it is a known name or an attribute the node has;
/// otherwise it is selected and read as text.
fn classify_last<'r>(node: &Node<'_>, last: &'r str, lone: bool) -> Option<&'r str> {
    let last = last.trim();
    if EXTRACTORS.contains(&last) {
        return Some(last);
    }
    if looks_like_selector(last) {
        return None;
    }
    if lone && node.attr(last).is_none() {
        return None;
    }
    Some(last)
}

/// The selection steps of a chain, minus a trailing extractor name.
fn without_extractor<'s, 'r>(steps: &'s [&'r str]) -> &'s [&'r str] {
    match steps.split_last() {
        Some((last, rest)) if !rest.is_empty() && EXTRACTORS.contains(&last.trim()) => rest,
        _ => steps,
    }
}

/// Whether a selection step ends in a filter naming exactly one index,
/// such as `.0`, `[-1]` or `:first`.
fn names_one_index(step: &str) -> bool {
    let (body, index) = split_index_suffix(step);
    index
        .or_else(|| split_position_suffix(body).1)
        .is_some_and(|set| set.is_single())
}

fn looks_like_selector(segment: &str) -> bool {
    ["tag.", "class.", "id.", "text.", "children"]
        .iter()
        .any(|p| segment.starts_with(p))
        || segment.contains(['.', '#', '[', '>', ' ', '*', '~', '+', '!'])
        || segment.contains(":eq(")
}

fn parse_selector(css: &str) -> Option<Selector> {
    match Selector::parse(css) {
        Ok(sel) => Some(sel),
        Err(e) => {
            tracing::debug!("invalid selector `{}`: {:?}", css, e);
            None
        }
    }
}

fn select_by_class<'a>(node: &Node<'a>, names: &str) -> Vec<Node<'a>> {
    let wanted: Vec<&str> = names.split_whitespace().collect();
    if wanted.is_empty() {
        return Vec::new();
    }
    let Some(el) = node.as_element() else {
        return Vec::new();
    };
    el.descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .filter(|d| {
            let classes: Vec<&str> = d.value().classes().collect();
            wanted.iter().all(|w| classes.contains(w))
        })
        .map(Node::Element)
        .collect()
}

fn select_by_own_text<'a>(node: &Node<'a>, needle: &str) -> Vec<Node<'a>> {
    let Some(el) = node.as_element() else {
        return Vec::new();
    };
    el.descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .map(Node::Element)
        .filter(|d| d.own_text().contains(needle))
        .collect()
}

/// Split jQuery-style `:eq(n)`, `:first`, `:last` off a CSS selector.
fn split_position_suffix(css: &str) -> (&str, Option<IndexSet>) {
    if let Some(rest) = css.strip_suffix(":first") {
        return (rest, Some(IndexSet::single(0)));
    }
    if let Some(rest) = css.strip_suffix(":last") {
        return (rest, Some(IndexSet::single(-1)));
    }
    if css.ends_with(')') {
        if let Some(pos) = css.rfind(":eq(") {
            if let Ok(n) = css[pos + 4..css.len() - 1].trim().parse::<i64>() {
                return (&css[..pos], Some(IndexSet::single(n)));
            }
        }
    }
    (css, None)
}

/// Rows of a lone list or table container.
fn list_rows<'a>(node: &Node<'a>) -> Option<Vec<Node<'a>>> {
    let el = node.as_element()?;
    let rows: Vec<ElementRef<'a>> = match el.value().name() {
        "ul" | "ol" => child_elements(el, &["li"]),
        "table" => el
            .children()
            .filter_map(ElementRef::wrap)
            .flat_map(|child| match child.value().name() {
                "tr" => vec![child],
                "thead" | "tbody" | "tfoot" => child_elements(child, &["tr"]),
                _ => Vec::new(),
            })
            .collect(),
        "tbody" => child_elements(el, &["tr"]),
        _ => return None,
    };
    if rows.is_empty() {
        None
    } else {
        Some(rows.into_iter().map(Node::Element).collect())
    }
}

fn child_elements<'a>(el: ElementRef<'a>, names: &[&str]) -> Vec<ElementRef<'a>> {
    el.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| names.contains(&c.value().name()))
        .collect()
}

fn is_boilerplate(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    BOILERPLATE_TEXT.contains(&lower.as_str())
}

/// Outer HTML with `<script>` and `<style>` elements removed.
pub fn strip_scripts(html: &str) -> String {
    match SCRIPT_STYLE.as_ref() {
        Some(re) => re.replace_all(html, "").into_owned(),
        None => html.to_string(),
    }
}
