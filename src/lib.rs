//! Rule interpreter for scraping configurations
//!
//! Evaluates the compact rule strings source configurations use to pull
//! fields out of HTML pages and JSON API responses:
//! - Selector chains (`class.item@tag.a.0@href`, `@css:div > a@text`)
//! - JSON paths (`$.data[*].name`, `$..id`, `{$.a}/{$.b}` templates)
//! - XPath (`//div[@class='x']/a/@href`)
//! - Embedded JavaScript (`<js>…</js>`, `@js:`), run by a sandboxed
//!   interpreter over the swc AST
//!
//! Composite operators (`&&`, `||`, `%%`), `##regex##replacement`
//! suffixes, `{{…}}` templates and per-record `@put`/`@get` variables
//! apply across all modes.

pub mod analyzer;
pub mod config;
pub mod document;
pub mod error;
pub mod extractors;
pub mod mode;
pub mod records;
pub mod session;
pub mod splitter;

pub use analyzer::RuleAnalyzer;
pub use config::AnalyzerOptions;
pub use document::{Document, JsonNode, Node};
pub use error::{Result, RuleError};
pub use records::{extract_all, extract_records, ExtractionRequest, FieldSpec, Record};
pub use session::Session;
