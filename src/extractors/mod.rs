//! Rule evaluators
//!
//! One module per rule mode: selector chains, JSON paths, XPath and
//! embedded scripts.

mod css_extractor;
pub mod index_set;
mod js_extractor;
mod js_value;
mod json_extractor;
pub mod xpath_extractor;

pub use css_extractor::*;
pub use js_extractor::*;
pub use js_value::*;
pub use json_extractor::*;
