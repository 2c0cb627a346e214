//! Error types for rule evaluation
//!
//! Errors never cross the public extraction boundary; they are logged and
//! turned into an empty or partial result by the caller of each stage.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuleError>;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("script parse error: {0}")]
    ScriptParse(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("script exceeded step limit of {0}")]
    StepLimit(usize),

    #[error("invalid regex `{pattern}`: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid selector `{0}`")]
    Selector(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuleError {
    pub(crate) fn script(msg: impl Into<String>) -> Self {
        RuleError::Script(msg.into())
    }
}

/// Compile a user-supplied pattern, tagging failures with the pattern text.
pub(crate) fn compile_regex(pattern: &str) -> Result<regex::Regex> {
    regex::Regex::new(pattern).map_err(|source| RuleError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}
