//! Analyzer options

use serde::{Deserialize, Serialize};

/// Tuning knobs for [`RuleAnalyzer`](crate::RuleAnalyzer).
///
/// Deserializes from source configuration JSON; every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerOptions {
    /// Page URL used to make extracted `href`/`src` values absolute
    pub base_url: Option<String>,
    /// Drop `#`/`javascript:` links and navigation boilerplate text
    pub noise_filter: bool,
    /// Replace a lone `ul`/`ol`/`table` match by its rows
    pub unwrap_lists: bool,
    /// Evaluate embedded scripts; when off the base result is kept
    pub scripts: bool,
    /// Statements and loop iterations one script may run
    pub script_step_limit: usize,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            noise_filter: true,
            unwrap_lists: true,
            scripts: true,
            script_step_limit: 100_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_options_use_defaults() {
        let opts: AnalyzerOptions =
            serde_json::from_str(r#"{"base_url": "https://example.com/"}"#).unwrap();
        assert_eq!(opts.base_url.as_deref(), Some("https://example.com/"));
        assert!(opts.noise_filter);
        assert!(opts.scripts);
        assert_eq!(opts.script_step_limit, 100_000);
    }
}
