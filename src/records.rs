//! Record extraction
//!
//! A list rule selects one node per record; every field rule is then
//! evaluated against each of those nodes with a fresh [`Session`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analyzer::RuleAnalyzer;
use crate::config::AnalyzerOptions;
use crate::document::Document;
use crate::session::Session;

/// One output column and the rule producing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub rule: String,
}

/// Extraction request, deserializable from source configuration JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRequest {
    /// Rule selecting the record nodes
    pub list: String,
    /// Field rules, applied to each record node in order
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub options: AnalyzerOptions,
}

/// Field name -> extracted value
pub type Record = BTreeMap<String, String>;

/// Extract one record per node the list rule selects.
///
/// Fields run in declaration order, so a field may read what an earlier
/// field of the same record stored. Records whose fields all came out
/// empty are kept.
pub fn extract_records(document: &Document, request: &ExtractionRequest) -> Vec<Record> {
    let analyzer = RuleAnalyzer::new(request.options.clone());
    let root = document.root();

    let mut list_session = Session::new();
    let rows = analyzer.get_elements(&mut list_session, &root, &request.list);
    debug!("list rule `{}` selected {} rows", request.list, rows.len());

    rows.iter()
        .map(|row| {
            let mut session = Session::new();
            request
                .fields
                .iter()
                .map(|field| {
                    let value = analyzer.get_string(&mut session, row, &field.rule);
                    (field.name.clone(), value)
                })
                .collect()
        })
        .collect()
}

/// Parse `text` (JSON or HTML) and extract its records.
pub fn extract_all(text: &str, request: &ExtractionRequest) -> Vec<Record> {
    let document = Document::parse(text);
    extract_records(&document, request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_list_records() {
        let document = Document::json(json!({"data": [{"name": "A", "id": 1}, {"name": "B", "id": 2}]}));
        let request: ExtractionRequest = serde_json::from_value(json!({
            "list": "data",
            "fields": [{"name": "name", "rule": "name"}]
        }))
        .unwrap();

        let records = extract_records(&document, &request);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], "A");
        assert_eq!(records[1]["name"], "B");
        assert_eq!(records[0].len(), 1);
    }

    #[test]
    fn test_fields_share_a_record_session() {
        let html = r#"
            <div class="item" data-id="1"><b>One</b></div>
            <div class="item" data-id="2"><b>Two</b></div>
        "#;
        let request = ExtractionRequest {
            list: "class.item".to_string(),
            fields: vec![
                FieldSpec {
                    name: "title".to_string(),
                    rule: "@put:{id: \"data-id\"}tag.b@text".to_string(),
                },
                FieldSpec {
                    name: "url".to_string(),
                    rule: "/item/{{id}}".to_string(),
                },
            ],
            options: AnalyzerOptions::default(),
        };

        let records = extract_all(html, &request);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["title"], "One");
        assert_eq!(records[0]["url"], "/item/1");
        assert_eq!(records[1]["url"], "/item/2");
    }

    #[test]
    fn test_empty_fields_are_kept() {
        let request = ExtractionRequest {
            list: "tag.li".to_string(),
            fields: vec![FieldSpec {
                name: "missing".to_string(),
                rule: "class.nope@text".to_string(),
            }],
            options: AnalyzerOptions::default(),
        };
        let records = extract_all("<ul><li>a</li><li>b</li></ul>", &request);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["missing"], "");
    }
}
