use rule_parser::{
    extract_all, extract_records, AnalyzerOptions, Document, ExtractionRequest, RuleAnalyzer,
    Session,
};
use serde_json::json;

const SEARCH_PAGE: &str = r##"
<html>
<head><title>Search</title></head>
<body>
  <nav><a href="/">Home</a><a href="/login">Login</a></nav>
  <ul class="results">
    <li class="book">
      <a class="title" href="/book/1">The Left Hand of Darkness</a>
      <span class="author">Ursula K. Le Guin</span>
      <img data-src="/covers/1.jpg" src="/placeholder.png">
      <p class="meta">Updated: 2024-01-05 | Chapters: 12</p>
    </li>
    <li class="book">
      <a class="title" href="/book/2">Solaris</a>
      <span class="author">Stanisław Lem</span>
      <img src="/covers/2.jpg">
      <p class="meta">Updated: 2023-11-30 | Chapters: 14</p>
    </li>
    <li class="book">
      <a class="title" href="javascript:void(0)">Roadside Picnic</a>
      <span class="author">Arkady and Boris Strugatsky</span>
      <p class="meta">Updated: 2022-07-19 | Chapters: 9</p>
    </li>
  </ul>
</body>
</html>
"##;

fn request(value: serde_json::Value) -> ExtractionRequest {
    serde_json::from_value(value).unwrap()
}

#[test]
fn search_result_rows() {
    let req = request(json!({
        "list": "class.results@tag.li",
        "fields": [
            {"name": "title", "rule": "class.title@text"},
            {"name": "author", "rule": "class.author@text"},
            {"name": "url", "rule": "class.title@href"},
            {"name": "cover", "rule": "tag.img@src"},
            {"name": "chapters", "rule": "class.meta@text##.*Chapters:\\s*"}
        ],
        "options": {"base_url": "https://books.example/search?q=sf"}
    }));

    let records = extract_all(SEARCH_PAGE, &req);
    assert_eq!(records.len(), 3);

    assert_eq!(records[0]["title"], "The Left Hand of Darkness");
    assert_eq!(records[0]["url"], "https://books.example/book/1");
    // lazy-load attribute wins over the placeholder
    assert_eq!(records[0]["cover"], "https://books.example/covers/1.jpg");
    assert_eq!(records[0]["chapters"], "12");

    assert_eq!(records[1]["author"], "Stanisław Lem");
    assert_eq!(records[1]["cover"], "https://books.example/covers/2.jpg");

    // script links are dropped, the row itself is kept
    assert_eq!(records[2]["url"], "");
    assert_eq!(records[2]["title"], "Roadside Picnic");
}

#[test]
fn json_list_records() {
    let document = Document::parse(r#"{"data":[{"name":"A","id":1},{"name":"B","id":2}]}"#);
    let req = request(json!({
        "list": "data",
        "fields": [{"name": "name", "rule": "name"}]
    }));

    let records = extract_records(&document, &req);
    let names: Vec<&str> = records.iter().map(|r| r["name"].as_str()).collect();
    assert_eq!(names, ["A", "B"]);
}

#[test]
fn json_api_with_templates_and_scripts() {
    let body = r#"{
        "code": 0,
        "result": {
            "list": [
                {"bookId": 11, "name": "Dune", "tags": ["sf", "classic"], "words": 187000},
                {"bookId": 12, "name": "Hyperion", "tags": [], "words": 160000}
            ]
        }
    }"#;
    let req = request(json!({
        "list": "$.result.list",
        "fields": [
            {"name": "name", "rule": "$.name"},
            {"name": "url", "rule": "https://api.example/book/{{$.bookId}}"},
            {"name": "tags", "rule": "$.tags<js>result.split('\\n').filter(t => t).join(', ')</js>"},
            {"name": "words", "rule": "$.words@js:(result / 10000).toFixed(1) + 'w'"}
        ]
    }));

    let records = extract_all(body, &req);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["url"], "https://api.example/book/11");
    assert_eq!(records[0]["tags"], "sf, classic");
    assert_eq!(records[0]["words"], "18.7w");
    assert_eq!(records[1]["tags"], "");
    assert_eq!(records[1]["name"], "Hyperion");
}

#[test]
fn composite_rules() {
    let document = Document::html(SEARCH_PAGE);
    let analyzer = RuleAnalyzer::default();
    let root = document.root();
    let mut session = Session::new();

    let first = analyzer.get_string(&mut session, &root, "class.missing@text||class.author.0@text");
    assert_eq!(first, "Ursula K. Le Guin");

    let both = analyzer.get_string(&mut session, &root, "class.title.1@text&&class.author.1@text");
    assert_eq!(both, "Solaris\nStanisław Lem");

    let mixed = analyzer.get_elements(&mut session, &root, "class.title%%class.author");
    let texts: Vec<String> = mixed.iter().take(4).map(|n| n.text()).collect();
    assert_eq!(
        texts,
        ["The Left Hand of Darkness", "Ursula K. Le Guin", "Solaris", "Stanisław Lem"]
    );
}

#[test]
fn xpath_rules() {
    let document = Document::html(SEARCH_PAGE);
    let analyzer = RuleAnalyzer::default();
    let root = document.root();
    let mut session = Session::new();

    let titles = analyzer.get_string(&mut session, &root, "//li[@class='book']/a/text()");
    assert_eq!(titles.lines().count(), 3);
    let last = analyzer.get_string(&mut session, &root, "//li[last()]/span/text()");
    assert_eq!(last, "Arkady and Boris Strugatsky");
    let rows = analyzer.get_elements(&mut session, &root, "//ul[@class='results']/li");
    assert_eq!(rows.len(), 3);
}

#[test]
fn session_isolation_between_records() {
    let document = Document::html(SEARCH_PAGE);
    let analyzer = RuleAnalyzer::default();
    let rows = {
        let mut session = Session::new();
        analyzer.get_elements(&mut session, &document.root(), "class.book")
    };

    let mut first = Session::new();
    analyzer.get_string(&mut first, &rows[0], "@put:{who: \"class.author@text\"}class.title@text");
    assert_eq!(first.get("who"), Some("Ursula K. Le Guin"));

    let mut second = Session::new();
    assert_eq!(analyzer.get_string(&mut second, &rows[1], "{{who}}"), "{{who}}");
    assert_eq!(analyzer.get_string(&mut second, &rows[1], "@get:{who}"), "");
}

#[test]
fn malformed_rules_degrade_to_empty() {
    let document = Document::html(SEARCH_PAGE);
    let analyzer = RuleAnalyzer::new(AnalyzerOptions {
        script_step_limit: 1_000,
        ..Default::default()
    });
    let root = document.root();
    let mut session = Session::new();

    for rule in [
        "class.title@text##(unclosed",
        "$.[[[",
        "//li[",
        "@css:>>>",
        "tag.li[1:x]@text",
        "{{",
        "@put:{broken",
    ] {
        let _ = analyzer.get_string(&mut session, &root, rule);
        let _ = analyzer.get_elements(&mut session, &root, rule);
    }

    assert_eq!(analyzer.get_string(&mut session, &root, "class.title@text##(unclosed"), "");
    let looped = analyzer.get_string(&mut session, &root, "class.author.0@text@js:for(;;){}");
    assert_eq!(looped, "Ursula K. Le Guin");
}
