//! WebSearch sub-agent: queries one or more pluggable search sources,
//! each attempted independently so a single source's failure never fails
//! the whole step.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{error_map, SubAgent};

/// One pluggable search backend (general web or scholarly).
#[async_trait]
pub trait SearchSource: Send + Sync {
    /// Key this source's result is reported under in the output mapping.
    fn source_name(&self) -> &'static str;

    /// Runs the search, returning a result object or an `{"error": ...}` map.
    /// Never returns `Err` to the caller — failures are folded into the map.
    async fn search(&self, query: &str, max_results: usize, last_days: Option<u32>) -> Map<String, Value>;
}

/// General-web search backed by DuckDuckGo's instant-answer API.
pub struct GeneralWebSource {
    client: reqwest::Client,
}

impl GeneralWebSource {
    /// Creates a source using a shared HTTP client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SearchSource for GeneralWebSource {
    fn source_name(&self) -> &'static str {
        "general-web"
    }

    async fn search(&self, query: &str, _max_results: usize, _last_days: Option<u32>) -> Map<String, Value> {
        let response = self
            .client
            .get("https://api.duckduckgo.com/")
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_redirect", "1"),
                ("no_html", "1"),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return error_map(e.to_string()),
        };

        match response.json::<Value>().await {
            Ok(body) => {
                let abstract_text = body
                    .get("AbstractText")
                    .and_then(Value::as_str)
                    .or_else(|| body.get("Abstract").and_then(Value::as_str))
                    .unwrap_or_default();
                let related: Vec<Value> = body
                    .get("RelatedTopics")
                    .and_then(Value::as_array)
                    .map(|topics| {
                        topics
                            .iter()
                            .filter_map(|t| t.get("Text").and_then(Value::as_str))
                            .take(5)
                            .map(|t| Value::String(t.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                let mut map = Map::new();
                map.insert("abstract".to_string(), Value::String(abstract_text.to_string()));
                map.insert("related".to_string(), Value::Array(related));
                map
            }
            Err(e) => error_map(e.to_string()),
        }
    }
}

/// Scholarly search backed by the arXiv Atom API, filtered by recency.
pub struct ScholarlySource {
    client: reqwest::Client,
}

impl ScholarlySource {
    /// Creates a source using a shared HTTP client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn default_query() -> &'static str {
        "all:(\"large language model\" OR LLM OR agent) AND \
         all:(memory OR \"long-term memory\" OR retrieval OR RAG OR \"episodic memory\" OR \"semantic memory\")"
    }
}

#[async_trait]
impl SearchSource for ScholarlySource {
    fn source_name(&self) -> &'static str {
        "scholarly"
    }

    async fn search(&self, query: &str, max_results: usize, last_days: Option<u32>) -> Map<String, Value> {
        let arxiv_query = if query.is_empty() {
            Self::default_query().to_string()
        } else {
            query.to_string()
        };
        let fetch_count = if last_days.is_some() {
            max_results * 3
        } else {
            max_results
        };
        let response = self
            .client
            .get("http://export.arxiv.org/api/query")
            .query(&[
                ("search_query", arxiv_query.as_str()),
                ("start", "0"),
                ("max_results", &fetch_count.to_string()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return error_map(e.to_string()),
        };

        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => return error_map(e.to_string()),
        };

        let entries = parse_arxiv_entries(&text, max_results, last_days);
        let mut map = Map::new();
        map.insert(
            "entries".to_string(),
            Value::Array(
                entries
                    .into_iter()
                    .map(|(title, summary, published)| {
                        let mut entry = Map::new();
                        entry.insert("title".to_string(), Value::String(title));
                        entry.insert("summary".to_string(), Value::String(summary));
                        entry.insert("published".to_string(), Value::String(published));
                        Value::Object(entry)
                    })
                    .collect(),
            ),
        );
        map
    }
}

/// Extracts `(title, summary, published)` tuples from an arXiv Atom feed,
/// applying the `last_days` recency cutoff when set. A minimal hand-rolled
/// scan rather than a full XML parser, since the feed shape is fixed and
/// small (title/summary/published per `<entry>`).
fn parse_arxiv_entries(xml: &str, max_results: usize, last_days: Option<u32>) -> Vec<(String, String, String)> {
    let cutoff = last_days.map(|days| chrono::Utc::now() - chrono::Duration::days(i64::from(days)));
    let mut entries = Vec::new();
    for block in xml.split("<entry>").skip(1) {
        let Some(end) = block.find("</entry>") else {
            continue;
        };
        let block = &block[..end];
        let title = extract_tag(block, "title");
        let summary = extract_tag(block, "summary");
        let published = extract_tag(block, "published");

        if let (Some(cutoff), Some(published)) = (cutoff, published.as_deref()) {
            if let Ok(pub_dt) = chrono::DateTime::parse_from_rfc3339(published) {
                if pub_dt < cutoff {
                    continue;
                }
            }
        }

        entries.push((
            title.unwrap_or_default().trim().to_string(),
            summary.unwrap_or_default().trim().to_string(),
            published.unwrap_or_default().trim().to_string(),
        ));
        if entries.len() >= max_results {
            break;
        }
    }
    entries
}

fn extract_tag(block: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    Some(block[start..end].to_string())
}

/// `WebSearch`: fans out to every requested source independently.
pub struct WebSearchAgent {
    sources: Vec<Box<dyn SearchSource>>,
}

impl WebSearchAgent {
    /// Creates the agent over a fixed set of sources, keyed by `source_name()`.
    #[must_use]
    pub fn new(sources: Vec<Box<dyn SearchSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl SubAgent for WebSearchAgent {
    fn name(&self) -> &'static str {
        "WebSearch"
    }

    async fn execute(&self, _session_id: &str, payload: &Map<String, Value>) -> Map<String, Value> {
        let query = payload
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if query.is_empty() {
            return error_map("WebSearch requires query");
        }
        let requested: Vec<String> = payload
            .get("sources")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_else(|| vec!["general-web".to_string(), "scholarly".to_string()]);
        let max_results = payload
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(10) as usize;
        let last_days = payload.get("last_days").and_then(Value::as_u64).map(|d| d as u32);
        let query_override = payload
            .get("domain_specific_query")
            .and_then(Value::as_str)
            .unwrap_or(query);

        let mut out = Map::new();
        for source in &self.sources {
            if !requested.iter().any(|r| r == source.source_name()) {
                continue;
            }
            let result = source.search(query_override, max_results, last_days).await;
            out.insert(source.source_name().to_string(), Value::Object(result));
        }
        out
    }
}
