use answerpipe_core::{Error, Result, ResultKind, SearchProvider, SearchResult};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone)]
pub struct DuckDuckGoProvider {
    client: reqwest::Client,
}

impl DuckDuckGoProvider {
    /// Keyless; always constructible.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint() -> String {
        // Docs: https://duckduckgo.com/api
        crate::env_nonempty("ANSWERPIPE_DUCKDUCKGO_ENDPOINT")
            .unwrap_or_else(|| "https://api.duckduckgo.com/".to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DdgResponse {
    #[serde(default)]
    heading: Option<String>,
    #[serde(default)]
    abstract_text: Option<String>,
    #[serde(rename = "AbstractURL", default)]
    abstract_url: Option<String>,
    #[serde(default)]
    related_topics: Vec<DdgTopic>,
}

/// Related topics mix plain entries and named groups of nested entries.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DdgTopic {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "FirstURL", default)]
    first_url: Option<String>,
    #[serde(default)]
    topics: Vec<DdgTopic>,
}

fn flatten_topics(topics: Vec<DdgTopic>, out: &mut Vec<(String, String)>, cap: usize) {
    for t in topics {
        if out.len() >= cap {
            return;
        }
        if let (Some(url), Some(text)) = (t.first_url, t.text) {
            if !url.trim().is_empty() {
                out.push((url, text));
            }
        }
        if !t.topics.is_empty() {
            flatten_topics(t.topics, out, cap);
        }
    }
}

#[async_trait::async_trait]
impl SearchProvider for DuckDuckGoProvider {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let max_results = max_results.clamp(1, 20);

        let resp = self
            .client
            .get(Self::endpoint())
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("duckduckgo search HTTP {status}")));
        }

        let parsed: DdgResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let mut out = Vec::new();
        if let Some(url) = parsed.abstract_url.filter(|u| !u.trim().is_empty()) {
            out.push(SearchResult::new(
                parsed.heading.unwrap_or_default(),
                url,
                parsed.abstract_text.unwrap_or_default(),
                Some(0.8),
                ResultKind::Answer,
            ));
        }

        let mut topics = Vec::new();
        flatten_topics(parsed.related_topics, &mut topics, max_results);
        for (url, text) in topics {
            if out.len() >= max_results {
                break;
            }
            // The topic text doubles as title and snippet; the instant-answer
            // API has no separate fields for them.
            out.push(SearchResult::new(
                text.clone(),
                url,
                text,
                None,
                ResultKind::Organic,
            ));
        }

        Ok(out)
    }
}
