use answerpipe_core::{Error, Result, ResultKind, SearchProvider, SearchResult};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT_MS: u64 = 20_000;

fn serpapi_api_key_from_env() -> Option<String> {
    crate::env_nonempty("ANSWERPIPE_SERPAPI_API_KEY")
        .or_else(|| crate::env_nonempty("SERPAPI_API_KEY"))
}

#[derive(Debug, Clone)]
pub struct SerpApiProvider {
    client: reqwest::Client,
    api_key: String,
}

impl SerpApiProvider {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = serpapi_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured("missing ANSWERPIPE_SERPAPI_API_KEY (or SERPAPI_API_KEY)".to_string())
        })?;
        Ok(Self { client, api_key })
    }

    fn endpoint() -> String {
        // Docs: https://serpapi.com/search-api
        crate::env_nonempty("ANSWERPIPE_SERPAPI_ENDPOINT")
            .unwrap_or_else(|| "https://serpapi.com/search.json".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct SerpApiResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    answer_box: Option<SerpApiAnswerBox>,
    #[serde(default)]
    organic_results: Option<Vec<SerpApiOrganicResult>>,
}

#[derive(Debug, Deserialize)]
struct SerpApiAnswerBox {
    title: Option<String>,
    link: Option<String>,
    #[serde(alias = "answer")]
    snippet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SerpApiOrganicResult {
    position: Option<u32>,
    title: Option<String>,
    link: Option<String>,
    snippet: Option<String>,
}

fn position_score(position: u32) -> f64 {
    (1.0 - 0.05 * (position.saturating_sub(1) as f64)).max(0.3)
}

#[async_trait::async_trait]
impl SearchProvider for SerpApiProvider {
    fn name(&self) -> &'static str {
        "serp"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let max_results = max_results.clamp(1, 20);

        let resp = self
            .client
            .get(Self::endpoint())
            .query(&[
                ("engine", "google"),
                ("q", query),
                ("num", &max_results.to_string()),
                ("api_key", &self.api_key),
            ])
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("serpapi search HTTP {status}")));
        }

        let parsed: SerpApiResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        if let Some(err) = parsed.error {
            return Err(Error::Search(format!("serpapi error: {err}")));
        }

        let mut out = Vec::new();
        if let Some(answer) = parsed.answer_box {
            if let Some(link) = answer.link {
                out.push(SearchResult::new(
                    answer.title.unwrap_or_default(),
                    link,
                    answer.snippet.unwrap_or_default(),
                    Some(0.9),
                    ResultKind::Answer,
                ));
            }
        }
        if let Some(results) = parsed.organic_results {
            for (idx, r) in results.into_iter().enumerate() {
                if out.len() >= max_results {
                    break;
                }
                let Some(link) = r.link else { continue };
                let position = r.position.unwrap_or(idx as u32 + 1);
                out.push(SearchResult::new(
                    r.title.unwrap_or_default(),
                    link,
                    r.snippet.unwrap_or_default(),
                    Some(position_score(position)),
                    ResultKind::Organic,
                ));
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_serpapi_shape() {
        let js = r#"
        {
          "answer_box": {"title": "Answer", "link": "https://example.com/a", "answer": "42"},
          "organic_results": [
            {"position": 1, "title": "One", "link": "https://example.com/1", "snippet": "first"},
            {"position": 2, "title": "Two", "link": "https://example.com/2", "snippet": "second"}
          ]
        }
        "#;
        let parsed: SerpApiResponse = serde_json::from_str(js).unwrap();
        assert!(parsed.error.is_none());
        assert_eq!(parsed.answer_box.unwrap().link.as_deref(), Some("https://example.com/a"));
        assert_eq!(parsed.organic_results.unwrap().len(), 2);
    }

    #[test]
    fn parses_error_shape() {
        let js = r#"{"error": "Invalid API key"}"#;
        let parsed: SerpApiResponse = serde_json::from_str(js).unwrap();
        assert_eq!(parsed.error.as_deref(), Some("Invalid API key"));
    }

    #[test]
    fn position_score_decays_and_floors() {
        assert_eq!(position_score(1), 1.0);
        assert!(position_score(2) < position_score(1));
        assert_eq!(position_score(100), 0.3);
    }
}
