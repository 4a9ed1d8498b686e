use crate::urlnorm;
use answerpipe_core::{truncate_chars, Error, Result};
use futures_util::StreamExt;
use std::time::Duration;

const MAX_BODY_BYTES: usize = 1_500_000;
const MAX_TEXT_CHARS: usize = 20_000;
const REQUEST_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone)]
pub struct ScrapedPage {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
    pub truncated: bool,
}

/// Fetches and text-extracts a page so it can join the research sources.
/// Every target passes the SSRF guard first; bodies are read through a hard
/// byte cap so a hostile page cannot balloon memory.
#[derive(Debug, Clone)]
pub struct PageScraper {
    client: reqwest::Client,
}

impl PageScraper {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn scrape(&self, raw_url: &str) -> Result<ScrapedPage> {
        let url = urlnorm::validate_scrape_url(raw_url)?;

        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("scrape HTTP {status}")));
        }
        if let Some(ct) = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            let ct = ct.to_ascii_lowercase();
            if !ct.contains("html") && !ct.contains("text") {
                return Err(Error::Fetch(format!("unsupported content type: {ct}")));
            }
        }

        let mut bytes = Vec::new();
        let mut truncated = false;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fetch(e.to_string()))?;
            if bytes.len().saturating_add(chunk.len()) > MAX_BODY_BYTES {
                let can_take = MAX_BODY_BYTES.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        let html = String::from_utf8_lossy(&bytes);
        let (title, text) = extract_html_text(&html, MAX_TEXT_CHARS);

        Ok(ScrapedPage {
            url,
            title,
            text,
            truncated,
        })
    }
}

fn extract_html_text(html: &str, max_chars: usize) -> (Option<String>, String) {
    let doc = html_scraper::Html::parse_document(html);

    let title = html_scraper::Selector::parse("title")
        .ok()
        .and_then(|sel| {
            doc.select(&sel).next().map(|el| {
                el.text()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
        })
        .filter(|t| !t.is_empty());

    let sel = match html_scraper::Selector::parse("p, h1, h2, h3, li, blockquote") {
        Ok(s) => s,
        Err(_) => return (title, String::new()),
    };

    let mut parts: Vec<String> = Vec::new();
    let mut total = 0usize;
    for el in doc.select(&sel) {
        let chunk = el
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if chunk.is_empty() {
            continue;
        }
        total += chunk.len() + 1;
        parts.push(chunk);
        if total >= max_chars {
            break;
        }
    }

    (title, truncate_chars(&parts.join("\n"), max_chars))
}
