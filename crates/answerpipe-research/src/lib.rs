use answerpipe_core::{Error, Result};
use std::time::Duration;

pub mod chain;
pub mod duckduckgo;
pub mod enrich;
pub mod generate;
pub mod openrouter;
pub mod planner;
pub mod registry;
pub mod scrape;
pub mod serpapi;
pub mod signer;
pub mod urlnorm;

/// Shared outbound HTTP client. Providers can hang indefinitely without
/// explicit caps, so the client carries conservative defaults; per-call
/// timeouts still override the request timeout.
pub fn default_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("answerpipe/0.1")
        .redirect(reqwest::redirect::Policy::limited(10))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Fetch(e.to_string()))
}

pub(crate) fn env_truthy(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub(crate) fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
