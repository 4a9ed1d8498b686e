use crate::duckduckgo::DuckDuckGoProvider;
use crate::enrich;
use crate::openrouter::OpenRouterSearchProvider;
use crate::serpapi::SerpApiProvider;
use answerpipe_core::{
    ProviderAttempt, ResultKind, SearchMethod, SearchProvider, SearchProviderResult, SearchResult,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_MAX_RESULTS: usize = 8;

/// Fixed-priority fallback chain. Providers sit in different trust/cost
/// tiers and are tried strictly in order; this is fallback ordering, not a
/// parallelism opportunity. A provider failure of any kind advances the
/// chain, and the chain itself never fails.
pub struct ProviderChain {
    providers: Vec<(SearchMethod, Arc<dyn SearchProvider>)>,
    per_provider_timeout: Duration,
}

impl ProviderChain {
    pub fn new(
        providers: Vec<(SearchMethod, Arc<dyn SearchProvider>)>,
        per_provider_timeout: Duration,
    ) -> Self {
        let providers = providers
            .into_iter()
            .filter(|(m, p)| {
                if *m == SearchMethod::Fallback {
                    tracing::warn!(provider = p.name(), "ignoring provider registered as fallback tier");
                    false
                } else {
                    true
                }
            })
            .collect();
        Self {
            providers,
            per_provider_timeout,
        }
    }

    /// Priority order: SerpApi, then the LLM-backed provider, then DuckDuckGo.
    /// Keyed providers join only when their key is present.
    pub fn from_env(client: reqwest::Client) -> Self {
        let mut providers: Vec<(SearchMethod, Arc<dyn SearchProvider>)> = Vec::new();
        if let Ok(p) = SerpApiProvider::from_env(client.clone()) {
            providers.push((SearchMethod::Serp, Arc::new(p)));
        }
        if let Ok(p) = OpenRouterSearchProvider::from_env(client.clone()) {
            providers.push((SearchMethod::Openrouter, Arc::new(p)));
        }
        providers.push((SearchMethod::Duckduckgo, Arc::new(DuckDuckGoProvider::new(client))));
        Self::new(providers, Duration::from_millis(DEFAULT_PROVIDER_TIMEOUT_MS))
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|(_, p)| p.name()).collect()
    }

    fn attempt(provider: &str, error: &str, started: Instant) -> ProviderAttempt {
        ProviderAttempt {
            provider: provider.to_string(),
            error: error.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub async fn search(&self, query: &str, max_results: usize) -> SearchProviderResult {
        let max_results = if max_results == 0 {
            DEFAULT_MAX_RESULTS
        } else {
            max_results
        };

        let augmented = enrich::augment(query);
        let (effective, enrichment) = match &augmented {
            Some(a) => (a.query.as_str(), Some(a.note.to_string())),
            None => (query, None),
        };

        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        for (method, provider) in &self.providers {
            let t0 = Instant::now();
            match tokio::time::timeout(
                self.per_provider_timeout,
                provider.search(effective, max_results),
            )
            .await
            {
                Ok(Ok(results)) if !results.is_empty() => {
                    tracing::debug!(
                        provider = provider.name(),
                        results = results.len(),
                        elapsed_ms = t0.elapsed().as_millis() as u64,
                        "search succeeded"
                    );
                    match SearchProviderResult::real(
                        *method,
                        results,
                        enrichment.clone(),
                        attempts.clone(),
                    ) {
                        Ok(r) => return r,
                        Err(e) => {
                            attempts.push(Self::attempt(provider.name(), &e.to_string(), t0))
                        }
                    }
                }
                Ok(Ok(_)) => {
                    attempts.push(Self::attempt(provider.name(), "no results", t0));
                }
                Ok(Err(e)) => {
                    tracing::debug!(provider = provider.name(), error = %e, "provider failed");
                    attempts.push(Self::attempt(provider.name(), &e.to_string(), t0));
                }
                Err(_) => {
                    tracing::debug!(provider = provider.name(), "provider timed out");
                    attempts.push(Self::attempt(provider.name(), "timed out", t0));
                }
            }
        }

        tracing::warn!(
            query,
            attempted = attempts.len(),
            "all search providers failed; returning fallback results"
        );
        SearchProviderResult::fallback(fallback_results(query), attempts)
    }
}

/// Synthetic results pointing the user at public search engines. Returned
/// only when the whole chain is exhausted; callers can always render
/// something actionable.
pub fn fallback_results(query: &str) -> Vec<SearchResult> {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    vec![
        SearchResult::new(
            format!("Search Google for \"{query}\""),
            format!("https://www.google.com/search?q={encoded}"),
            "Direct web search is unavailable right now; run this query on Google.",
            Some(0.3),
            ResultKind::Fallback,
        ),
        SearchResult::new(
            format!("Search Bing for \"{query}\""),
            format!("https://www.bing.com/search?q={encoded}"),
            "Direct web search is unavailable right now; run this query on Bing.",
            Some(0.25),
            ResultKind::Fallback,
        ),
        SearchResult::new(
            format!("Search DuckDuckGo for \"{query}\""),
            format!("https://duckduckgo.com/?q={encoded}"),
            "Direct web search is unavailable right now; run this query on DuckDuckGo.",
            Some(0.25),
            ResultKind::Fallback,
        ),
    ]
}
