use crate::urlnorm;
use answerpipe_core::{SearchResult, SourceKind, WebResearchSource, MAX_URL_LEN};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Per-workflow registry of research sources. Every logical source gets one
/// UUIDv7 `context_id` for the life of the workflow; merging the same URL
/// again (after canonicalization) reuses it. Sources whose URL fails
/// canonicalization are kept with the URL redacted so the id stays
/// resolvable, and are excluded from the persistable view.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    by_key: HashMap<String, usize>,
    sources: Vec<WebResearchSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn upsert(
        &mut self,
        kind: SourceKind,
        raw_url: &str,
        title: Option<String>,
        relevance_score: Option<f64>,
    ) -> Uuid {
        match urlnorm::normalize(raw_url, MAX_URL_LEN) {
            Ok(normalized) => {
                let key = urlnorm::normalize_url_for_key(&normalized);
                if let Some(&idx) = self.by_key.get(&key) {
                    let existing = &mut self.sources[idx];
                    // Same logical source seen again: keep the id, prefer the
                    // richer view of it.
                    if kind == SourceKind::ScrapedPage {
                        existing.kind = SourceKind::ScrapedPage;
                    }
                    if existing.title.is_none() {
                        existing.title = title.filter(|t| !t.is_empty());
                    }
                    match (existing.relevance_score, relevance_score) {
                        (Some(old), Some(new)) if new > old => {
                            existing.relevance_score = Some(new)
                        }
                        (None, Some(new)) => existing.relevance_score = Some(new),
                        _ => {}
                    }
                    return existing.context_id;
                }
                let context_id = Uuid::now_v7();
                self.by_key.insert(key, self.sources.len());
                self.sources.push(WebResearchSource {
                    context_id,
                    kind,
                    url: Some(normalized),
                    title: title.filter(|t| !t.is_empty()),
                    timestamp_ms: now_ms(),
                    relevance_score,
                });
                context_id
            }
            Err(e) => {
                let context_id = Uuid::now_v7();
                tracing::warn!(
                    context_id = %context_id,
                    url = raw_url,
                    error = %e,
                    "source url failed canonicalization; keeping redacted entry"
                );
                self.sources.push(WebResearchSource {
                    context_id,
                    kind,
                    url: None,
                    title: title.filter(|t| !t.is_empty()),
                    timestamp_ms: now_ms(),
                    relevance_score,
                });
                context_id
            }
        }
    }

    /// Merge a provider result set; returns how many new sources appeared.
    pub fn merge_search_results(&mut self, results: &[SearchResult]) -> usize {
        let before = self.sources.len();
        for r in results {
            self.upsert(
                SourceKind::SearchResult,
                &r.url,
                Some(r.title.clone()),
                Some(r.relevance_score),
            );
        }
        self.sources.len() - before
    }

    /// Record a scraped page. A page whose canonical key matches an existing
    /// search result upgrades that source in place, keeping its id stable.
    pub fn add_scraped_page(&mut self, url: &str, title: Option<String>) -> Uuid {
        self.upsert(SourceKind::ScrapedPage, url, title, None)
    }

    /// The synthesis itself as a source; has no URL by nature.
    pub fn add_research_summary(&mut self, title: impl Into<String>) -> Uuid {
        let context_id = Uuid::now_v7();
        self.sources.push(WebResearchSource {
            context_id,
            kind: SourceKind::ResearchSummary,
            url: None,
            title: Some(title.into()),
            timestamp_ms: now_ms(),
            relevance_score: None,
        });
        context_id
    }

    /// All sources, most relevant first (redacted entries included so every
    /// streamed `context_id` stays resolvable).
    pub fn finalized(&self) -> Vec<WebResearchSource> {
        let mut out = self.sources.clone();
        out.sort_by(|a, b| {
            b.relevance_score
                .unwrap_or(0.0)
                .partial_cmp(&a.relevance_score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    /// The subset safe to persist: redacted URL-bearing sources are dropped,
    /// each drop leaving a trace with its id.
    pub fn persistable(&self) -> Vec<WebResearchSource> {
        self.finalized()
            .into_iter()
            .filter(|s| {
                let keep = s.url.is_some() || s.kind == SourceKind::ResearchSummary;
                if !keep {
                    tracing::warn!(
                        context_id = %s.context_id,
                        "excluding redacted source from persisted payload"
                    );
                }
                keep
            })
            .collect()
    }

    pub fn redacted_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| s.url.is_none() && s.kind != SourceKind::ResearchSummary)
            .count()
    }
}
