use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unsafe url: {0}")]
    UnsafeUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("planning failed: {0}")]
    Plan(String),
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("workflow cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Field caps applied by provider adapters before a result crosses the
/// adapter boundary. Downstream code may assume these hold.
pub const MAX_TITLE_LEN: usize = 300;
pub const MAX_URL_LEN: usize = 2000;
pub const MAX_SNIPPET_LEN: usize = 1000;

/// Truncate to at most `max` characters without splitting a UTF-8 scalar.
/// `max == 0` means unlimited.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if max == 0 {
        return s.to_string();
    }
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Organic,
    Answer,
    News,
    Fallback,
}

/// One result as produced by a provider adapter. Immutable after the adapter
/// returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub relevance_score: f64,
    pub kind: ResultKind,
}

impl SearchResult {
    /// Adapter-boundary constructor: caps field lengths, defaults a missing
    /// relevance score to 0.5, and clamps it into [0, 1].
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        snippet: impl Into<String>,
        relevance_score: Option<f64>,
        kind: ResultKind,
    ) -> Self {
        Self {
            title: truncate_chars(&title.into(), MAX_TITLE_LEN),
            url: truncate_chars(&url.into(), MAX_URL_LEN),
            snippet: truncate_chars(&snippet.into(), MAX_SNIPPET_LEN),
            relevance_score: relevance_score.unwrap_or(0.5).clamp(0.0, 1.0),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    Serp,
    Openrouter,
    Duckduckgo,
    Fallback,
}

/// One failed provider attempt, kept for observability; never surfaced to the
/// client as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAttempt {
    pub provider: String,
    pub error: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchProviderResult {
    pub results: Vec<SearchResult>,
    pub search_method: SearchMethod,
    pub has_real_results: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provider_errors: Vec<ProviderAttempt>,
}

impl SearchProviderResult {
    /// A result set that came from a real provider. `method` must not be
    /// `Fallback`; that pairing is reserved for [`Self::fallback`].
    pub fn real(
        method: SearchMethod,
        results: Vec<SearchResult>,
        enrichment: Option<String>,
        provider_errors: Vec<ProviderAttempt>,
    ) -> Result<Self> {
        if method == SearchMethod::Fallback {
            return Err(Error::Search(
                "fallback method requires the fallback constructor".to_string(),
            ));
        }
        Ok(Self {
            results,
            search_method: method,
            has_real_results: true,
            enrichment,
            provider_errors,
        })
    }

    /// The synthetic result set returned when every provider failed or was
    /// unconfigured. Invariant: `has_real_results == false` iff
    /// `search_method == Fallback`.
    pub fn fallback(results: Vec<SearchResult>, provider_errors: Vec<ProviderAttempt>) -> Self {
        Self {
            results,
            search_method: SearchMethod::Fallback,
            has_real_results: false,
            enrichment: None,
            provider_errors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    SearchResult,
    ScrapedPage,
    ResearchSummary,
}

/// A contextId-addressable research source. `context_id` is minted once per
/// logical source and is the only stable cross-reference between streamed
/// events and persisted storage. `url` is optional because a source may be
/// redacted after the fact while the reference must stay resolvable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebResearchSource {
    pub context_id: Uuid,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
}

pub const MIN_QUERY_PRIORITY: u8 = 1;
pub const MAX_QUERY_PRIORITY: u8 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedQuery {
    pub query: String,
    pub reasoning: String,
    /// 1 = highest. Clamped into {1, 2, 3} by [`Self::new`].
    pub priority: u8,
}

impl PlannedQuery {
    pub fn new(query: impl Into<String>, reasoning: impl Into<String>, priority: u8) -> Self {
        Self {
            query: query.into(),
            reasoning: reasoning.into(),
            priority: priority.clamp(MIN_QUERY_PRIORITY, MAX_QUERY_PRIORITY),
        }
    }
}

/// Produced once per (chat, message) pair and cached by exact message text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPlan {
    pub should_search: bool,
    pub queries: Vec<PlannedQuery>,
    pub suggest_new_chat: bool,
    pub decision_confidence: f64,
}

impl SearchPlan {
    pub fn no_search(reason_confidence: f64) -> Self {
        Self {
            should_search: false,
            queries: Vec::new(),
            suggest_new_chat: false,
            decision_confidence: reason_confidence.clamp(0.0, 1.0),
        }
    }
}

/// The final payload handed to durable storage. Built exactly once, signed at
/// most once, emitted at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPayload {
    pub assistant_message_id: Uuid,
    pub workflow_id: Uuid,
    pub answer: String,
    pub web_research_sources: Vec<WebResearchSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Planning,
    Searching,
    Scraping,
    Synthesizing,
    Finalizing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedWorkflow {
    pub workflow_id: Uuid,
    pub answer_length: u64,
    pub source_count: u64,
}

/// The full server-push protocol, one closed union so both emission and
/// consumption sites are forced to handle every variant.
///
/// Ordering contract: `workflow_start` first; `progress`/`reasoning`/`content`
/// interleave freely after it; exactly one `metadata`, then one `complete`,
/// then one `persisted`. `error` terminates the sequence from any point
/// before `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    #[serde(rename_all = "camelCase")]
    WorkflowStart { workflow_id: Uuid, nonce: Uuid },
    #[serde(rename_all = "camelCase")]
    Progress {
        stage: WorkflowStage,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_reasoning: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_query: Option<String>,
    },
    Reasoning { content: String },
    Content { delta: String },
    #[serde(rename_all = "camelCase")]
    Metadata {
        workflow_id: Uuid,
        web_research_sources: Vec<WebResearchSource>,
        has_limitations: bool,
        confidence: f64,
        answer_length: u64,
        nonce: Uuid,
    },
    Complete { workflow: CompletedWorkflow },
    Persisted {
        payload: PersistedPayload,
        nonce: Uuid,
        signature: String,
    },
    Error { message: String },
}

impl WorkflowEvent {
    /// The wire discriminator, as the client consumes it.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStart { .. } => "workflow_start",
            WorkflowEvent::Progress { .. } => "progress",
            WorkflowEvent::Reasoning { .. } => "reasoning",
            WorkflowEvent::Content { .. } => "content",
            WorkflowEvent::Metadata { .. } => "metadata",
            WorkflowEvent::Complete { .. } => "complete",
            WorkflowEvent::Persisted { .. } => "persisted",
            WorkflowEvent::Error { .. } => "error",
        }
    }
}

/// One chunk from the external answer-generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerChunk {
    Reasoning(String),
    Content(String),
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>>;
}
