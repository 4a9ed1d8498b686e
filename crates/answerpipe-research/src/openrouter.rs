use crate::generate::{AnswerGenerator, AnswerStream, GenerationRequest};
use answerpipe_core::{AnswerChunk, Error, Result, ResultKind, SearchProvider, SearchResult};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

const REQUEST_TIMEOUT_MS: u64 = 25_000;
const STREAM_TIMEOUT_MS: u64 = 120_000;

fn openrouter_api_key_from_env() -> Option<String> {
    crate::env_nonempty("ANSWERPIPE_OPENROUTER_API_KEY")
        .or_else(|| crate::env_nonempty("OPENROUTER_API_KEY"))
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
}

impl OpenRouterClient {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = openrouter_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured(
                "missing ANSWERPIPE_OPENROUTER_API_KEY (or OPENROUTER_API_KEY)".to_string(),
            )
        })?;
        Ok(Self { client, api_key })
    }

    fn endpoint_chat_completions() -> String {
        // Docs: https://openrouter.ai/docs/api-reference/chat-completion
        crate::env_nonempty("ANSWERPIPE_OPENROUTER_ENDPOINT")
            .unwrap_or_else(|| "https://openrouter.ai/api/v1/chat/completions".to_string())
    }

    fn search_model() -> String {
        crate::env_nonempty("ANSWERPIPE_OPENROUTER_SEARCH_MODEL")
            .unwrap_or_else(|| "perplexity/sonar".to_string())
    }

    fn answer_model() -> String {
        crate::env_nonempty("ANSWERPIPE_OPENROUTER_MODEL")
            .unwrap_or_else(|| "openai/gpt-4o-mini".to_string())
    }

    pub async fn chat_completions(
        &self,
        req: &ChatCompletionsRequest,
    ) -> Result<ChatCompletionsResponse> {
        let resp = self
            .client
            .post(Self::endpoint_chat_completions())
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(req)
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("openrouter chat.completions HTTP {status}")));
        }

        resp.json().await.map_err(|e| Error::Llm(e.to_string()))
    }

    /// Open a streaming completion and return the raw line stream, already
    /// framed by the `data: ` prefix convention.
    async fn chat_completions_stream(
        &self,
        req: &ChatCompletionsRequest,
    ) -> Result<BoxStream<'static, std::result::Result<Vec<u8>, String>>> {
        let resp = self
            .client
            .post(Self::endpoint_chat_completions())
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(req)
            .timeout(Duration::from_millis(STREAM_TIMEOUT_MS))
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("openrouter stream HTTP {status}")));
        }

        Ok(resp
            .bytes_stream()
            .map(|r| r.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .boxed())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionsResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Pull the first JSON array out of a completion that may wrap it in prose or
/// a code fence.
fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

#[derive(Debug, Deserialize)]
struct LlmSearchItem {
    title: Option<String>,
    url: Option<String>,
    snippet: Option<String>,
    #[serde(default)]
    relevance: Option<f64>,
}

/// LLM-backed search: asks an online-capable model for result objects and
/// maps them through the common result schema. Second tier in the chain.
#[derive(Debug, Clone)]
pub struct OpenRouterSearchProvider {
    client: OpenRouterClient,
}

impl OpenRouterSearchProvider {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        Ok(Self {
            client: OpenRouterClient::from_env(client)?,
        })
    }
}

#[async_trait::async_trait]
impl SearchProvider for OpenRouterSearchProvider {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let max_results = max_results.clamp(1, 20);
        let req = ChatCompletionsRequest {
            model: OpenRouterClient::search_model(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: format!(
                        "You are a web search engine. Return ONLY a JSON array of at most \
                         {max_results} objects with keys \"title\", \"url\", \"snippet\" \
                         describing current, real web pages relevant to the user's query. \
                         No prose, no markdown."
                    ),
                },
                Message {
                    role: "user".to_string(),
                    content: query.to_string(),
                },
            ],
            max_tokens: Some(1_500),
            temperature: Some(0.0),
            stream: None,
        };

        let resp = self.client.chat_completions(&req).await?;
        let content = resp
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        let items: Vec<LlmSearchItem> = extract_json_array(content)
            .and_then(|s| serde_json::from_str(s).ok())
            .ok_or_else(|| Error::Search("openrouter search returned no parseable results".to_string()))?;

        let mut out = Vec::new();
        for item in items.into_iter().take(max_results) {
            let Some(url) = item.url else { continue };
            // Models occasionally invent relative or non-http links; those
            // never cross the adapter boundary.
            if crate::urlnorm::normalize(&url, 0).is_err() {
                continue;
            }
            out.push(SearchResult::new(
                item.title.unwrap_or_default(),
                url,
                item.snippet.unwrap_or_default(),
                item.relevance,
                ResultKind::Organic,
            ));
        }
        Ok(out)
    }
}

struct DrainState {
    body: BoxStream<'static, std::result::Result<Vec<u8>, String>>,
    buf: String,
    pending: VecDeque<AnswerChunk>,
    done: bool,
}

fn drain_sse_lines(state: &mut DrainState, bytes: &[u8]) {
    state.buf.push_str(&String::from_utf8_lossy(bytes));
    while let Some(pos) = state.buf.find('\n') {
        let line = state.buf[..pos].trim_end_matches('\r').to_string();
        state.buf.drain(..=pos);
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data.trim() == "[DONE]" {
            state.done = true;
            return;
        }
        let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
            continue;
        };
        for choice in chunk.choices {
            let Some(delta) = choice.delta else { continue };
            if let Some(r) = delta.reasoning.filter(|s| !s.is_empty()) {
                state.pending.push_back(AnswerChunk::Reasoning(r));
            }
            if let Some(c) = delta.content.filter(|s| !s.is_empty()) {
                state.pending.push_back(AnswerChunk::Content(c));
            }
        }
    }
}

fn generation_prompt(req: &GenerationRequest) -> String {
    let mut sources = String::new();
    for (i, s) in req.sources.iter().enumerate() {
        sources.push_str(&format!("[{}] {} ({})\n    {}\n", i + 1, s.title, s.url, s.snippet));
    }
    if sources.is_empty() {
        sources.push_str("(no sources were found; say so and answer from general knowledge)\n");
    }
    let mut context = String::new();
    for turn in &req.conversation_context {
        context.push_str(turn);
        context.push('\n');
    }
    format!(
        "Answer the user's question using the research sources below. Cite sources \
         inline as [n]. Be direct; note any limitations of the evidence.\n\n\
         Conversation so far:\n{context}\nSources:\n{sources}\nQuestion: {}",
        req.question
    )
}

/// The default production generator: OpenRouter streaming completions,
/// reasoning deltas surfaced separately from content deltas.
#[derive(Debug, Clone)]
pub struct OpenRouterGenerator {
    client: OpenRouterClient,
}

impl OpenRouterGenerator {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        Ok(Self {
            client: OpenRouterClient::from_env(client)?,
        })
    }
}

#[async_trait::async_trait]
impl AnswerGenerator for OpenRouterGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<AnswerStream> {
        let req = ChatCompletionsRequest {
            model: OpenRouterClient::answer_model(),
            messages: vec![Message {
                role: "user".to_string(),
                content: generation_prompt(&request),
            }],
            max_tokens: Some(4_000),
            temperature: Some(0.3),
            stream: Some(true),
        };

        let body = self.client.chat_completions_stream(&req).await?;
        let state = DrainState {
            body,
            buf: String::new(),
            pending: VecDeque::new(),
            done: false,
        };

        Ok(futures_util::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(chunk) = st.pending.pop_front() {
                    return Some((Ok(chunk), st));
                }
                if st.done {
                    return None;
                }
                match st.body.next().await {
                    None => st.done = true,
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(Error::Llm(e)), st));
                    }
                    Some(Ok(bytes)) => drain_sse_lines(&mut st, &bytes),
                }
            }
        })
        .boxed())
    }
}
