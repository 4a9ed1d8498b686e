use answerpipe_core::{AnswerChunk, Result, SearchResult};
use futures_util::stream::BoxStream;

pub type AnswerStream = BoxStream<'static, Result<AnswerChunk>>;

/// Everything the answer generator gets to see: the question, recent
/// conversation turns (oldest first), and the research sources to cite.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub question: String,
    pub conversation_context: Vec<String>,
    pub sources: Vec<SearchResult>,
}

/// The opaque text/reasoning generator the workflow drains. The pipeline
/// treats the stream's yield points as suspension points; implementations own
/// their own timeouts.
#[async_trait::async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<AnswerStream>;
}
