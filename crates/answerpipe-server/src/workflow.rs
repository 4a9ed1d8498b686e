use crate::emitter::WorkflowEmitter;
use answerpipe_core::{Error, Result, SearchResult, WorkflowEvent, WorkflowStage};
use answerpipe_research::chain::ProviderChain;
use answerpipe_research::generate::{AnswerGenerator, GenerationRequest};
use answerpipe_research::planner::SearchPlanner;
use answerpipe_research::registry::SourceRegistry;
use answerpipe_research::scrape::PageScraper;
use answerpipe_research::signer::PersistenceSigner;
use answerpipe_research::urlnorm;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The request body the client posts to open a research stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchRequest {
    pub message: String,
    pub chat_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub conversation_context: Vec<String>,
}

#[derive(Clone)]
pub struct WorkflowDeps {
    pub planner: Arc<SearchPlanner>,
    pub chain: Arc<ProviderChain>,
    pub scraper: Option<Arc<PageScraper>>,
    pub generator: Arc<dyn AnswerGenerator>,
    pub signer: Arc<PersistenceSigner>,
    pub max_results_per_query: usize,
    pub scrape_top_n: usize,
}

/// Drive one workflow to completion over the given event channel. Every
/// failure mode ends in a well-formed stream: either `...complete, persisted`
/// or a single trailing `error`. A closed channel (client disconnect) stops
/// the work without either.
pub async fn run_workflow(
    deps: WorkflowDeps,
    req: ResearchRequest,
    tx: mpsc::Sender<WorkflowEvent>,
) {
    let mut emitter = WorkflowEmitter::new(tx);
    if let Err(e) = drive(&deps, &req, &mut emitter).await {
        match e {
            Error::Cancelled => {
                tracing::info!(chat_id = req.chat_id, "client disconnected; workflow cancelled");
                emitter.close();
            }
            e => {
                tracing::error!(chat_id = req.chat_id, error = %e, "workflow failed");
                emitter.fail(e.to_string()).await;
            }
        }
    }
}

async fn drive(
    deps: &WorkflowDeps,
    req: &ResearchRequest,
    emitter: &mut WorkflowEmitter,
) -> Result<()> {
    emitter.start().await?;
    emitter
        .progress(
            WorkflowStage::Planning,
            "Deciding whether web research is needed",
            None,
            None,
        )
        .await?;

    let plan = deps
        .planner
        .plan(&req.chat_id, &req.message, &req.conversation_context);

    let mut registry = SourceRegistry::new();
    let mut citations: Vec<SearchResult> = Vec::new();
    let mut seen_citation_keys: BTreeSet<String> = BTreeSet::new();
    let mut any_fallback = false;

    if plan.should_search {
        let mut queries = plan.queries.clone();
        queries.sort_by_key(|q| q.priority);
        for q in &queries {
            emitter
                .progress(
                    WorkflowStage::Searching,
                    format!("Searching the web: {}", q.query),
                    Some(q.reasoning.clone()),
                    Some(q.query.clone()),
                )
                .await?;
            let found = deps.chain.search(&q.query, deps.max_results_per_query).await;
            any_fallback |= !found.has_real_results;
            registry.merge_search_results(&found.results);
            for r in found.results {
                if seen_citation_keys.insert(urlnorm::normalize_url_for_key(&r.url)) {
                    citations.push(r);
                }
            }
        }

        if let Some(scraper) = &deps.scraper {
            let targets: Vec<String> = registry
                .finalized()
                .into_iter()
                .filter_map(|s| s.url)
                .take(deps.scrape_top_n)
                .collect();
            for url in targets {
                emitter
                    .progress(WorkflowStage::Scraping, format!("Reading {url}"), None, None)
                    .await?;
                match scraper.scrape(&url).await {
                    Ok(page) => {
                        registry.add_scraped_page(&page.url, page.title);
                    }
                    Err(e) => {
                        // A page that refuses to scrape degrades the research,
                        // it does not fail the workflow.
                        tracing::debug!(url, error = %e, "scrape skipped");
                    }
                }
            }
        }
    }

    emitter
        .progress(
            WorkflowStage::Synthesizing,
            "Synthesizing an answer from the research",
            None,
            None,
        )
        .await?;

    let mut stream = deps
        .generator
        .generate(GenerationRequest {
            question: req.message.clone(),
            conversation_context: req.conversation_context.clone(),
            sources: citations,
        })
        .await?;

    let mut answer = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            answerpipe_core::AnswerChunk::Reasoning(r) => emitter.reasoning(r).await?,
            answerpipe_core::AnswerChunk::Content(c) => {
                answer.push_str(&c);
                emitter.content(c).await?;
            }
        }
    }
    if answer.trim().is_empty() {
        return Err(Error::Stream("generation produced no content".to_string()));
    }

    if plan.should_search {
        registry.add_research_summary(format!(
            "Research summary: {}",
            answerpipe_core::truncate_chars(req.message.trim(), 80)
        ));
    }

    let answer_length = answer.chars().count() as u64;
    let has_limitations = any_fallback || registry.redacted_count() > 0;
    let confidence = aggregate_confidence(plan.decision_confidence, any_fallback);

    emitter
        .metadata(registry.finalized(), has_limitations, confidence, answer_length)
        .await?;
    emitter
        .complete_and_persist(&deps.signer, Uuid::now_v7(), answer, registry.persistable())
        .await?;
    Ok(())
}

fn aggregate_confidence(decision_confidence: f64, any_fallback: bool) -> f64 {
    let base = decision_confidence.clamp(0.0, 1.0);
    if any_fallback {
        base * 0.6
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_results_drag_confidence_down() {
        assert_eq!(aggregate_confidence(0.9, false), 0.9);
        assert!(aggregate_confidence(0.9, true) < 0.9);
        assert_eq!(aggregate_confidence(2.0, false), 1.0);
    }

    #[test]
    fn request_body_uses_camel_case_field_names() {
        let js = r#"
        {
          "message": "what is rust",
          "chatId": "c-1",
          "sessionId": "s-1",
          "conversationContext": ["earlier message"]
        }
        "#;
        let req: ResearchRequest = serde_json::from_str(js).unwrap();
        assert_eq!(req.chat_id, "c-1");
        assert_eq!(req.session_id.as_deref(), Some("s-1"));
        assert_eq!(req.conversation_context.len(), 1);

        let minimal: ResearchRequest =
            serde_json::from_str(r#"{"message": "hi", "chatId": "c"}"#).unwrap();
        assert!(minimal.session_id.is_none());
        assert!(minimal.conversation_context.is_empty());
    }
}
