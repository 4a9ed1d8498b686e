use answerpipe_core::{AnswerChunk, Error, Result as CoreResult, WorkflowEvent};
use answerpipe_research::chain::ProviderChain;
use answerpipe_research::generate::{AnswerGenerator, AnswerStream, GenerationRequest};
use answerpipe_research::planner::SearchPlanner;
use answerpipe_research::signer::{self, PersistenceSigner};
use answerpipe_server::emitter::EVENT_CHANNEL_CAPACITY;
use answerpipe_server::workflow::{run_workflow, ResearchRequest, WorkflowDeps};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SIGNING_KEY: &[u8] = b"contract-test-key";

#[derive(Clone)]
enum Step {
    Reasoning(&'static str),
    Content(&'static str),
    Fail(&'static str),
}

struct ScriptedGenerator {
    steps: Vec<Step>,
}

#[async_trait::async_trait]
impl AnswerGenerator for ScriptedGenerator {
    async fn generate(&self, _req: GenerationRequest) -> CoreResult<AnswerStream> {
        let items: Vec<CoreResult<AnswerChunk>> = self
            .steps
            .iter()
            .map(|s| match s {
                Step::Reasoning(r) => Ok(AnswerChunk::Reasoning(r.to_string())),
                Step::Content(c) => Ok(AnswerChunk::Content(c.to_string())),
                Step::Fail(m) => Err(Error::Llm(m.to_string())),
            })
            .collect();
        Ok(futures_util::stream::iter(items).boxed())
    }
}

fn deps(steps: Vec<Step>) -> WorkflowDeps {
    WorkflowDeps {
        planner: Arc::new(SearchPlanner::new()),
        // No providers configured: the chain exhausts immediately and serves
        // fallback results, which keeps these tests offline.
        chain: Arc::new(ProviderChain::new(Vec::new(), Duration::from_millis(200))),
        scraper: None,
        generator: Arc::new(ScriptedGenerator { steps }),
        signer: Arc::new(PersistenceSigner::new(SIGNING_KEY.to_vec())),
        max_results_per_query: 5,
        scrape_top_n: 0,
    }
}

fn request(message: &str) -> ResearchRequest {
    ResearchRequest {
        message: message.to_string(),
        chat_id: "chat-contract".to_string(),
        session_id: None,
        conversation_context: Vec::new(),
    }
}

async fn collect(deps: WorkflowDeps, req: ResearchRequest) -> Vec<WorkflowEvent> {
    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let task = tokio::spawn(run_workflow(deps, req, tx));
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    task.await.unwrap();
    events
}

fn index_of(events: &[WorkflowEvent], event_type: &str) -> usize {
    events
        .iter()
        .position(|e| e.event_type() == event_type)
        .unwrap_or_else(|| panic!("no {event_type} event in stream"))
}

#[tokio::test]
async fn research_stream_is_totally_ordered_and_signed() {
    let events = collect(
        deps(vec![
            Step::Reasoning("considering sources"),
            Step::Content("Anthropic raised "),
            Step::Content("a new round [1]."),
        ]),
        request("latest Anthropic funding"),
    )
    .await;

    assert_eq!(events[0].event_type(), "workflow_start");
    let meta = index_of(&events, "metadata");
    let complete = index_of(&events, "complete");
    let persisted = index_of(&events, "persisted");
    assert!(meta < complete && complete < persisted);
    assert_eq!(persisted, events.len() - 1);

    for ty in ["metadata", "complete", "persisted", "workflow_start"] {
        let n = events.iter().filter(|e| e.event_type() == ty).count();
        assert_eq!(n, 1, "expected exactly one {ty}");
    }
    for (i, ev) in events.iter().enumerate() {
        if matches!(ev.event_type(), "progress" | "reasoning" | "content") {
            assert!(i > 0 && i < meta, "{} at index {i} escaped its window", ev.event_type());
        }
    }

    let (start_wf, start_nonce) = match &events[0] {
        WorkflowEvent::WorkflowStart { workflow_id, nonce } => (*workflow_id, *nonce),
        other => panic!("unexpected first event {other:?}"),
    };
    let (meta_wf, meta_nonce, meta_sources, has_limitations, answer_length) = match &events[meta] {
        WorkflowEvent::Metadata {
            workflow_id,
            nonce,
            web_research_sources,
            has_limitations,
            answer_length,
            ..
        } => (
            *workflow_id,
            *nonce,
            web_research_sources.clone(),
            *has_limitations,
            *answer_length,
        ),
        other => panic!("unexpected metadata {other:?}"),
    };
    assert_eq!(start_wf, meta_wf);
    assert_eq!(start_nonce, meta_nonce);
    // Fallback search means limited research, and still some sources.
    assert!(has_limitations);
    assert!(!meta_sources.is_empty());

    let expected_answer = "Anthropic raised a new round [1].";
    assert_eq!(answer_length, expected_answer.chars().count() as u64);
    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::Content { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, expected_answer);

    match &events[complete] {
        WorkflowEvent::Complete { workflow } => {
            assert_eq!(workflow.workflow_id, meta_wf);
            assert_eq!(workflow.answer_length, answer_length);
        }
        other => panic!("unexpected complete {other:?}"),
    }

    match &events[persisted] {
        WorkflowEvent::Persisted {
            payload,
            nonce,
            signature,
        } => {
            assert_eq!(*nonce, start_nonce);
            assert_eq!(payload.workflow_id, start_wf);
            assert_eq!(payload.answer, expected_answer);
            assert_eq!(signature.len(), 64);
            assert!(signer::verify(payload, nonce, signature, SIGNING_KEY));

            let mut tampered = payload.clone();
            tampered.answer.push('!');
            assert!(!signer::verify(&tampered, nonce, signature, SIGNING_KEY));
        }
        other => panic!("unexpected persisted {other:?}"),
    }
}

#[tokio::test]
async fn small_talk_skips_research_but_still_persists() {
    let events = collect(
        deps(vec![Step::Content("Hello! How can I help?")]),
        request("hi"),
    )
    .await;

    assert_eq!(events[0].event_type(), "workflow_start");
    assert_eq!(events.last().unwrap().event_type(), "persisted");
    assert!(!events.iter().any(|e| matches!(
        e,
        WorkflowEvent::Progress { tool_query: Some(_), .. }
    )));

    match &events[index_of(&events, "metadata")] {
        WorkflowEvent::Metadata {
            web_research_sources,
            has_limitations,
            ..
        } => {
            assert!(web_research_sources.is_empty());
            assert!(!has_limitations);
        }
        other => panic!("unexpected metadata {other:?}"),
    }
}

#[tokio::test]
async fn generation_failure_ends_in_a_single_error_event() {
    let events = collect(
        deps(vec![
            Step::Content("partial "),
            Step::Fail("model disconnected"),
        ]),
        request("what happened to the model"),
    )
    .await;

    assert_eq!(events.last().unwrap().event_type(), "error");
    let errors = events.iter().filter(|e| e.event_type() == "error").count();
    assert_eq!(errors, 1);
    assert!(!events.iter().any(|e| e.event_type() == "metadata"));
    assert!(!events.iter().any(|e| e.event_type() == "persisted"));
    // The partial content already sent stays sent.
    assert!(events
        .iter()
        .any(|e| matches!(e, WorkflowEvent::Content { delta } if delta == "partial ")));
}

#[tokio::test]
async fn empty_generation_is_a_stream_failure_not_empty_metadata() {
    let events = collect(deps(vec![]), request("answer me with nothing")).await;
    assert_eq!(events.last().unwrap().event_type(), "error");
    assert!(!events.iter().any(|e| e.event_type() == "metadata"));
}

#[tokio::test]
async fn disconnected_client_cancels_without_orphaned_payload() {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    drop(rx);
    // Must return promptly without panicking; nothing can be emitted.
    run_workflow(
        deps(vec![Step::Content("never seen")]),
        request("latest news"),
        tx,
    )
    .await;
}
