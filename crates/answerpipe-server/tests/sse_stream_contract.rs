use answerpipe_core::{AnswerChunk, Result as CoreResult};
use answerpipe_research::chain::ProviderChain;
use answerpipe_research::generate::{AnswerGenerator, AnswerStream, GenerationRequest};
use answerpipe_research::planner::SearchPlanner;
use answerpipe_research::signer::PersistenceSigner;
use answerpipe_server::http::{router, AppState};
use answerpipe_server::ratelimit::{RateLimiter, SystemClock};
use answerpipe_server::workflow::WorkflowDeps;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

struct CannedGenerator;

#[async_trait::async_trait]
impl AnswerGenerator for CannedGenerator {
    async fn generate(&self, _req: GenerationRequest) -> CoreResult<AnswerStream> {
        Ok(futures_util::stream::iter(vec![
            Ok(AnswerChunk::Reasoning("reading sources".to_string())),
            Ok(AnswerChunk::Content("A cited answer [1].".to_string())),
        ])
        .boxed())
    }
}

async fn spawn_server(max_requests_per_minute: u32) -> SocketAddr {
    let deps = WorkflowDeps {
        planner: Arc::new(SearchPlanner::new()),
        chain: Arc::new(ProviderChain::new(Vec::new(), Duration::from_millis(200))),
        scraper: None,
        generator: Arc::new(CannedGenerator),
        signer: Arc::new(PersistenceSigner::new(b"sse-test-key".to_vec())),
        max_results_per_query: 5,
        scrape_top_n: 0,
    };
    let limiter = Arc::new(RateLimiter::new(
        Duration::from_secs(60),
        max_requests_per_minute,
        Arc::new(SystemClock),
    ));
    let app = router(AppState { deps, limiter });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn data_frames(body: &str) -> Vec<serde_json::Value> {
    body.lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("frame is not valid JSON"))
        .collect()
}

#[tokio::test]
async fn research_endpoint_streams_ordered_data_frames() {
    let addr = spawn_server(10).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/research"))
        .json(&serde_json::json!({
            "message": "what is the latest on rust async",
            "chatId": "sse-chat",
            "conversationContext": []
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    // The body ends when the workflow finishes and drops its sender.
    let body = resp.text().await.unwrap();
    let frames = data_frames(&body);
    assert!(!frames.is_empty());

    let types: Vec<&str> = frames
        .iter()
        .map(|f| f["type"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(types[0], "workflow_start");
    assert_eq!(*types.last().unwrap(), "persisted");

    let meta = types.iter().position(|t| *t == "metadata").unwrap();
    let complete = types.iter().position(|t| *t == "complete").unwrap();
    let persisted = types.iter().position(|t| *t == "persisted").unwrap();
    assert!(meta < complete && complete < persisted);

    // One nonce binds the whole stream.
    let start_nonce = frames[0]["nonce"].as_str().unwrap().to_string();
    assert_eq!(frames[meta]["nonce"].as_str().unwrap(), start_nonce);
    assert_eq!(frames[persisted]["nonce"].as_str().unwrap(), start_nonce);
    assert_eq!(frames[persisted]["signature"].as_str().unwrap().len(), 64);

    // Client-side reconstruction of the answer from content deltas.
    let answer: String = frames
        .iter()
        .filter(|f| f["type"] == "content")
        .filter_map(|f| f["delta"].as_str())
        .collect();
    assert_eq!(answer, "A cited answer [1].");
    assert_eq!(
        frames[persisted]["payload"]["answer"].as_str().unwrap(),
        answer
    );
}

#[tokio::test]
async fn rate_limited_clients_get_429_with_reset() {
    let addr = spawn_server(1).await;
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "message": "only one of these goes through",
        "chatId": "limited-chat",
        "sessionId": "limited-session"
    });

    let first = client
        .post(format!("http://{addr}/research"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let _ = first.text().await.unwrap();

    let second = client
        .post(format!("http://{addr}/research"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 429);
    let denial: serde_json::Value = second.json().await.unwrap();
    assert!(denial["resetAt"].as_u64().is_some());
}
