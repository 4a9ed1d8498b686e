use answerpipe_research::chain::ProviderChain;
use answerpipe_research::openrouter::OpenRouterGenerator;
use answerpipe_research::planner::SearchPlanner;
use answerpipe_research::scrape::PageScraper;
use answerpipe_research::signer::PersistenceSigner;
use answerpipe_server::http::{self, AppState};
use answerpipe_server::ratelimit::{RateLimiter, SystemClock};
use answerpipe_server::workflow::WorkflowDeps;
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "answerpipe", version, about = "Streaming web-research answer server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "ANSWERPIPE_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Results requested from each search provider per query.
    #[arg(long, default_value_t = 8)]
    max_results: usize,

    /// How many top-ranked sources get scraped for full text (0 disables).
    #[arg(long, default_value_t = 2)]
    scrape_top: usize,

    /// Requests allowed per client per minute on /research.
    #[arg(long, default_value_t = 30)]
    rate_limit: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("answerpipe=info")),
        )
        .init();

    let args = Args::parse();

    let client = answerpipe_research::default_http_client()?;
    let chain = Arc::new(ProviderChain::from_env(client.clone()));
    tracing::info!(providers = ?chain.provider_names(), "search chain ready");

    let generator = Arc::new(
        OpenRouterGenerator::from_env(client.clone())
            .context("answer generation requires an OpenRouter API key")?,
    );
    let signer =
        Arc::new(PersistenceSigner::from_env().context("set ANSWERPIPE_SIGNING_KEY")?);

    let scraper = if args.scrape_top > 0 {
        Some(Arc::new(PageScraper::new(client)))
    } else {
        None
    };

    let deps = WorkflowDeps {
        planner: Arc::new(SearchPlanner::new()),
        chain,
        scraper,
        generator,
        signer,
        max_results_per_query: args.max_results,
        scrape_top_n: args.scrape_top,
    };
    let limiter = Arc::new(RateLimiter::new(
        Duration::from_secs(60),
        args.rate_limit,
        Arc::new(SystemClock),
    ));

    let app = http::router(AppState { deps, limiter });
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(addr = %args.bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
