use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use intel_relay::{
    ai::OpenAiClient,
    broadcaster::Broadcaster,
    bus::RedisBus,
    cli::{self, Cli, Commands},
    config::Config,
    dedup::{DedupSettings, IntelFeed},
    handlers::{
        get_analysis_status, get_stats, health_check, ingest_intel, prometheus_metrics,
        publish_result, request_analysis, AppState,
    },
    hub::Hub,
    storage::RedisStore,
    tasks::TaskCoordinator,
    websocket::websocket_handler,
    worker::{AnalysisQueue, AnalysisWorker},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to WARN level if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Some(Commands::Watch {
        url,
        company,
        client_id,
        limit,
    }) = cli.command
    {
        if let Err(e) = cli::run_watch_client(url, company, client_id, limit).await {
            error!("Watch client error: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = Config::from_env();
    info!("Starting intel relay on port {}", config.port);
    info!("Redis URL: {}", config.redis_url);

    let bus = match RedisBus::connect(&config.redis_url).await {
        Ok(bus) => bus,
        Err(e) => {
            error!("Failed to connect to Redis: {}", e);
            std::process::exit(1);
        }
    };
    let store = Arc::new(RedisStore::from_manager(bus.manager()));
    let bus = Arc::new(bus);

    let hub = Arc::new(Hub::new(config.max_message_bytes));
    let broadcaster = Arc::new(Broadcaster::new(
        Arc::clone(&hub),
        bus.clone(),
        config.broadcaster_settings(),
    ));
    broadcaster.start_background_tasks();

    let (queue, jobs) = AnalysisQueue::new(config.analysis_queue_capacity);
    let coordinator = Arc::new(TaskCoordinator::new(store, bus, Arc::new(queue)));
    let completion =
        Arc::new(OpenAiClient::new(config.openai()).context("failed to build AI client")?);
    if config.openai_api_key.is_none() {
        info!("OPENAI_API_KEY not set; analyses will return a configuration notice");
    }

    let worker_cancel = CancellationToken::new();
    let worker = AnalysisWorker::new(
        jobs,
        Arc::clone(&coordinator),
        completion,
        config.worker_concurrency,
        config.ai_max_retries,
    );
    let worker_task = tokio::spawn(worker.run(worker_cancel.child_token()));

    let state = AppState {
        broadcaster: Arc::clone(&broadcaster),
        coordinator,
        intel: Arc::new(IntelFeed::new(hub, DedupSettings::default())),
        client_queue_capacity: config.client_queue_capacity,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws/ai", get(websocket_handler))
        .route("/ws/stats", get(get_stats))
        .route("/ai/analyze/:entity_key", post(request_analysis))
        .route("/ai/status/:entity_key", get(get_analysis_status))
        .route("/ai/results/:entity_key", post(publish_result))
        .route("/intel/items", post(ingest_intel))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Intel relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .context("server error")?;

    info!("Shutting down");
    broadcaster.shutdown().await;
    worker_cancel.cancel();
    if let Err(e) = worker_task.await {
        error!("Analysis worker ended abnormally: {}", e);
    }
    Ok(())
}
