mod logging;
mod orchestrator;
mod routes;
mod worker;

use std::{collections::VecDeque, sync::Arc, time::Instant};

use axum::{
    routing::{delete, get, post},
    Router,
};
use catalyst_agents::{Architect, Coder, Deployer, Planner, Reviewer, Tester};
use catalyst_core::{
    agent::{Runtime, SharedLlmClient},
    bus::{default_bindings, Bus, TopicExchange},
    config::Config,
    env_probe::{Capabilities, Probe},
    git::{NoRemoteForge, RemoteForge},
    health::HealthAggregator,
    llm::HttpLlmClient,
    preview::PreviewService,
    sandbox::Sandbox,
    scheduler::Scheduler,
    store::Store,
    stream::TaskStreamManager,
};
use orchestrator::Orchestrator;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;
use worker::{QueueWorker, WorkerManager};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<Store>,
    pub stream: Arc<TaskStreamManager>,
    pub preview: Arc<PreviewService>,
    pub health: Arc<HealthAggregator>,
    pub config: Arc<Config>,
    pub forge: Arc<dyn RemoteForge>,
    pub start_time: Instant,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (log_tx, _log_rx) = broadcast::channel::<String>(1024);
    let log_ring: Arc<std::sync::Mutex<VecDeque<String>>> =
        Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(500)));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "catalyst_server=info,catalyst_core=info,catalyst_agents=info,tower_http=warn".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BroadcastLayer { tx: log_tx.clone(), ring: Arc::clone(&log_ring) })
        .init();

    let config = Arc::new(Config::from_env()?);
    let capabilities: Capabilities = Probe::detect(&config).await;
    info!(mode = ?capabilities.mode, event_streaming = capabilities.event_streaming, "environment probe complete");

    std::fs::create_dir_all(&config.repo_root)?;

    let store = Arc::new(Store::connect(&config.state_store_url).await?);
    store.migrate().await?;

    let bus: Arc<dyn Bus> = TopicExchange::new(default_bindings());
    let stream = TaskStreamManager::new();

    let llm: SharedLlmClient = Arc::new(HttpLlmClient::new(
        config.llm_api_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    ));
    let forge: Arc<dyn RemoteForge> = Arc::new(NoRemoteForge);

    let sandbox = Arc::new(
        Sandbox::new(
            &config.sandbox_backend,
            &config.container_image,
            config.container_memory_mb,
            config.max_sandbox_concurrency,
        )
        .await,
    );

    let preview = Arc::new(
        PreviewService::new(
            Arc::clone(&store),
            config.preview_domain.clone(),
            config.preview_ttl_hours,
            (config.port_range_start, config.port_range_end),
        )
        .await,
    );

    let usage: catalyst_core::agent::SharedUsageRecorder = Arc::clone(&store);

    let planner = Runtime::new(Planner::new(Arc::clone(&llm), Arc::clone(&usage)), config.agent_timeout_secs);
    let architect = Runtime::new(Architect::new(Arc::clone(&llm), Arc::clone(&usage)), config.agent_timeout_secs);
    let coder = Runtime::new(
        Coder::new(
            Arc::clone(&llm),
            config.repo_root.clone(),
            config.git_mode.clone(),
            config.git_author_name.clone(),
            config.git_author_email.clone(),
            Arc::clone(&forge),
            Arc::clone(&usage),
        ),
        config.agent_timeout_secs,
    );
    let tester = Runtime::new(
        Tester::new(Arc::clone(&sandbox), config.test_coverage_threshold),
        config.agent_timeout_secs,
    );
    let reviewer = Runtime::new(Reviewer::new(Arc::clone(&llm), Arc::clone(&usage)), config.agent_timeout_secs);
    let deployer = Runtime::new(
        Deployer::new(Arc::clone(&preview), "catalyst-backend", "catalyst-frontend"),
        config.agent_timeout_secs,
    );

    let agents: Vec<Arc<dyn QueueWorker>> = vec![
        Arc::new(planner),
        Arc::new(architect),
        Arc::new(coder),
        Arc::new(tester),
        Arc::new(reviewer),
        Arc::new(deployer),
    ];

    let worker_manager = Arc::new(WorkerManager::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&stream),
        agents.clone(),
        config.coder_rework_max,
    ));
    let _worker_handles = worker_manager.spawn_all();

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&stream),
        capabilities,
        agents,
        config.coder_rework_max,
    ));

    let health = Arc::new(HealthAggregator::new(
        Arc::clone(&store),
        Arc::clone(&sandbox),
        Arc::clone(&bus),
        capabilities,
    ));

    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), Arc::clone(&preview)));
    let _scheduler_handles = scheduler.spawn();

    let state = Arc::new(AppState {
        orchestrator,
        store,
        stream,
        preview,
        health,
        config: Arc::clone(&config),
        forge,
        start_time: Instant::now(),
    });

    let app = Router::new()
        .route("/task", post(routes::create_task))
        .route("/task/:id", get(routes::get_task))
        .route("/task/:id/cancel", post(routes::cancel_task))
        .route("/ws/logs/:task_id", get(routes::ws_logs))
        .route("/preview", get(routes::list_previews))
        .route("/preview/:task_id", get(routes::get_preview))
        .route("/preview/:task_id", delete(routes::delete_preview))
        .route("/preview/cleanup-expired", post(routes::cleanup_expired_previews))
        .route("/git/repos", get(routes::list_git_repos))
        .route("/git/repos/:project", get(routes::get_git_repo))
        .route("/git/repos/:project/push", post(routes::push_git_repo))
        .route("/git/repos/:project/pr", post(routes::open_git_pr))
        .route("/health", get(routes::health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let bind = config.web_bind.clone();
    let port = config.web_port;
    let addr = format!("{bind}:{port}");

    info!(%addr, "catalyst-server listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
