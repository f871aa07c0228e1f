//! Quietline server.
//!
//! Wires the coordination store, job queue, thread store, assistant and
//! Wazzup channel into the webhook gateway, then serves the HTTP routes.

use crate::assistant::{AssistantBackend, AssistantPipeline, OpenAiAssistant};
use crate::config::{QuietlineConfig, StoreBackend};
use crate::escalation::Escalation;
use crate::gateway::WebhookGateway;
use crate::routes;
use crate::threads::ThreadStore;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use ql_channels::{ChannelAdapter, WazzupAdapter};
use ql_core::{
    CoordinationStore, Coordinator, LocalJobQueue, MemoryStore, RedisStore, StaleLockReaper,
};
use ql_llm::{AssistantsClient, ThreadSeed};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub gateway: Arc<WebhookGateway>,
    pub coordinator: Arc<Coordinator>,
    pub queue: Arc<LocalJobQueue>,
    pub threads: ThreadStore,
    pub assistant: Arc<dyn AssistantBackend>,
    pub started_at: Instant,
}

/// Validates the config and checks that the store answers.
pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = QuietlineConfig::load(config_path).await?;
    let store = connect_store(&cfg).await?;
    store
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("store ping failed: {e}"))?;
    let serving = cfg.validate_serving();
    tracing::info!(
        store_backend = store.backend(),
        namespace = %cfg.key_space().namespace(),
        bind_addr = %cfg.server.bind_addr,
        threads_db_path = %cfg.threads.db_path,
        serving_ready = serving.is_ok(),
        "config ok"
    );
    if let Err(e) = serving {
        tracing::warn!(error = %e, "serve would refuse to start");
    }
    Ok(())
}

/// Runs one stale lock sweep and prints the report.
pub async fn reap(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = QuietlineConfig::load(config_path).await?;
    let store = connect_store(&cfg).await?;
    let report = StaleLockReaper::new(store, cfg.key_space()).sweep().await?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = QuietlineConfig::load(config_path).await?;
    cfg.validate_serving()?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    let keys = cfg.key_space();
    tracing::info!(
        bind_addr = %addr,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        store_backend = ?cfg.store.backend,
        namespace = %keys.namespace(),
        channel_id = %cfg.channel.channel_id,
        threads_db_path = %cfg.threads.db_path,
        quiet_period_ms = cfg.coordination.debounce.quiet_period_ms,
        start_window_seconds = cfg.coordination.debounce.start_window_seconds,
        lock_ttl_seconds = cfg.coordination.lock.ttl_seconds,
        reaper_enabled = cfg.coordination.reaper.enabled,
        reaper_interval_seconds = cfg.coordination.reaper.interval_seconds,
        queue_max_concurrency = cfg.queue.max_concurrency,
        queue_time_limit_seconds = cfg.queue.time_limit_seconds,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let store = connect_store(&cfg).await?;
    let queue = Arc::new(LocalJobQueue::new(cfg.queue.clone()));
    let threads = ThreadStore::open(&cfg.threads.db_path).await?;
    let channel: Arc<dyn ChannelAdapter> = Arc::new(WazzupAdapter::new(
        &cfg.channel.wazzup_api_key,
        &cfg.channel.channel_id,
    )?);
    let client = AssistantsClient::new(&cfg.assistant.api_key, &cfg.assistant.assistant_id)
        .with_base_url(&cfg.assistant.base_url)
        .with_polling(
            Duration::from_millis(cfg.assistant.poll_interval_ms),
            cfg.assistant.max_polls,
        );
    let assistant: Arc<dyn AssistantBackend> = Arc::new(OpenAiAssistant::new(
        client,
        ThreadSeed {
            prompt: cfg.assistant.seed_prompt.clone(),
            file_id: cfg.assistant.file_id.clone(),
        },
    ));
    let pipeline = Arc::new(AssistantPipeline::new(
        assistant.clone(),
        threads.clone(),
        channel.clone(),
    ));

    let coordinator = Arc::new(Coordinator::new(
        store,
        queue.clone(),
        keys,
        pipeline,
        cfg.coordination.clone(),
    )?);
    coordinator.start().await?;

    let escalation = Arc::new(Escalation::new(
        coordinator.clone(),
        threads.clone(),
        channel,
        &cfg.channel.handoff_text,
        &cfg.channel.admin_phone,
        &cfg.bot.bot_url,
    ));
    let gateway = Arc::new(WebhookGateway::new(
        &cfg.channel.channel_id,
        threads.clone(),
        coordinator.clone(),
        escalation,
    )?);

    let state = Arc::new(AppState {
        gateway,
        coordinator: coordinator.clone(),
        queue,
        threads,
        assistant,
        started_at,
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.server.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let shutdown = CancellationToken::new();
    tracing::info!(%addr, "quietline serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    coordinator.shutdown().await;
    tracing::info!("job queue shutdown completed");
    Ok(())
}

async fn connect_store(cfg: &QuietlineConfig) -> Result<Arc<dyn CoordinationStore>> {
    let store: Arc<dyn CoordinationStore> = match cfg.store.backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&cfg.store.url)
                .await
                .map_err(|e| anyhow::anyhow!("connect redis: {e}"))?,
        ),
        StoreBackend::Memory => {
            tracing::warn!("memory store selected; coordination is limited to this process");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
