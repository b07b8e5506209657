//! toolgate HTTP server.
//!
//! Wires the model client, tool registry and message store into a
//! `TurnEngine` and mounts the chat routes on top.

use crate::config::{StoreBackend, StoreConfig, ToolgateConfig, ToolsConfig};
use crate::routes;
use crate::store::{MemoryStore, MessageStore, SqliteStore};
use crate::turn::{TurnEngine, TurnSettings};
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use gate_llm::{LanguageModel, LlmClient};
use gate_tools::{
    CalendarStore, CreateCalendarEventTool, CurrentTimeTool, ListCalendarEventsTool,
    ToolRegistry,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub engine: Arc<TurnEngine>,
    /// Cancelled on shutdown; every in-flight turn listens on a child token.
    pub shutdown: CancellationToken,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ToolgateConfig::load(config_path).await?;
    let registry = build_registry(&cfg.tools)?;
    tracing::info!(
        model = %cfg.general.model,
        llm_base_url = %cfg.llm.base_url,
        api_key_configured = cfg.api_key().is_some(),
        store_backend = ?cfg.store.backend,
        bind_addr = %cfg.bind_addr()?,
        tool_count = registry.len(),
        "config ok"
    );
    if cfg.api_key().is_none() {
        tracing::warn!("no api key configured; requests will be sent without authorization");
    }
    Ok(())
}

pub async fn print_tools(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ToolgateConfig::load(config_path).await?;
    let registry = build_registry(&cfg.tools)?;
    let summaries = registry.summaries();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ToolgateConfig::load(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        model = %cfg.general.model,
        llm_base_url = %cfg.llm.base_url,
        llm_request_timeout_seconds = cfg.llm.request_timeout_seconds,
        agent_max_steps = cfg.agent.max_steps,
        agent_max_error_chars = cfg.agent.max_error_chars,
        store_backend = ?cfg.store.backend,
        runtime_http_timeout_seconds = cfg.runtime.http_timeout_seconds,
        runtime_http_max_in_flight = cfg.runtime.http_max_in_flight,
        bind_addr = %addr,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let registry = Arc::new(build_registry(&cfg.tools)?);
    let store = build_store(&cfg.store).await?;
    let model: Arc<dyn LanguageModel> = Arc::new(
        LlmClient::new(
            &cfg.api_key().unwrap_or_default(),
            &cfg.general.model,
            Duration::from_secs(cfg.llm.request_timeout_seconds),
        )?
        .with_base_url(&cfg.llm.base_url),
    );

    let engine = Arc::new(TurnEngine::new(
        store,
        model,
        registry,
        TurnSettings {
            system_prompt: cfg.general.system_prompt.clone(),
            max_steps: cfg.agent.max_steps,
            max_error_chars: cfg.agent.max_error_chars,
            event_buffer: cfg.agent.event_buffer,
        },
    ));
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState {
        engine,
        shutdown: shutdown.clone(),
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
            cfg.runtime.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.runtime.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "toolgate serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");
    Ok(())
}

/// Builds the registry from the enabled built-in tools. A bad definition is
/// fatal at startup.
pub fn build_registry(tools: &ToolsConfig) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    if tools.calendar {
        let calendar = Arc::new(CalendarStore::new());
        registry.register_tool(Arc::new(CreateCalendarEventTool::new(calendar.clone())))?;
        registry.register_tool(Arc::new(ListCalendarEventsTool::new(calendar)))?;
    }
    if tools.clock {
        registry.register_tool(Arc::new(CurrentTimeTool::new()))?;
    }
    tracing::info!(
        tool_count = registry.len(),
        tools = ?registry.iter().map(|t| t.name()).collect::<Vec<_>>(),
        "tool registry built"
    );
    Ok(registry)
}

async fn build_store(cfg: &StoreConfig) -> Result<Arc<dyn MessageStore>> {
    match cfg.backend {
        StoreBackend::Memory => {
            tracing::warn!("using in-memory message store; history is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            let path = cfg.sqlite_path();
            let store = SqliteStore::open(&path)
                .await
                .map_err(|e| anyhow::anyhow!("open message store {}: {e}", path.display()))?;
            tracing::info!(path = %store.path().display(), "sqlite message store opened");
            Ok(Arc::new(store))
        }
    }
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
