//! rapidfire server.
//!
//! Wires the configured store and dispatcher into a coalescing poller and
//! mounts the HTTP ingress routes on top.

use crate::config::{DispatchMode, RapidfireConfig, StoreBackend};
use crate::dispatch::{HttpDispatcher, LogDispatcher};
use crate::routes;
use anyhow::{Context, Result};
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use rf_batch::{BatchStats, BatchStore, CoalescingPoller, Dispatcher, KeySpace, ReadinessPolicy};
use rf_store::{ExpiringStore, MemoryStore, RedisStore, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub batches: BatchStore,
    pub poller: Arc<CoalescingPoller>,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RapidfireConfig::load_with_path(config_path).await?;
    let store = build_store(&cfg).await?;
    store
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("store ping failed ({}): {e}", store.backend()))?;
    tracing::info!(
        store_backend = %store.backend(),
        dispatch_mode = ?cfg.dispatch.mode,
        max_batch_size = cfg.batch.max_batch_size,
        idle_timeout_ms = cfg.batch.idle_timeout_ms,
        entry_ttl_seconds = cfg.batch.entry_ttl_seconds,
        config_path = ?path.as_ref().map(|p| p.display().to_string()),
        "config ok"
    );
    Ok(())
}

pub async fn stats(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RapidfireConfig::load(config_path).await?;
    warn_if_ephemeral(&cfg, "stats");
    let batches = build_batch_store(&cfg, build_store(&cfg).await?);
    let policy = ReadinessPolicy::new(cfg.batch.max_batch_size, cfg.batch.idle_timeout_millis());
    let stats = BatchStats::collect(&batches, &policy).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

pub async fn enqueue_one_shot(
    config_path: Option<PathBuf>,
    sender: &str,
    text: &str,
    routing_context: serde_json::Value,
    metadata: serde_json::Value,
) -> Result<()> {
    let cfg = RapidfireConfig::load(config_path).await?;
    warn_if_ephemeral(&cfg, "enqueue");
    let batches = build_batch_store(&cfg, build_store(&cfg).await?);
    let receipt = batches
        .enqueue(sender, text, routing_context, metadata)
        .await?;
    tracing::info!(
        sender = %receipt.sender,
        batch_size = receipt.batch_size,
        "one-shot enqueue completed"
    );
    Ok(())
}

pub async fn flush(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RapidfireConfig::load(config_path).await?;
    warn_if_ephemeral(&cfg, "flush");
    let batches = build_batch_store(&cfg, build_store(&cfg).await?);
    let poller = CoalescingPoller::new(
        batches,
        build_dispatcher(&cfg)?,
        cfg.batch.clone(),
        cfg.dispatch_timeout(),
    );
    let report = poller.flush().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failed > 0 || report.errors > 0 {
        return Err(anyhow::anyhow!(
            "flush incomplete: {} dispatch failure(s), {} error(s)",
            report.failed,
            report.errors
        ));
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RapidfireConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = ?path.as_ref().map(|p| p.display().to_string()),
        store_backend = ?cfg.store.backend,
        key_prefix = %cfg.store.key_prefix,
        dispatch_mode = ?cfg.dispatch.mode,
        dispatch_timeout_ms = cfg.dispatch.timeout_ms,
        max_batch_size = cfg.batch.max_batch_size,
        idle_timeout_ms = cfg.batch.idle_timeout_ms,
        entry_ttl_seconds = cfg.batch.entry_ttl_seconds,
        scan_interval_ms = cfg.batch.scan_interval_ms,
        claim_lease_ms = cfg.batch.claim_lease_ms,
        scan_concurrency = cfg.batch.scan_concurrency,
        "rapidfire config loaded"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let store = build_store(&cfg).await?;
    let batches = build_batch_store(&cfg, store);
    let poller = Arc::new(CoalescingPoller::new(
        batches.clone(),
        build_dispatcher(&cfg)?,
        cfg.batch.clone(),
        cfg.dispatch_timeout(),
    ));
    poller.start().await;

    let state = Arc::new(AppState {
        batches,
        poller: poller.clone(),
        started_at: Instant::now(),
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
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "rapidfire serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let signal = shutdown_signal().await;
            tracing::warn!(signal, "beginning graceful shutdown");
        })
        .await?;
    tracing::info!("http server shutdown completed");

    let report = poller.shutdown().await;
    if report.failed > 0 || report.errors > 0 {
        tracing::warn!(
            failed = report.failed,
            errors = report.errors,
            "final flush left batches pending; they remain until their TTL"
        );
    }
    Ok(())
}

async fn build_store(cfg: &RapidfireConfig) -> Result<Arc<dyn ExpiringStore>> {
    match cfg.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&cfg.store.redis_url).await?;
            tracing::info!(redis_url = %store.url(), "redis store connected");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("memory store selected; pending batches do not survive restarts");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_batch_store(cfg: &RapidfireConfig, store: Arc<dyn ExpiringStore>) -> BatchStore {
    BatchStore::new(
        store,
        Arc::new(SystemClock),
        KeySpace::new(cfg.store.key_prefix.trim()),
        &cfg.batch,
    )
}

fn build_dispatcher(cfg: &RapidfireConfig) -> Result<Arc<dyn Dispatcher>> {
    match cfg.dispatch.mode {
        DispatchMode::Http => {
            let url = cfg
                .dispatch
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("dispatch.url is required for http dispatch"))?;
            let dispatcher = HttpDispatcher::new(url, cfg.dispatch_timeout())?
                .with_auth_token(cfg.dispatch.auth_token.clone());
            Ok(Arc::new(dispatcher))
        }
        DispatchMode::Log => {
            tracing::warn!("log dispatcher selected; merged batches are logged, not delivered");
            Ok(Arc::new(LogDispatcher))
        }
    }
}

fn warn_if_ephemeral(cfg: &RapidfireConfig, command: &str) {
    if cfg.store.backend == StoreBackend::Memory {
        tracing::warn!(
            command,
            "memory store is process-local; one-shot commands cannot see a running server's batches"
        );
    }
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

/// Resolves on Ctrl-C or SIGTERM and names the one that arrived.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = terminate.recv() => "SIGTERM",
            },
            Err(error) => {
                tracing::error!(%error, "SIGTERM handler unavailable; waiting for ctrl-c only");
                ctrl_c().await
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> &'static str {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to await ctrl-c");
    }
    "ctrl-c"
}
