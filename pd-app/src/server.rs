//! pdfdesk server.
//!
//! Wires the resource guard, operation catalog, job executor and pipeline to
//! the Telegram adapter, and serves the health/status API next to the webhook.

use crate::config::PdfdeskConfig;
use crate::gateway::Gateway;
use crate::pipeline::{Pipeline, PipelineLimits};
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use pd_channels::{ChannelAdapter, TelegramAdapter, TelegramDelivery};
use pd_ops::{ExecutorConfig, JobExecutor, OperationRegistry, ResourceGuard};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const INBOUND_BUFFER: usize = 1024;

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = PdfdeskConfig::load_with_path(config_path).await?;
    let registry = pd_ops::default_registry(&cfg.catalog())?;
    let work_dir = cfg.storage.work_dir()?;
    let delivery = if cfg.telegram.webhook_base.is_some() {
        "webhook"
    } else {
        "polling"
    };
    tracing::info!(
        config_path = %path.display(),
        work_dir = %work_dir.display(),
        bind_addr = %cfg.server.bind_addr,
        delivery,
        bot_token_configured = !cfg.telegram.bot_token.trim().is_empty(),
        max_concurrent_jobs = cfg.limits.max_concurrent_jobs,
        job_timeout_seconds = cfg.limits.job_timeout_seconds,
        max_file_mb = cfg.limits.max_file_mb,
        session_timeout_seconds = cfg.limits.session_timeout_seconds,
        operations = registry.len(),
        "config ok"
    );

    let missing = missing_programs(&registry);
    for (program, operations) in &missing {
        tracing::warn!(
            program = %program,
            operations = ?operations,
            "backend program not found on PATH"
        );
    }
    if missing.is_empty() {
        tracing::info!("all backend programs found");
    }
    Ok(())
}

pub async fn operations(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = PdfdeskConfig::load(config_path).await?;
    let registry = pd_ops::default_registry(&cfg.catalog())?;
    for descriptor in registry.iter() {
        println!(
            "{:<12} {:<24} timeout={}s backend={} ({})",
            descriptor.id.as_str(),
            descriptor.label,
            descriptor.timeout.as_secs(),
            descriptor.backend.name(),
            descriptor.backend.programs().join(", "),
        );
    }
    Ok(())
}

/// Programs each operation needs that are absent from `PATH`, keyed by program.
fn missing_programs(registry: &OperationRegistry) -> HashMap<String, BTreeSet<String>> {
    let mut missing: HashMap<String, BTreeSet<String>> = HashMap::new();
    for descriptor in registry.iter() {
        for program in descriptor.backend.programs() {
            if which::which(&program).is_err() {
                missing
                    .entry(program)
                    .or_default()
                    .insert(descriptor.id.to_string());
            }
        }
    }
    missing
}

pub fn build_pipeline(
    cfg: &PdfdeskConfig,
) -> Result<(Arc<Pipeline>, mpsc::Receiver<crate::pipeline::Dispatch>)> {
    let guard = ResourceGuard::new(cfg.storage.work_dir()?)?;
    let swept = guard.sweep_stale()?;
    tracing::info!(
        work_dir = %guard.work_dir().display(),
        swept,
        "resource guard ready"
    );

    let registry = Arc::new(pd_ops::default_registry(&cfg.catalog())?);
    tracing::info!(
        operations = registry.len(),
        ids = ?registry.iter().map(|d| d.id.to_string()).collect::<Vec<_>>(),
        "operation registry built"
    );
    let executor = JobExecutor::new(
        ExecutorConfig {
            max_concurrent_jobs: cfg.limits.max_concurrent_jobs,
            max_input_bytes: cfg.limits.max_file_bytes(),
        },
        registry,
        guard,
    )?;
    Ok(Pipeline::new(
        executor,
        PipelineLimits {
            max_file_bytes: cfg.limits.max_file_bytes(),
            session_timeout: Duration::from_secs(cfg.limits.session_timeout_seconds),
        },
    ))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = PdfdeskConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    let bot_token = cfg.require_bot_token()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        max_concurrent_jobs = cfg.limits.max_concurrent_jobs,
        job_timeout_seconds = cfg.limits.job_timeout_seconds,
        max_file_mb = cfg.limits.max_file_mb,
        session_timeout_seconds = cfg.limits.session_timeout_seconds,
        webhook = cfg.telegram.webhook_base.is_some(),
        "starting pdfdesk"
    );

    let listener = preflight_bind_listener(addr).await?;
    let (pipeline, completions_rx) = build_pipeline(&cfg)?;

    let delivery = match cfg.telegram.webhook_url() {
        Some(url) => TelegramDelivery::Webhook {
            url,
            secret: cfg.telegram.webhook_secret.clone(),
        },
        None => TelegramDelivery::Polling,
    };
    let telegram = Arc::new(TelegramAdapter::new(bot_token, delivery.clone())?);
    let mut channel_routers = Vec::new();
    if matches!(delivery, TelegramDelivery::Webhook { .. }) {
        channel_routers.push(telegram.clone().webhook_router(&cfg.telegram.webhook_path));
    }

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    channels.insert(telegram.channel_id().to_string(), telegram.clone());
    for (id, adapter) in &channels {
        adapter
            .start(inbound_tx.clone())
            .await
            .map_err(|e| anyhow::anyhow!("start channel {id}: {e}"))?;
        tracing::info!(channel = %id, "channel started");
    }

    let gateway = Arc::new(Gateway::new(
        pipeline.clone(),
        channels.clone(),
        inbound_rx,
        completions_rx,
        Duration::from_secs(cfg.limits.expiry_interval_seconds),
    ));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!(
        channel_count = channels.len(),
        channels = ?channels.keys().collect::<Vec<_>>(),
        "gateway started"
    );

    let state = Arc::new(AppState {
        pipeline: pipeline.clone(),
        started_at,
    });
    let mut app_router = routes::router().layer(Extension(state));
    for plugin_router in channel_routers {
        app_router = app_router.merge(plugin_router);
    }

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

    let app = app_router
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

    tracing::info!(%addr, "pdfdesk serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    pipeline.executor().shutdown();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    let status = pipeline.status();
    tracing::info!(
        sessions = status.sessions,
        live_handles = status.live_handles,
        "pdfdesk stopped"
    );
    Ok(())
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
            _ = shutdown.cancelled() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }

    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_pipeline_uses_configured_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = PdfdeskConfig::default();
        cfg.storage.temp_dir = Some(dir.path().join("work").display().to_string());
        cfg.operations.enable_passthrough = true;

        let (pipeline, _rx) = build_pipeline(&cfg).unwrap();
        assert_eq!(
            pipeline.executor().guard().work_dir(),
            dir.path().join("work")
        );
        assert!(
            pipeline
                .executor()
                .registry()
                .resolve("passthrough")
                .is_ok()
        );
        assert_eq!(pipeline.executor().available_slots(), 6);
    }

    #[test]
    fn request_id_defaults_to_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc".parse().unwrap());
        assert_eq!(request_id_from_headers(&headers), "abc");
    }
}
