//! Fareline server wiring.
//!
//! Builds the pipeline (store, gateway client, decision client, ledger,
//! queue, locks, sessions, throttle, dispatcher, sweeper), starts the
//! background loops, and mounts the ops HTTP surface.

use crate::clock::{Clock, SystemClock};
use crate::config::FarelineConfig;
use crate::dispatch::{DispatchTuning, Dispatcher};
use crate::ledger::DedupLedger;
use crate::locks::ConversationLocks;
use crate::queue::ConversationQueue;
use crate::routes;
use crate::session::SessionStore;
use crate::stats::PipelineStats;
use crate::sweeper::CleanupSweeper;
use crate::throttle::ResponseThrottle;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request};
use axum::response::Response;
use fl_decision::{DecisionClient, DecisionEngine};
use fl_gateway::{HttpGateway, MessageGateway};
use fl_store::{SqliteStore, Store};
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
    pub dispatcher: Arc<Dispatcher>,
    pub gateway: Arc<dyn MessageGateway>,
    pub sessions: Arc<SessionStore>,
    pub queue: Arc<ConversationQueue>,
    pub stats: Arc<PipelineStats>,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = FarelineConfig::load(config_path).await?;
    let data_dir = cfg.data_dir_path()?;
    tokio::fs::create_dir_all(&data_dir).await?;
    let _store = SqliteStore::open(data_dir.join("fareline.db")).await?;
    tracing::info!(
        gateway_url = %cfg.gateway.base_url,
        gateway_session = %cfg.gateway.session_id,
        engine_url = %cfg.engine.base_url,
        data_dir = %data_dir.display(),
        "config ok"
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = FarelineConfig::load(config_path).await?;
    tracing::info!(
        gateway_url = %cfg.gateway.base_url,
        gateway_session = %cfg.gateway.session_id,
        engine_url = %cfg.engine.base_url,
        poll_interval_ms = cfg.gateway.poll_interval_ms,
        aggregation_window_ms = cfg.pipeline.aggregation_window_ms,
        reply_cooldown_ms = cfg.pipeline.reply_cooldown_ms,
        server_enabled = cfg.server.enabled,
        server_port = cfg.server.port,
        "status ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = FarelineConfig::load(config_path).await?;
    let gateway = build_gateway(&cfg)?;
    gateway.send_text(recipient, message).await?;
    tracing::info!(recipient, "one-shot send completed");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = FarelineConfig::load(config_path).await?;
    let started_at = Instant::now();
    tracing::info!(
        gateway_url = %cfg.gateway.base_url,
        gateway_session = %cfg.gateway.session_id,
        gateway_poll_interval_ms = cfg.gateway.poll_interval_ms,
        gateway_start_from_latest = cfg.gateway.start_from_latest,
        engine_url = %cfg.engine.base_url,
        aggregation_window_ms = cfg.pipeline.aggregation_window_ms,
        reply_cooldown_ms = cfg.pipeline.reply_cooldown_ms,
        duplicate_reply_window_secs = cfg.pipeline.duplicate_reply_window_secs,
        dedup_id_ttl_secs = cfg.pipeline.dedup_id_ttl_secs,
        dedup_fingerprint_ttl_secs = cfg.pipeline.dedup_fingerprint_ttl_secs,
        lock_timeout_secs = cfg.pipeline.lock_timeout_secs,
        session_timeout_secs = cfg.pipeline.session_timeout_secs,
        history_limit = cfg.pipeline.history_limit,
        send_delay_ms = cfg.pipeline.send_delay_ms,
        sweep_interval_secs = cfg.pipeline.sweep_interval_secs,
        server_enabled = cfg.server.enabled,
        server_port = cfg.server.port,
        "server configuration loaded"
    );

    let data_dir = cfg.data_dir_path()?;
    tokio::fs::create_dir_all(&data_dir).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(data_dir.join("fareline.db")).await?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let gateway = build_gateway(&cfg)?;
    let engine: Arc<dyn DecisionEngine> = Arc::new(
        DecisionClient::new(&cfg.engine.base_url)?.with_api_key(cfg.engine.api_key.clone()),
    );

    let ledger = Arc::new(DedupLedger::new(
        clock.clone(),
        store.clone(),
        chrono::Duration::seconds(cfg.pipeline.dedup_id_ttl_secs as i64),
        chrono::Duration::seconds(cfg.pipeline.dedup_fingerprint_ttl_secs as i64),
    ));
    let queue = Arc::new(ConversationQueue::new(
        clock.clone(),
        chrono::Duration::milliseconds(cfg.pipeline.aggregation_window_ms as i64),
    ));
    let locks = Arc::new(ConversationLocks::new(
        clock.clone(),
        chrono::Duration::seconds(cfg.pipeline.lock_timeout_secs as i64),
    ));
    let sessions = Arc::new(SessionStore::new(
        clock.clone(),
        store.clone(),
        chrono::Duration::seconds(cfg.pipeline.session_timeout_secs as i64),
        cfg.pipeline.history_limit,
    ));
    let throttle = Arc::new(ResponseThrottle::new(
        clock.clone(),
        chrono::Duration::milliseconds(cfg.pipeline.reply_cooldown_ms as i64),
        chrono::Duration::seconds(cfg.pipeline.duplicate_reply_window_secs as i64),
    ));
    let stats = Arc::new(PipelineStats::default());

    let tuning = DispatchTuning {
        poll_interval: Duration::from_millis(cfg.gateway.poll_interval_ms),
        fetch_limit: cfg.gateway.fetch_limit,
        start_from_latest: cfg.gateway.start_from_latest,
        send_delay: Duration::from_millis(cfg.pipeline.send_delay_ms),
        drain_interval: Duration::from_millis(cfg.pipeline.drain_interval_ms),
        fallback_reply: cfg.engine.fallback_reply.clone(),
        notify_url: cfg.engine.notify_url.clone(),
    };
    let dispatcher = Arc::new(Dispatcher::new(
        tuning,
        clock.clone(),
        gateway.clone(),
        engine,
        store.clone(),
        ledger.clone(),
        queue.clone(),
        locks.clone(),
        sessions.clone(),
        throttle.clone(),
        stats.clone(),
    ));

    let shutdown = CancellationToken::new();
    let ingest_handle = {
        let dispatcher = dispatcher.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move { dispatcher.run_ingest_loop(token).await })
    };
    let drain_handle = {
        let dispatcher = dispatcher.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move { dispatcher.run_drain_loop(token).await })
    };
    let sweeper = CleanupSweeper::new(
        Duration::from_secs(cfg.pipeline.sweep_interval_secs),
        ledger,
        throttle,
        sessions.clone(),
        locks,
    );
    let sweeper_handle = {
        let token = shutdown.child_token();
        tokio::spawn(async move { sweeper.run(token).await })
    };
    tracing::info!("pipeline loops started");

    if cfg.server.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
        let listener = preflight_bind_listener(addr).await?;

        let state = Arc::new(AppState {
            dispatcher: dispatcher.clone(),
            gateway: gateway.clone(),
            sessions: sessions.clone(),
            queue: queue.clone(),
            stats: stats.clone(),
            started_at,
        });

        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id_from_headers(request.headers())
                )
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
            .layer(TimeoutLayer::new(Duration::from_secs(
                cfg.server.http_timeout_seconds,
            )))
            .layer(trace_layer)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

        tracing::info!(%addr, "fareline serving");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .await?;
        tracing::info!("http server shutdown completed");
    } else {
        tracing::info!("ops server disabled; running pipeline loops only");
        shutdown_signal(shutdown.clone()).await;
    }

    shutdown.cancel();
    for (name, handle) in [
        ("ingest", ingest_handle),
        ("drain", drain_handle),
        ("sweeper", sweeper_handle),
    ] {
        match handle.await {
            Ok(()) => tracing::info!(loop_name = name, "loop shutdown completed"),
            Err(e) => tracing::error!(loop_name = name, error = %e, "loop join failed during shutdown"),
        }
    }

    Ok(())
}

fn build_gateway(cfg: &FarelineConfig) -> Result<Arc<dyn MessageGateway>> {
    Ok(Arc::new(
        HttpGateway::new(&cfg.gateway.base_url, &cfg.gateway.session_id)?
            .with_api_token(cfg.gateway.api_token.clone()),
    ))
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
