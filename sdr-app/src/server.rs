//! SDR agent server.
//!
//! Wires the WhatsApp channel, the governed CRM queue, the message buffer and
//! the follow-up pipeline together and mounts the HTTP routes on top.

use crate::config::SdrConfig;
use crate::conversation::ConversationHandler;
use crate::db::Database;
use crate::followup::{
    BusinessHours, ConversationLog, FollowUpScheduler, FollowUpService, FollowUpWorker,
    MessageAuthor, ScheduleOutcome, ScheduleRequest, SchedulerSettings, SqliteCoordinator,
    SqliteStore, WorkerSettings,
};
use crate::message_buffer::{BufferSettings, MessageBuffer};
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use chrono::{Duration as ChronoDuration, Utc};
use sdr_channels::{
    ChannelAdapter, EvolutionAdapter, OutboundMessage, is_plausible_phone, normalize_phone,
};
use sdr_crm::{
    KommoClient, KommoSettings, OperationQueue, QueueSettings, RateLimitPolicy,
    normalize_stage_name,
};
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

const DATABASE_FILE: &str = "sdr-agent.sqlite3";

pub struct SdrState {
    pub channel: Arc<dyn ChannelAdapter>,
    pub buffer: MessageBuffer,
    pub crm: Option<Arc<OperationQueue>>,
    pub followups: Arc<FollowUpService>,
    pub conversation_log: Arc<dyn ConversationLog>,
    pub scheduler: Option<Arc<FollowUpScheduler>>,
    pub worker: Option<Arc<FollowUpWorker>>,
    pub country_prefix: String,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = SdrConfig::load_with_path(config_path).await?;
    let data_dir = cfg.data_dir()?;
    let db = Database::open(&data_dir.join(DATABASE_FILE)).await?;
    SqliteStore::new(db.clone()).await?;
    SqliteCoordinator::new(db).await?;
    tracing::info!(
        config_path = %path.display(),
        data_dir = %data_dir.display(),
        bind_addr = %cfg.server.bind_addr,
        evolution_configured = !cfg.evolution.base_url.trim().is_empty(),
        kommo_enabled = cfg.kommo.enabled,
        followup_enabled = cfg.followup.enabled,
        buffer_enabled = cfg.buffer.enabled,
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(config_path: Option<PathBuf>, phone: &str, message: &str) -> Result<()> {
    let cfg = SdrConfig::load(config_path).await?;
    let phone = normalize_phone(phone, &cfg.evolution.country_prefix)
        .filter(|p| is_plausible_phone(p))
        .ok_or_else(|| anyhow::anyhow!("invalid phone number: {phone}"))?;
    let channel = build_channel(&cfg)?;
    channel.send(&phone, OutboundMessage::text(message)).await?;

    let db = Database::open(&cfg.data_dir()?.join(DATABASE_FILE)).await?;
    let store = SqliteStore::new(db).await?;
    store
        .append(&phone, MessageAuthor::Agent, message, Utc::now())
        .await?;
    tracing::info!(phone = %phone, "one-shot message sent");
    Ok(())
}

pub async fn schedule_one_shot(
    config_path: Option<PathBuf>,
    request: ScheduleRequest,
) -> Result<()> {
    let cfg = SdrConfig::load(config_path).await?;
    let store = Arc::new(open_store(&cfg).await?);
    let service = build_followup_service(&cfg, store)?;
    match service.schedule(request, Utc::now()).await? {
        ScheduleOutcome::Scheduled { task } => {
            println!(
                "scheduled followup {} for {} at {}",
                task.id, task.target_key, task.scheduled_at
            );
        }
        ScheduleOutcome::Duplicate { existing_id } => {
            println!("duplicate of existing followup {existing_id}; nothing scheduled");
        }
    }
    Ok(())
}

pub async fn cancel_one_shot(config_path: Option<PathBuf>, id: &str) -> Result<()> {
    let cfg = SdrConfig::load(config_path).await?;
    let store = Arc::new(open_store(&cfg).await?);
    let service = build_followup_service(&cfg, store)?;
    if service.cancel(id, "manual").await? {
        println!("cancelled followup {id}");
    } else {
        println!("followup {id} not found or already finished");
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = SdrConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr: SocketAddr = cfg
        .server
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {}: {e}", cfg.server.bind_addr))?;
    let business_hours = format!(
        "{}-{} {}",
        cfg.business_hours.start, cfg.business_hours.end, cfg.business_hours.utc_offset
    );
    tracing::info!(
        config_path = %cfg_path.display(),
        data_dir = %cfg.general.data_dir,
        bind_addr = %addr,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        evolution_instance = %cfg.evolution.instance,
        kommo_enabled = cfg.kommo.enabled,
        rate_limit_budget_per_second = cfg.rate_limit.budget_per_second,
        queue_max_attempts = cfg.queue.max_attempts,
        buffer_enabled = cfg.buffer.enabled,
        buffer_idle_timeout_seconds = cfg.buffer.idle_timeout_seconds,
        buffer_max_fragments = cfg.buffer.max_fragments,
        followup_enabled = cfg.followup.enabled,
        followup_interval_seconds = cfg.followup.scheduler_interval_seconds,
        followup_queue = %cfg.followup.queue_name,
        business_hours = %business_hours,
        forward_configured = cfg.agent.forward_url.is_some(),
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let db = Database::open(&cfg.data_dir()?.join(DATABASE_FILE)).await?;
    let store = Arc::new(SqliteStore::new(db.clone()).await?);
    let coordinator = Arc::new(SqliteCoordinator::new(db).await?);
    let channel = build_channel(&cfg)?;

    let crm = build_crm_queue(&cfg)?;
    if let Some(queue) = crm.as_ref() {
        queue.start().await;
    }

    let followups = Arc::new(build_followup_service(&cfg, store.clone())?);
    let handler = Arc::new(ConversationHandler::new(
        followups.clone(),
        crm.clone(),
        cfg.agent.forward_url.clone(),
        Duration::from_secs(cfg.agent.forward_timeout_seconds.max(1)),
    )?);
    let buffer = MessageBuffer::new(BufferSettings::from_config(&cfg.buffer), handler);

    let (scheduler, worker) = if cfg.followup.enabled {
        let scheduler = Arc::new(FollowUpScheduler::new(
            SchedulerSettings::from_config(&cfg.followup),
            store.clone(),
            store.clone(),
            coordinator.clone(),
        ));
        scheduler.start().await;
        let worker = Arc::new(FollowUpWorker::new(
            WorkerSettings::from_config(&cfg.followup),
            store.clone(),
            store.clone(),
            coordinator.clone(),
            channel.clone(),
            crm.clone(),
        ));
        worker.start().await;
        (Some(scheduler), Some(worker))
    } else {
        tracing::info!("followups disabled; scheduler and worker not started");
        (None, None)
    };

    let state = Arc::new(SdrState {
        channel,
        buffer: buffer.clone(),
        crm: crm.clone(),
        followups,
        conversation_log: store,
        scheduler: scheduler.clone(),
        worker: worker.clone(),
        country_prefix: cfg.evolution.country_prefix.clone(),
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
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let shutdown = CancellationToken::new();
    tracing::info!(%addr, "sdr agent serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    // Buffered conversations still need the CRM queue while they flush.
    buffer.shutdown().await;
    if let Some(scheduler) = scheduler.as_ref() {
        scheduler.shutdown().await;
    }
    if let Some(worker) = worker.as_ref() {
        worker.shutdown().await;
    }
    if let Some(queue) = crm.as_ref() {
        queue.shutdown().await;
    }
    tracing::info!("background components stopped");
    Ok(())
}

fn build_channel(cfg: &SdrConfig) -> Result<Arc<dyn ChannelAdapter>> {
    Ok(Arc::new(EvolutionAdapter::new(
        &cfg.evolution.base_url,
        &cfg.evolution.api_key,
        &cfg.evolution.instance,
    )?))
}

fn build_crm_queue(cfg: &SdrConfig) -> Result<Option<Arc<OperationQueue>>> {
    if !cfg.kommo.enabled {
        tracing::info!("kommo disabled; crm operations unavailable");
        return Ok(None);
    }
    let client = KommoClient::new(KommoSettings {
        base_url: cfg.kommo.base_url.clone(),
        access_token: cfg.kommo.access_token.clone(),
        pipeline_id: cfg.kommo.pipeline_id,
        stage_ids: cfg
            .kommo
            .stage_ids
            .iter()
            .map(|(name, id)| (normalize_stage_name(name), *id))
            .collect(),
        phone_field_id: cfg.kommo.phone_field_id,
        request_timeout: cfg.kommo.request_timeout_seconds.map(Duration::from_secs),
    })?;
    let settings = QueueSettings {
        max_attempts: cfg.queue.max_attempts,
        backoff_ceiling: Duration::from_secs(cfg.queue.backoff_ceiling_seconds),
        result_timeout: Duration::from_secs(cfg.queue.result_timeout_seconds),
        priority_overrides: cfg.queue.priorities.clone(),
        rate_limit: RateLimitPolicy {
            budget_per_second: cfg.rate_limit.budget_per_second,
            throttle_base: Duration::from_secs(cfg.rate_limit.throttle_base_seconds),
            throttle_ceiling: Duration::from_secs(cfg.rate_limit.throttle_ceiling_seconds),
            block_base: Duration::from_secs(cfg.rate_limit.block_base_seconds),
            block_ceiling: Duration::from_secs(cfg.rate_limit.block_ceiling_seconds),
        },
    };
    Ok(Some(Arc::new(OperationQueue::new(Arc::new(client), settings))))
}

async fn open_store(cfg: &SdrConfig) -> Result<SqliteStore> {
    let db = Database::open(&cfg.data_dir()?.join(DATABASE_FILE)).await?;
    SqliteStore::new(db).await
}

fn build_followup_service(cfg: &SdrConfig, store: Arc<SqliteStore>) -> Result<FollowUpService> {
    Ok(FollowUpService::new(
        store,
        BusinessHours::from_config(&cfg.business_hours)?,
        cfg.evolution.country_prefix.clone(),
        ChronoDuration::minutes(cfg.followup.dedup_tolerance_minutes.min(24 * 60) as i64),
        cfg.followup.sequence.clone(),
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
