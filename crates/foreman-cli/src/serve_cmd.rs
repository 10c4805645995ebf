//! `foreman serve`: runs the queue processor (C5) and orphan monitor (C6)
//! as leader-gated background tasks (C7), behind a small `axum` admin API
//! for agent and queue introspection (spec.md §6).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use foreman_core::breaker::CircuitBreaker;
use foreman_core::dispatch::{self, Build, DispatchConfig, DispatchOutcome};
use foreman_core::leader::{self, LeaderConfig};
use foreman_core::orphan::{self, OrphanMonitorConfig, OrphanMonitorDeps};
use foreman_core::processor::{self, ProcessorConfig, ProcessorDeps};
use foreman_core::queue::BuildQueue;
use foreman_core::registry::{AgentRegistry, RegisterRequest, ResourceRequest};
use foreman_core::strategy::{self, SchedulingStrategy};
use foreman_core::transport::TransportPool;
use foreman_db::SystemInfo;

use crate::config::ForemanConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }

    fn bad_request_from(err: anyhow::Error) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    registry: Arc<AgentRegistry>,
    queue: Arc<BuildQueue>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<TransportPool>,
    strategy: Arc<dyn SchedulingStrategy>,
    dispatch_config: DispatchConfig,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterBody {
    name: Option<String>,
    url: String,
    #[serde(default)]
    labels: Vec<String>,
    max_builds: Option<i32>,
    system_info: Option<SystemInfo>,
    region: Option<String>,
    org_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatBody {
    current_builds: Option<i32>,
    system_info: Option<SystemInfo>,
}

#[derive(Debug, Deserialize)]
struct DispatchBody {
    build_id: String,
    job_id: String,
    payload: serde_json::Value,
    #[serde(default)]
    labels: Vec<String>,
    org_id: Option<String>,
    resources: Option<ResourceRequest>,
}

fn dispatch_outcome_json(outcome: DispatchOutcome) -> serde_json::Value {
    match outcome {
        DispatchOutcome::Local => serde_json::json!({ "mode": "local" }),
        DispatchOutcome::Queued { queue_id } => serde_json::json!({ "mode": "queued", "queue_id": queue_id }),
        DispatchOutcome::Remote { agent_id } => serde_json::json!({ "mode": "remote", "agent_id": agent_id }),
        DispatchOutcome::FallbackLocal { reason } => serde_json::json!({ "mode": "fallback_local", "reason": reason }),
        DispatchOutcome::Failed { error } => serde_json::json!({ "mode": "failed", "error": error }),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/agents", get(list_agents).post(register_agent))
        .route("/api/agents/summary", get(agent_summary))
        .route("/api/agents/{id}/heartbeat", post(heartbeat))
        .route("/api/agents/{id}/drain", post(drain))
        .route("/api/agents/{id}", delete(deregister))
        .route("/api/queue/depth", get(queue_depth))
        .route("/api/queue/dead-letter", get(queue_dead_letter))
        .route("/api/dispatch", post(dispatch_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list(None))
}

async fn register_agent(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, AppError> {
    let agent = state
        .registry
        .register(RegisterRequest {
            name: body.name,
            url: body.url,
            labels: body.labels,
            max_builds: body.max_builds,
            system_info: body.system_info,
            org_id: body.org_id,
            region: body.region,
        })
        .await
        .map_err(AppError::bad_request_from)?;
    Ok(Json(agent))
}

async fn agent_summary(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.summary(None))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<HeartbeatBody>,
) -> Result<impl IntoResponse, AppError> {
    if state.registry.heartbeat(id, body.current_builds, body.system_info).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("agent {id} not found")))
    }
}

async fn drain(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, AppError> {
    if state.registry.set_draining(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("agent {id} not found")))
    }
}

async fn deregister(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, AppError> {
    state.registry.deregister(id).await.map_err(AppError::internal)?;
    state.transport.close_pool(id);
    Ok(StatusCode::NO_CONTENT)
}

async fn queue_depth(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let depth = state.queue.depth_pending().await.map_err(AppError::internal)?;
    let oldest_age_ms = state.queue.oldest_pending_age_ms().await.map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "pending": depth, "oldest_pending_age_ms": oldest_age_ms })))
}

async fn queue_dead_letter(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let items = state.queue.dead_letter(100).await.map_err(AppError::internal)?;
    Ok(Json(items))
}

async fn dispatch_handler(
    State(state): State<AppState>,
    Json(body): Json<DispatchBody>,
) -> Result<impl IntoResponse, AppError> {
    let build = Build {
        build_id: body.build_id,
        job_id: body.job_id,
        payload: body.payload,
        labels: body.labels,
        org_id: body.org_id,
        resources: body.resources,
    };

    let outcome = dispatch::dispatch(
        &build,
        &state.dispatch_config,
        &state.registry,
        &state.queue,
        &state.breaker,
        &state.transport,
        state.strategy.as_ref(),
    )
    .await;

    Ok(Json(dispatch_outcome_json(outcome)))
}

// ---------------------------------------------------------------------------
// Background loops: leader-gated queue processor and orphan monitor
// ---------------------------------------------------------------------------

/// Wraps a loop task so leader election can start/stop it on acquire/lose.
struct GatedLoop {
    running: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl GatedLoop {
    fn new() -> Arc<Self> {
        Arc::new(Self { running: Mutex::new(None) })
    }

    fn start(self: &Arc<Self>, spawn: impl FnOnce(CancellationToken) -> JoinHandle<()>) {
        let token = CancellationToken::new();
        let handle = spawn(token.clone());
        *self.running.lock().expect("gated loop mutex poisoned") = Some((handle, token));
    }

    async fn stop(self: &Arc<Self>) {
        let taken = self.running.lock().expect("gated loop mutex poisoned").take();
        if let Some((handle, token)) = taken {
            token.cancel();
            let _ = handle.await;
        }
    }
}

fn spawn_leader_gated(
    database_url: String,
    service_name: &'static str,
    poll_interval: Duration,
    shutdown: CancellationToken,
    on_start: impl Fn(CancellationToken) -> JoinHandle<()> + Send + Sync + 'static,
) -> JoinHandle<()> {
    let gated = GatedLoop::new();
    let start_gated = gated.clone();
    let stop_gated = gated.clone();
    let on_start = Arc::new(on_start);

    let start_fn = Box::new(move || {
        let gated = start_gated.clone();
        let on_start = on_start.clone();
        Box::pin(async move {
            gated.start(|token| on_start(token));
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    });
    let stop_fn = Box::new(move || {
        let gated = stop_gated.clone();
        Box::pin(async move {
            gated.stop().await;
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    });

    let config = LeaderConfig {
        database_url,
        service_name: service_name.to_string(),
        poll_interval,
    };

    tokio::spawn(leader::run_leader_loop(config, start_fn, stop_fn, shutdown))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(pool: PgPool, config: ForemanConfig, bind: &str, port: u16) -> Result<()> {
    let registry = Arc::new(AgentRegistry::new(Some(pool.clone()), config.heartbeat_timeout));
    registry.rehydrate().await?;

    let queue = Arc::new(BuildQueue::new(pool.clone()));
    let stuck = queue.sweep_stuck_dispatching(chrono::Duration::minutes(30)).await?;
    if stuck > 0 {
        info!(count = stuck, "reclaimed stuck dispatching rows at startup");
    }

    let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_reset));
    let transport = Arc::new(TransportPool::new(
        Duration::from_secs(60),
        config.circuit_breaker_threshold,
        config.auth_token.clone(),
    ));
    let strategy: Arc<dyn SchedulingStrategy> = Arc::from(strategy::strategy_for(config.resource_aware_scheduling));

    let dispatch_config = DispatchConfig {
        distributed_enabled: config.distributed_enabled,
        queue_enabled: config.queue_enabled,
        fallback_local: config.fallback_local,
        max_retries: config.max_retries,
    };

    let state = AppState {
        registry: registry.clone(),
        queue: queue.clone(),
        breaker: breaker.clone(),
        transport: transport.clone(),
        strategy: strategy.clone(),
        dispatch_config,
    };

    let shutdown = CancellationToken::new();

    let processor_deps = Arc::new(ProcessorDeps {
        queue: queue.clone(),
        registry: registry.clone(),
        breaker: breaker.clone(),
        transport: transport.clone(),
        strategy: strategy.clone(),
    });
    let processor_config = ProcessorConfig {
        base_poll: Duration::from_millis(500),
        max_idle: Duration::from_secs(5),
        retry_backoff_base_ms: config.retry_backoff_ms,
        retry_backoff_max_ms: config.max_retry_backoff_ms,
        circuit_breaker_threshold: config.circuit_breaker_threshold,
    };
    let processor_leader = spawn_leader_gated(
        config.db_config.database_url.clone(),
        "queue-processor",
        Duration::from_millis(500),
        shutdown.clone(),
        move |token| {
            let deps = processor_deps.clone();
            let cfg = processor_config.clone();
            tokio::spawn(processor::run_processor(deps, cfg, token))
        },
    );

    let orphan_deps = Arc::new(OrphanMonitorDeps {
        queue: queue.clone(),
        registry: registry.clone(),
        breaker: breaker.clone(),
    });
    let orphan_config = OrphanMonitorConfig {
        interval: config.orphan_check_interval,
    };
    let orphan_leader = spawn_leader_gated(
        config.db_config.database_url.clone(),
        "orphan-monitor",
        Duration::from_millis(500),
        shutdown.clone(),
        move |token| {
            let deps = orphan_deps.clone();
            let cfg = orphan_config;
            tokio::spawn(orphan::run_orphan_monitor(deps, cfg, token))
        },
    );

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, "foreman serve listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("foreman serve shutting down");
    shutdown.cancel();
    let _ = processor_leader.await;
    let _ = orphan_leader.await;
    transport.close_all();
    info!("foreman serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use foreman_test_utils::{create_test_db, drop_test_db};

    use super::*;

    fn state(pool: sqlx::PgPool) -> AppState {
        AppState {
            registry: Arc::new(AgentRegistry::new(Some(pool.clone()), chrono::Duration::milliseconds(90_000))),
            queue: Arc::new(BuildQueue::new(pool.clone())),
            breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(60))),
            transport: Arc::new(TransportPool::new(Duration::from_secs(60), 3, None)),
            strategy: Arc::from(strategy::strategy_for(false)),
            dispatch_config: DispatchConfig {
                distributed_enabled: false,
                queue_enabled: false,
                fallback_local: true,
                max_retries: 3,
            },
        }
    }

    #[tokio::test]
    async fn test_agent_summary_empty() {
        let (pool, db_name) = create_test_db().await;
        let app = build_router(state(pool.clone()));

        let resp = app
            .oneshot(Request::builder().uri("/api/agents/summary").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_register_then_list() {
        let (pool, db_name) = create_test_db().await;
        let app = build_router(state(pool.clone()));

        let body = serde_json::json!({ "url": "http://agent-1:9000", "labels": ["linux"] });
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/agents")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::builder().uri("/api/agents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
        let agents: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(agents.len(), 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_agent_is_not_found() {
        let (pool, db_name) = create_test_db().await;
        let app = build_router(state(pool.clone()));

        let random_id = uuid::Uuid::new_v4();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/agents/{random_id}/heartbeat"))
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_queue_depth_empty() {
        let (pool, db_name) = create_test_db().await;
        let app = build_router(state(pool.clone()));

        let resp = app
            .oneshot(Request::builder().uri("/api/queue/depth").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["pending"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_dispatch_local_when_distribution_disabled() {
        let (pool, db_name) = create_test_db().await;
        let app = build_router(state(pool.clone()));

        let body = serde_json::json!({ "build_id": "b1", "job_id": "j1", "payload": {} });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/dispatch")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["mode"], "local");

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
