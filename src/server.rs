use crate::config::{Config, SchedulerConfig};
use crate::core::instance::{InstanceError, InstanceOptions};
use crate::core::probe::NvmlProbe;
use crate::core::registry::{RegistryError, SchedulerRegistry};
use crate::core::worker::LogRouter;
use crate::core::Mode;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Shared state behind every handler: the registry plus the config
/// files schedulers are started from.
pub struct AppState {
    pub registry: SchedulerRegistry,
    pub scheduler_configs: Vec<PathBuf>,
    pub log_router: Arc<dyn LogRouter>,
}

pub type SharedState = Arc<AppState>;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let options = InstanceOptions::default();
    let log_router = options.log_router.clone();
    let state = Arc::new(AppState {
        registry: SchedulerRegistry::new(Arc::new(NvmlProbe::new()), options),
        scheduler_configs: config.daemon.scheduler_configs.clone(),
        log_router,
    });

    let app = router(state.clone());
    let addr = format!("{}:{}", config.daemon.host, config.daemon.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on: {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Children of live schedulers must not outlive the daemon.
    state.registry.stop_all().await;
    Ok(())
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(|| async { "gpuq scheduler daemon" }))
        .route("/schedulers", get(list_schedulers).post(start_scheduler))
        .route("/schedulers/{mode}/{index}", get(get_scheduler))
        .route("/schedulers/{mode}/{index}/stop", post(stop_scheduler))
        .route(
            "/schedulers/{mode}/{index}/queues/{queue}/processes/{process}/log",
            get(tail_bound_log),
        )
        .with_state(state)
}

async fn list_schedulers(State(state): State<SharedState>) -> impl IntoResponse {
    let snapshots = state.registry.list().await;
    (StatusCode::OK, Json(snapshots))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    mode: Mode,
    config_index: u32,
}

async fn start_scheduler(
    State(state): State<SharedState>,
    Json(request): Json<StartRequest>,
) -> impl IntoResponse {
    let Some(config_path) = state.scheduler_configs.get(request.config_index as usize)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("no scheduler config with index {}", request.config_index)
            })),
        );
    };

    let config = match SchedulerConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("malformed config: {e}") })),
            );
        }
    };

    match state
        .registry
        .start(request.mode, request.config_index, config)
        .await
    {
        Ok(receipt) => (
            StatusCode::CREATED,
            Json(serde_json::to_value(receipt).unwrap_or_default()),
        ),
        Err(e) => {
            let status = registry_status(&e);
            (status, Json(serde_json::json!({ "error": e.to_string() })))
        }
    }
}

async fn get_scheduler(
    State(state): State<SharedState>,
    Path((mode, index)): Path<(String, u32)>,
) -> impl IntoResponse {
    let Ok(mode) = Mode::from_str(&mode) else {
        return (StatusCode::BAD_REQUEST, Json(None));
    };
    match state.registry.get(mode, index).await {
        Some(snapshot) => (StatusCode::OK, Json(Some(snapshot))),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

async fn stop_scheduler(
    State(state): State<SharedState>,
    Path((mode, index)): Path<(String, u32)>,
) -> impl IntoResponse {
    let Ok(mode) = Mode::from_str(&mode) else {
        return (StatusCode::BAD_REQUEST, Json(()));
    };
    tracing::info!("Stopping scheduler {mode}/{index}");
    match state.registry.stop(mode, index).await {
        Ok(()) => (StatusCode::OK, Json(())),
        Err(e) => (registry_status(&e), Json(())),
    }
}

#[derive(Debug, Deserialize)]
struct TailParams {
    #[serde(default = "default_tail_lines")]
    lines: usize,
}

fn default_tail_lines() -> usize {
    100
}

async fn tail_bound_log(
    State(state): State<SharedState>,
    Path((mode, index, queue, process)): Path<(String, u32, u32, usize)>,
    Query(params): Query<TailParams>,
) -> impl IntoResponse {
    let Ok(mode) = Mode::from_str(&mode) else {
        return (StatusCode::BAD_REQUEST, String::new());
    };
    let Some(path) = state.log_router.bind(mode, index, queue, process) else {
        return (StatusCode::NOT_FOUND, String::new());
    };
    match tail_file(&path, params.lines) {
        Ok(tail) => (StatusCode::OK, tail),
        Err(e) => (StatusCode::NOT_FOUND, format!("cannot read log: {e}")),
    }
}

fn registry_status(error: &RegistryError) -> StatusCode {
    match error {
        RegistryError::Busy(_) => StatusCode::CONFLICT,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Start(InstanceError::ProbeUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::Start(_) => StatusCode::BAD_REQUEST,
    }
}

fn tail_file(path: &std::path::Path, lines: usize) -> std::io::Result<String> {
    let content = std::fs::read_to_string(path)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}
