//! HTTP API exposed to agents and the (out-of-scope) dashboard.
//!
//! Every handler returns `{ "success": bool, … }` on success or
//! `{ "success": false, "error": "…" }` on failure, per the coordinator's
//! wire contract. `x-api-key` gates register/heartbeat/uptime-reset/
//! uptime-check; every other endpoint is open, matching the protocol's
//! authentication scope exactly.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared::api::{
    endpoints, headers, AgentsResponse, CheckUpdatesQuery, CheckUpdatesResponse, ErrorResponse,
    HeartbeatResponse, ProcessMetricsResponse, RawResultsQuery, RawResultsResponse,
    RegisterRequest, RegisterResponse, ResultsSubmission, SimpleSuccessResponse,
    SubmitResultsResponse, TargetStatusEntry, TargetStatusResponse, TargetStatusSummary,
    TargetWindowUptimeResponse, TargetsResponse, UptimeCheckQuery, UptimeLatencyQuery,
    UptimeResponse,
};
use shared::config::ServerConfig;
use shared::model::AgentStatus;
use shared::utils::{current_timestamp_millis, date_string_local};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::alert::AlertSink;
use crate::config::TargetConfigManager;
use crate::registry::AgentRegistry;
use crate::store::ResultsStore;

const SERVER_ID: &str = "coordinator-1";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub targets: Arc<TargetConfigManager>,
    pub registry: Arc<AgentRegistry>,
    pub store: Arc<ResultsStore>,
    pub alert: Arc<AlertSink>,
    pub start_time: Instant,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(endpoints::REGISTER, post(register))
        .route(endpoints::HEARTBEAT, post(heartbeat))
        .route(endpoints::TARGETS, get(list_targets))
        .route(endpoints::TARGETS_CHECK_UPDATES, get(check_updates))
        .route(endpoints::RESULTS, post(submit_results).get(raw_results))
        .route(endpoints::UPTIME, get(uptime))
        .route(endpoints::LATENCY, get(latency))
        .route(endpoints::TARGET_STATUS, get(target_status))
        .route(endpoints::AGENTS, get(agents))
        .route("/api/targets/{id}/uptime", get(target_window_uptime))
        .route(endpoints::UPTIME_RESET, post(uptime_reset))
        .route(endpoints::UPTIME_CHECK, post(uptime_check))
        .route(endpoints::METRICS, get(metrics))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::UnknownAgent(id) => (StatusCode::NOT_FOUND, format!("unknown agent: {id}")),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

/// Constant-time `x-api-key` check, the way the prior incarnation of this
/// workspace guarded its agent-facing endpoints.
fn validate_api_key(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;

    let provided = headers
        .get(headers::API_KEY)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let ok = provided.len() == expected.len()
        && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()));
    if ok {
        Ok(())
    } else {
        warn!("rejected request with invalid api key");
        Err(ApiError::Unauthorized)
    }
}

fn agent_id_header(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(headers::AGENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::BadRequest("missing x-agent-id header".to_string()))
}

async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    let agent = state.registry.register(&req.name, &req.location).await?;
    Ok(Json(RegisterResponse {
        success: true,
        agent_id: agent.id.clone(),
        server_id: SERVER_ID.to_string(),
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    let agent_id = agent_id_header(&headers)?;
    if !state.registry.heartbeat(&agent_id).await? {
        return Err(ApiError::UnknownAgent(agent_id));
    }
    Ok(Json(HeartbeatResponse {
        success: true,
        timestamp: current_timestamp_millis(),
    }))
}

async fn list_targets(State(state): State<AppState>) -> Json<TargetsResponse> {
    let (targets, last_updated) = state.targets.list().await;
    Json(TargetsResponse {
        success: true,
        targets,
        last_updated,
    })
}

async fn check_updates(
    State(state): State<AppState>,
    Query(params): Query<CheckUpdatesQuery>,
) -> Json<CheckUpdatesResponse> {
    let has_updates = state.targets.has_changes_since(params.last_checked).await;
    let last_updated = state.targets.last_updated().await;
    Json(CheckUpdatesResponse {
        success: true,
        has_updates,
        last_updated,
    })
}

async fn submit_results(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResultsSubmission>,
) -> Result<Json<SubmitResultsResponse>, ApiError> {
    let agent_id = agent_id_header(&headers)?;
    if !state.registry.contains(&agent_id).await {
        return Err(ApiError::UnknownAgent(agent_id));
    }
    let accepted = state.store.submit(req.results).await?;
    Ok(Json(SubmitResultsResponse {
        success: true,
        accepted,
    }))
}

async fn raw_results(
    State(state): State<AppState>,
    Query(params): Query<RawResultsQuery>,
) -> Json<RawResultsResponse> {
    let results = state
        .store
        .raw_results(
            params.agent_id.as_deref(),
            params.target_id,
            params.date.as_deref(),
        )
        .await;
    Json(RawResultsResponse {
        success: true,
        results,
    })
}

async fn uptime(
    State(state): State<AppState>,
    Query(params): Query<UptimeLatencyQuery>,
) -> Json<UptimeResponse> {
    let date = params.date.unwrap_or_else(|| date_string_local(current_timestamp_millis()));
    let cache_key = format!("{:?}:{date}", params.target_id);
    if let Some(cached) = state.store.uptime_cache.get(&cache_key).await {
        return Json(cached);
    }

    let entries = state.store.uptime_for_date(params.target_id, &date).await;
    let results = entries
        .into_iter()
        .map(|(id, entry)| (id.to_string(), entry))
        .collect();
    let response = UptimeResponse {
        success: true,
        results,
        date,
    };
    state.store.uptime_cache.put(cache_key, response.clone()).await;
    Json(response)
}

async fn latency(
    State(state): State<AppState>,
    Query(params): Query<UptimeLatencyQuery>,
) -> Json<shared::api::LatencyResponse> {
    let cache_key = format!("{:?}:{:?}", params.target_id, params.date);
    if let Some(cached) = state.store.latency_cache.get(&cache_key).await {
        return Json(cached);
    }
    let latency_data = state
        .store
        .latency_series(params.target_id, params.date.as_deref())
        .await;
    let response = shared::api::LatencyResponse {
        success: true,
        latency_data,
    };
    state.store.latency_cache.put(cache_key, response.clone()).await;
    Json(response)
}

async fn target_status(State(state): State<AppState>) -> Json<TargetStatusResponse> {
    let cache_key = "all".to_string();
    if let Some(cached) = state.store.target_status_cache.get(&cache_key).await {
        return Json(cached);
    }

    let statuses = state.store.all_target_statuses().await;
    let mut current_status: Vec<TargetStatusEntry> = statuses
        .iter()
        .map(|(&target_id, status)| TargetStatusEntry {
            target_id,
            is_down: status.is_down,
            last_updated: status.last_updated,
        })
        .collect();
    current_status.sort_by_key(|e| e.target_id);

    let up = current_status.iter().filter(|e| !e.is_down).count();
    let down = current_status.iter().filter(|e| e.is_down).count();

    let response = TargetStatusResponse {
        success: true,
        summary: TargetStatusSummary {
            total: current_status.len(),
            up,
            down,
        },
        current_status,
    };
    state.store.target_status_cache.put(cache_key, response.clone()).await;
    Json(response)
}

async fn agents(State(state): State<AppState>) -> Json<AgentsResponse> {
    Json(AgentsResponse {
        success: true,
        agents: state.registry.list().await,
    })
}

async fn target_window_uptime(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Json<TargetWindowUptimeResponse> {
    let uptime = state.store.uptime_percentages(id).await;
    Json(TargetWindowUptimeResponse {
        success: true,
        uptime,
    })
}

async fn uptime_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SimpleSuccessResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    state.store.reset().await?;
    Ok(Json(SimpleSuccessResponse::ok()))
}

async fn uptime_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UptimeCheckQuery>,
) -> Result<Json<SimpleSuccessResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    state.store.force_reeval(params.target_id).await?;
    Ok(Json(SimpleSuccessResponse::ok()))
}

async fn metrics(State(state): State<AppState>) -> Json<ProcessMetricsResponse> {
    let (targets, _) = state.targets.list().await;
    let agents = state.registry.list().await;
    let online = agents.iter().filter(|a| a.status == AgentStatus::Online).count();
    Json(ProcessMetricsResponse {
        success: true,
        target_count: targets.len(),
        agent_count: agents.len(),
        online_agent_count: online,
        process_uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ServerConfig {
            port: 0,
            api_key: "secret".into(),
            discord_webhook: None,
            data_dir: dir.path().to_path_buf(),
            retention_days: None,
            graceful_shutdown_timeout_seconds: 1,
        });
        let alert = Arc::new(AlertSink::new(None));
        AppState {
            targets: Arc::new(TargetConfigManager::load(config.targets_path()).unwrap()),
            registry: Arc::new(AgentRegistry::load(config.agents_path()).unwrap()),
            store: Arc::new(ResultsStore::load(config.results_path(), Arc::clone(&alert)).unwrap()),
            alert,
            config,
            start_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn register_requires_api_key() {
        let state = test_state().await;
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(endpoints::REGISTER)
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"eu-1","location":"EU"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_then_heartbeat_round_trip() {
        let state = test_state().await;
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(endpoints::REGISTER)
                    .header("content-type", "application/json")
                    .header(headers::API_KEY, "secret")
                    .body(Body::from(r#"{"name":"eu-1","location":"EU"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: RegisterResponse = serde_json::from_slice(&body).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(endpoints::HEARTBEAT)
                    .header(headers::API_KEY, "secret")
                    .header(headers::AGENT_ID, parsed.agent_id.clone())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
