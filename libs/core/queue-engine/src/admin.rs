//! Operator HTTP surface: health probes, queue stats, Prometheus metrics,
//! and DLQ administration.

use crate::dlq::DlqManager;
use crate::health::HealthMonitor;
use crate::job::JobClass;
use crate::metrics;
use crate::queue::QueueCore;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use database::redis::{ConnectionHub, UsageClass};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared state for the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub queue: Arc<QueueCore>,
    pub monitor: Arc<HealthMonitor>,
    pub dlq: Arc<DlqManager>,
    pub hub: Arc<ConnectionHub>,
    pub app_name: String,
    pub app_version: String,
}

/// Liveness probe. Always OK while the process serves requests.
pub async fn health_handler(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "name": state.app_name,
        "version": state.app_version,
    }))
}

/// Readiness probe: Redis must answer PING within budget.
pub async fn ready_handler(
    State(state): State<AdminState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let status = state.hub.health_check(UsageClass::QueueBackend).await;
    if status.healthy {
        Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "redis": "ok" },
                "latency_ms": status.latency_ms,
            })),
        ))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {
                    "redis": status.message.unwrap_or_else(|| "unhealthy".to_string())
                },
            })),
        ))
    }
}

/// Queue stats snapshot.
pub async fn queue_stats_handler(
    State(state): State<AdminState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.queue.stats().await {
        Ok(stats) => Ok(Json(json!(stats))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Full health report with recommendations.
pub async fn queue_health_handler(State(state): State<AdminState>) -> Json<Value> {
    Json(json!(state.monitor.get_health().await))
}

/// Prometheus metrics in text exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

fn parse_class(raw: &str) -> Result<JobClass, (StatusCode, Json<Value>)> {
    JobClass::parse(raw).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown job class: {}", raw) })),
        )
    })
}

#[derive(Debug, Deserialize)]
pub struct DlqListParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Deserialize)]
pub struct DlqRequeueParams {
    #[serde(default = "default_limit")]
    pub count: usize,
}

fn default_limit() -> usize {
    10
}

/// `GET /admin/dlq/stats`
pub async fn dlq_stats_handler(
    State(state): State<AdminState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.dlq.stats().await {
        Ok(stats) => Ok(Json(json!(stats))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// `GET /admin/dlq/{class}/messages?limit=10&offset=0`
pub async fn dlq_list_handler(
    State(state): State<AdminState>,
    Path(class): Path<String>,
    Query(params): Query<DlqListParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let class = parse_class(&class)?;
    let limit = params.limit.min(100);

    match state.dlq.list(class, limit, params.offset).await {
        Ok(entries) => {
            let count = entries.len();
            Ok(Json(json!({
                "class": class,
                "entries": entries,
                "limit": limit,
                "offset": params.offset,
                "count": count,
            })))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// `POST /admin/dlq/{class}/requeue/{id}`
pub async fn dlq_requeue_one_handler(
    State(state): State<AdminState>,
    Path((class, id)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let class = parse_class(&class)?;

    match state.dlq.requeue(class, &id).await {
        Ok(true) => Ok(Json(json!({
            "success": true,
            "job_id": id,
        }))),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "job not found in DLQ",
                "job_id": id,
            })),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// `POST /admin/dlq/{class}/requeue?count=10`
pub async fn dlq_requeue_batch_handler(
    State(state): State<AdminState>,
    Path(class): Path<String>,
    Query(params): Query<DlqRequeueParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let class = parse_class(&class)?;
    let count = params.count.min(100);

    match state.dlq.requeue_batch(class, count).await {
        Ok(requeued) => Ok(Json(json!({
            "success": true,
            "requeued": requeued,
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// `DELETE /admin/dlq/{class}/all`
pub async fn dlq_purge_all_handler(
    State(state): State<AdminState>,
    Path(class): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let class = parse_class(&class)?;

    match state.dlq.purge_all(class).await {
        Ok(purged) => Ok(Json(json!({
            "success": true,
            "purged": purged,
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// `DELETE /admin/dlq/{class}/{id}`
pub async fn dlq_purge_one_handler(
    State(state): State<AdminState>,
    Path((class, id)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let class = parse_class(&class)?;

    match state.dlq.purge(class, &id).await {
        Ok(true) => Ok(Json(json!({
            "success": true,
            "job_id": id,
        }))),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "job not found in DLQ",
                "job_id": id,
            })),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// The full admin router: probes, stats, metrics, DLQ management.
pub fn admin_router(state: AdminState) -> axum::Router {
    use axum::routing::{delete, get, post};

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queue/stats", get(queue_stats_handler))
        .route("/queue/health", get(queue_health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/dlq/stats", get(dlq_stats_handler))
        .route("/admin/dlq/{class}/messages", get(dlq_list_handler))
        .route(
            "/admin/dlq/{class}/requeue/{id}",
            post(dlq_requeue_one_handler),
        )
        .route("/admin/dlq/{class}/requeue", post(dlq_requeue_batch_handler))
        .route("/admin/dlq/{class}/all", delete(dlq_purge_all_handler))
        .route("/admin/dlq/{class}/{id}", delete(dlq_purge_one_handler))
        .with_state(state)
}
