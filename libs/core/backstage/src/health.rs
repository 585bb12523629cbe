//! Health endpoints and dead-letter admin API
//!
//! Provides K8s-ready health probes plus operator endpoints for queue
//! statistics and dead-letter management.

use crate::dlq::{DeadLetterEntry, DeadLetterQueue};
use crate::inspect::Inspector;
use crate::keys::KeySpace;
use crate::message::Priority;
use crate::metrics::render_metrics;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Shared state for the health and admin endpoints.
#[derive(Clone)]
pub struct HealthState {
    redis: ConnectionManager,
    keys: KeySpace,
    app_name: &'static str,
    app_version: &'static str,
}

impl HealthState {
    pub fn new(
        redis: ConnectionManager,
        keys: KeySpace,
        app_name: &'static str,
        app_version: &'static str,
    ) -> Self {
        Self {
            redis,
            keys,
            app_name,
            app_version,
        }
    }

    fn dlq(&self) -> DeadLetterQueue {
        DeadLetterQueue::new(self.redis.clone(), self.keys.clone())
    }

    fn inspector(&self) -> Inspector {
        Inspector::new(self.redis.clone(), self.keys.clone())
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    app: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    redis: &'static str,
}

/// Create the health router.
///
/// Endpoints:
/// - `GET /health`, `/healthz` - Liveness probe
/// - `GET /ready`, `/readyz` - Readiness probe (checks Redis)
/// - `GET /queues/stats` - Queue statistics
/// - `GET /metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/healthz", get(liveness))
        .route("/ready", get(readiness))
        .route("/readyz", get(readiness))
        .route("/queues/stats", get(queue_stats))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Create the full admin router: health endpoints plus dead-letter
/// management per priority tier.
///
/// - `GET /admin/dead-letter/{priority}/entries` - List entries
/// - `GET /admin/dead-letter/{priority}/entries/{id}` - Get one entry
/// - `DELETE /admin/dead-letter/{priority}/entries/{id}` - Delete entry
/// - `POST /admin/dead-letter/{priority}/requeue/{id}` - Requeue entry
/// - `DELETE /admin/dead-letter/{priority}/purge` - Purge the tier
pub fn full_admin_router(state: HealthState) -> Router {
    health_router(state.clone()).merge(
        Router::new()
            .route("/admin/dead-letter/{priority}/entries", get(dlq_list))
            .route(
                "/admin/dead-letter/{priority}/entries/{id}",
                get(dlq_get).delete(dlq_delete),
            )
            .route("/admin/dead-letter/{priority}/requeue/{id}", post(dlq_requeue))
            .route("/admin/dead-letter/{priority}/purge", delete(dlq_purge))
            .with_state(state),
    )
}

async fn liveness(State(state): State<HealthState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        app: state.app_name,
        version: state.app_version,
    })
}

async fn readiness(State(state): State<HealthState>) -> impl IntoResponse {
    let mut conn = state.redis.clone();

    let redis_ok = redis::cmd("PING")
        .query_async::<String>(&mut conn)
        .await
        .is_ok();

    if redis_ok {
        (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                redis: "connected",
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                redis: "disconnected",
            }),
        )
    }
}

async fn queue_stats(State(state): State<HealthState>) -> impl IntoResponse {
    match state.inspector().snapshot(&[]).await {
        Ok(snapshot) => (StatusCode::OK, Json(Some(snapshot))),
        Err(e) => {
            error!(error = %e, "Failed to snapshot queues");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(None))
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        render_metrics(),
    )
}

fn parse_priority(raw: &str) -> Result<Priority, StatusCode> {
    raw.parse().map_err(|_| StatusCode::BAD_REQUEST)
}

#[derive(Deserialize)]
struct DlqListQuery {
    count: Option<usize>,
    offset: Option<String>,
}

async fn dlq_list(
    State(state): State<HealthState>,
    Path(priority): Path<String>,
    Query(query): Query<DlqListQuery>,
) -> Result<Json<Vec<DeadLetterEntry>>, StatusCode> {
    let priority = parse_priority(&priority)?;
    let count = query.count.unwrap_or(20);

    state
        .dlq()
        .list(priority, count, query.offset.as_deref())
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "Failed to list dead-letter entries");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn dlq_get(
    State(state): State<HealthState>,
    Path((priority, id)): Path<(String, String)>,
) -> Result<Json<DeadLetterEntry>, StatusCode> {
    let priority = parse_priority(&priority)?;

    match state.dlq().get(priority, &id).await {
        Ok(Some(entry)) => Ok(Json(entry)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(error = %e, "Failed to get dead-letter entry");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn dlq_delete(
    State(state): State<HealthState>,
    Path((priority, id)): Path<(String, String)>,
) -> Result<StatusCode, StatusCode> {
    let priority = parse_priority(&priority)?;

    match state.dlq().delete(priority, &id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(error = %e, "Failed to delete dead-letter entry");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Serialize)]
struct RequeueResponse {
    new_id: String,
}

async fn dlq_requeue(
    State(state): State<HealthState>,
    Path((priority, id)): Path<(String, String)>,
) -> Result<Json<RequeueResponse>, StatusCode> {
    let priority = parse_priority(&priority)?;

    match state.dlq().requeue(priority, &id).await {
        Ok(Some(new_id)) => Ok(Json(RequeueResponse { new_id })),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(error = %e, "Failed to requeue dead-letter entry");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Serialize)]
struct PurgeResponse {
    deleted_count: i64,
}

async fn dlq_purge(
    State(state): State<HealthState>,
    Path(priority): Path<String>,
) -> Result<Json<PurgeResponse>, StatusCode> {
    let priority = parse_priority(&priority)?;

    state
        .dlq()
        .purge(priority)
        .await
        .map(|deleted_count| Json(PurgeResponse { deleted_count }))
        .map_err(|e| {
            error!(error = %e, "Failed to purge dead-letter stream");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
