//! HTTP API for health checks, Prometheus metrics and cached usage

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use usage_lib::{
    cache::{CacheKey, Scope, TimeBucketCache},
    clock::Clock,
    format::{byte_converter, format_age},
    health::{ComponentStatus, HealthRegistry},
    observability::UsageMetrics,
    UsageSample,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: UsageMetrics,
    pub cache: TimeBucketCache,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: UsageMetrics,
        cache: TimeBucketCache,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            cache,
            clock,
        }
    }
}

/// One cached snapshot as shown to dashboards
#[derive(Debug, Serialize)]
pub struct UsagePoint {
    pub bucket: u8,
    pub time: String,
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    /// Human readable memory, e.g. "1.5 Gi"
    pub memory: String,
    /// Time since collection, e.g. "4 min"
    pub age: String,
}

impl UsagePoint {
    fn from_sample(bucket: u8, sample: &UsageSample, state: &AppState) -> Self {
        Self {
            bucket,
            time: sample.label.clone(),
            cpu_cores: sample.cpu_cores,
            memory_bytes: sample.memory_bytes,
            memory: byte_converter(i64::try_from(sample.memory_bytes).unwrap_or(i64::MAX)),
            age: format_age(sample.collected_at, state.clock.now()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UsageHistory {
    pub cluster_id: i64,
    pub scope: String,
    pub points: Vec<UsagePoint>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
        }),
    )
        .into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    state
        .metrics
        .set_cache_entries(state.cache.store_backend().len());

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Every live bucket of a scope, oldest first
async fn usage_history(
    State(state): State<Arc<AppState>>,
    Path((cluster_id, scope)): Path<(i64, String)>,
) -> Response {
    let parsed = Scope::from_segment(&scope);
    match state.cache.history(cluster_id, &parsed).await {
        Ok(snapshots) => {
            let points = snapshots
                .iter()
                .map(|(bucket, sample)| UsagePoint::from_sample(*bucket, sample, &state))
                .collect();
            Json(UsageHistory {
                cluster_id,
                scope,
                points,
            })
            .into_response()
        }
        Err(e) => {
            warn!(cluster_id, scope = %scope, error = %e, "Failed to read usage history");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// One bucket of a scope
async fn usage_bucket(
    State(state): State<Arc<AppState>>,
    Path((cluster_id, scope, bucket)): Path<(i64, String, u8)>,
) -> Response {
    if bucket > 59 {
        return error_response(StatusCode::BAD_REQUEST, "bucket must be between 0 and 59");
    }

    let key = CacheKey::new(cluster_id, Scope::from_segment(&scope), bucket);
    match state.cache.get(&key).await {
        Ok(Some(sample)) => Json(UsagePoint::from_sample(bucket, &sample, &state)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("no usage cached for {key}")),
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to read usage snapshot");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/usage/:cluster_id/:scope", get(usage_history))
        .route("/api/v1/usage/:cluster_id/:scope/:bucket", get(usage_bucket))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
