//! Health probes and the metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::Serialize;
use sqlx::PgPool;

use bookshop_shared::{database, metrics, redis as fast_store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: HealthStatus,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub service_name: &'static str,
    pub components: Vec<ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

pub struct HealthChecker {
    pool: PgPool,
    redis: ConnectionManager,
}

impl HealthChecker {
    pub fn new(pool: PgPool, redis: ConnectionManager) -> Self {
        Self { pool, redis }
    }

    async fn check_database(&self) -> ComponentHealth {
        match database::health_check(&self.pool).await {
            Ok(true) => healthy("database"),
            Ok(false) => unhealthy("database", "unexpected health query result".into()),
            Err(e) => unhealthy("database", e.to_string()),
        }
    }

    async fn check_redis(&self) -> ComponentHealth {
        match fast_store::health_check(&self.redis).await {
            Ok(true) => healthy("redis"),
            Ok(false) => unhealthy("redis", "unexpected ping reply".into()),
            Err(e) => unhealthy("redis", e.to_string()),
        }
    }

    pub async fn check_health(&self) -> HealthResponse {
        let components = vec![self.check_database().await, self.check_redis().await];
        let status = if components
            .iter()
            .all(|c| c.status == HealthStatus::Healthy)
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthResponse {
            status,
            service_name: "bookshop-server",
            components,
            timestamp: Utc::now(),
        }
    }
}

fn healthy(name: &'static str) -> ComponentHealth {
    ComponentHealth {
        name,
        status: HealthStatus::Healthy,
        message: None,
    }
}

fn unhealthy(name: &'static str, message: String) -> ComponentHealth {
    tracing::error!(component = name, %message, "health check failed");
    ComponentHealth {
        name,
        status: HealthStatus::Unhealthy,
        message: Some(message),
    }
}

async fn health_handler(State(checker): State<Arc<HealthChecker>>) -> Json<HealthResponse> {
    Json(checker.check_health().await)
}

async fn liveness_handler() -> &'static str {
    "ok"
}

async fn metrics_handler() -> String {
    metrics::collect_metrics()
}

pub fn monitoring_routes(checker: Arc<HealthChecker>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/live", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(checker)
}
