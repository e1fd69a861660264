//! Durable store connection pool.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Create the Postgres pool from configuration.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout));

    if let Some(idle_timeout) = config.idle_timeout {
        options = options.idle_timeout(Duration::from_secs(idle_timeout));
    }

    if let Some(max_lifetime) = config.max_lifetime {
        options = options.max_lifetime(Duration::from_secs(max_lifetime));
    }

    let pool = options.connect(&config.url).await?;
    info!(
        max_connections = config.max_connections,
        "database connection pool created"
    );
    Ok(pool)
}

/// Execute a health check query
pub async fn health_check(pool: &PgPool) -> Result<bool> {
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
    Ok(row.0 == 1)
}
