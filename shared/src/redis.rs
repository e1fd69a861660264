//! Fast store connection.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::info;

use crate::config::RedisConfig;
use crate::error::{Error, Result};

/// Open a managed fast-store connection. The manager reconnects on broken
/// connections; per-operation time budgets come from the request context.
pub async fn connect(config: &RedisConfig) -> Result<ConnectionManager> {
    let client = redis::Client::open(config.url.as_str())?;
    let dial = Duration::from_secs(config.dial_timeout);

    let manager = tokio::time::timeout(dial, ConnectionManager::new(client))
        .await
        .map_err(|_| Error::DeadlineExceeded)??;

    info!("fast store connected");
    Ok(manager)
}

/// Ping the fast store.
pub async fn health_check(conn: &ConnectionManager) -> Result<bool> {
    let mut conn = conn.clone();
    let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(pong == "PONG")
}
