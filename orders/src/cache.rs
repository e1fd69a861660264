//! Write-through order detail cache. Staleness is bounded by the TTL, and
//! every status write invalidates the entry, so reads tolerate best-effort
//! failures: a broken cache degrades to the durable store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::models::Order;

pub fn detail_key(order_id: i64) -> String {
    format!("order:detail:{order_id}")
}

#[async_trait]
pub trait DetailCache: Send + Sync {
    async fn get(&self, order_id: i64) -> Option<Order>;

    async fn put(&self, order: &Order);

    async fn evict(&self, order_id: i64);
}

pub struct RedisDetailCache {
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl RedisDetailCache {
    pub fn new(redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self { redis, ttl_secs }
    }
}

#[async_trait]
impl DetailCache for RedisDetailCache {
    async fn get(&self, order_id: i64) -> Option<Order> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = match conn.get(detail_key(order_id)).await {
            Ok(value) => value,
            Err(e) => {
                debug!(order_id, error = %e, "order cache read failed");
                return None;
            }
        };
        raw.and_then(|json| serde_json::from_str(&json).ok())
    }

    async fn put(&self, order: &Order) {
        let Ok(json) = serde_json::to_string(order) else {
            return;
        };
        let mut conn = self.redis.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(detail_key(order.id), json, self.ttl_secs)
            .await
        {
            debug!(order_id = order.id, error = %e, "order cache write failed");
        }
    }

    async fn evict(&self, order_id: i64) {
        let mut conn = self.redis.clone();
        if let Err(e) = conn.del::<_, ()>(detail_key(order_id)).await {
            debug!(order_id, error = %e, "order cache eviction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_key_layout() {
        assert_eq!(detail_key(41002), "order:detail:41002");
    }
}
