//! Pending-order expiry index: a time-indexed sorted set in the fast store.
//! Member = order id, score = expiry instant in unix seconds. An order id
//! appears at most once; entries for orders that left PENDING are removed on
//! transition.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use bookshop_shared::context::RequestContext;
use bookshop_shared::error::{Error, Result};

pub const PENDING_ZSET_KEY: &str = "order:pending:zset";

#[async_trait]
pub trait ExpiryQueue: Send + Sync {
    async fn schedule(&self, ctx: &RequestContext, order_id: i64, expires_at: i64) -> Result<()>;

    async fn remove(&self, ctx: &RequestContext, order_id: i64) -> Result<()>;

    /// Members with score <= `now`, oldest first, capped at `limit` so one
    /// scan never takes unbounded work.
    async fn due(&self, ctx: &RequestContext, now: i64, limit: usize) -> Result<Vec<i64>>;
}

pub struct RedisExpiryQueue {
    redis: ConnectionManager,
}

impl RedisExpiryQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl ExpiryQueue for RedisExpiryQueue {
    async fn schedule(&self, ctx: &RequestContext, order_id: i64, expires_at: i64) -> Result<()> {
        let mut conn = self.redis.clone();
        ctx.bound(async {
            conn.zadd::<_, _, _, ()>(PENDING_ZSET_KEY, order_id, expires_at)
                .await
                .map_err(Error::from)
        })
        .await
    }

    async fn remove(&self, ctx: &RequestContext, order_id: i64) -> Result<()> {
        let mut conn = self.redis.clone();
        ctx.bound(async {
            conn.zrem::<_, _, ()>(PENDING_ZSET_KEY, order_id)
                .await
                .map_err(Error::from)
        })
        .await
    }

    async fn due(&self, ctx: &RequestContext, now: i64, limit: usize) -> Result<Vec<i64>> {
        let mut conn = self.redis.clone();
        ctx.bound(async {
            conn.zrangebyscore_limit::<_, _, _, Vec<i64>>(
                PENDING_ZSET_KEY,
                "-inf",
                now,
                0,
                limit as isize,
            )
            .await
            .map_err(Error::from)
        })
        .await
    }
}
