//! Inventory service: fast store for admission, durable store for audit.
//!
//! Every write goes through the atomic scripts first; the matching durable
//! mutation runs as a detached background job. A job failure is logged with
//! enough context to replay and never rolls the fast store back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

use bookshop_shared::context::RequestContext;
use bookshop_shared::error::{Error, Result};
use bookshop_shared::metrics;

use crate::repository::StockRepository;
use crate::scripts::{self, DeductOutcome, ReleaseOutcome, StockScripts};

/// Stock operations as the order pipeline sees them. Every write is
/// idempotent per (op, book-id, order-id); callers may retry freely.
#[async_trait]
pub trait StockKeeper: Send + Sync {
    async fn get_stock(&self, ctx: &RequestContext, book_id: i64) -> Result<i64>;

    async fn batch_get_stock(&self, ctx: &RequestContext, book_ids: &[i64]) -> Result<Vec<i64>>;

    /// Returns the remaining stock after the deduction.
    async fn deduct_stock(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        qty: i32,
        order_id: i64,
    ) -> Result<i64>;

    /// Returns the stock after the release.
    async fn release_stock(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        qty: i32,
        order_id: i64,
    ) -> Result<i64>;

    /// Unconditional add; returns the new total.
    async fn restock(&self, ctx: &RequestContext, book_id: i64, qty: i32) -> Result<i64>;
}

#[derive(Clone)]
pub struct InventoryService {
    redis: ConnectionManager,
    scripts: Arc<StockScripts>,
    repo: Arc<StockRepository>,
    durability_timeout: Duration,
}

impl InventoryService {
    pub fn new(redis: ConnectionManager, repo: StockRepository) -> Self {
        Self {
            redis,
            scripts: Arc::new(StockScripts::new()),
            repo: Arc::new(repo),
            durability_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_durability_timeout(mut self, timeout: Duration) -> Self {
        self.durability_timeout = timeout;
        self
    }

    /// Create the stock record when a catalog item is published, then seed
    /// the fast store. Records are never deleted.
    pub async fn create_stock(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        available: i32,
    ) -> Result<crate::models::StockRecord> {
        let record = self.repo.create(ctx, book_id, available).await?;
        self.populate_miss(ctx, book_id, record.available as i64).await;
        info!(book_id, available, "stock record created");
        Ok(record)
    }

    /// Populate the fast store from the durable store for every book whose
    /// fast entry is absent. Recovery reconciles durable -> fast only for
    /// records not yet present; fast remains authoritative for serving.
    pub async fn warm_up(&self, ctx: &RequestContext) -> Result<usize> {
        let records = self.repo.list_all(ctx).await?;
        let mut conn = self.redis.clone();
        let mut populated = 0usize;

        for record in &records {
            ctx.check()?;
            let created: bool = conn
                .set_nx(scripts::stock_key(record.book_id), record.available as i64)
                .await?;
            if created {
                populated += 1;
            }
        }

        info!(
            known = records.len(),
            populated, "inventory warm-up complete"
        );
        Ok(populated)
    }

    /// Miss-populate is best-effort: a racing writer or a fast-store error
    /// never fails the read.
    async fn populate_miss(&self, ctx: &RequestContext, book_id: i64, available: i64) {
        let mut conn = self.redis.clone();
        let outcome: Result<bool> = ctx
            .bound(async {
                conn.set_nx(scripts::stock_key(book_id), available)
                    .await
                    .map_err(Error::from)
            })
            .await;
        if let Err(e) = outcome {
            debug!(book_id, error = %e, "fast-store miss populate failed");
        }
    }

    fn spawn_durable_deduct(&self, ctx: &RequestContext, book_id: i64, qty: i32, order_id: i64) {
        let repo = self.repo.clone();
        let job_ctx = ctx.detach(self.durability_timeout);
        tokio::spawn(async move {
            if let Err(e) = repo.deduct(&job_ctx, book_id, qty, order_id).await {
                metrics::DURABILITY_JOB_FAILURES_TOTAL.inc();
                error!(
                    trace_id = %job_ctx.trace_id(),
                    op = "deduct",
                    book_id,
                    qty,
                    order_id,
                    error = %e,
                    "durable stock write failed; replay with these arguments"
                );
            }
        });
    }

    fn spawn_durable_release(&self, ctx: &RequestContext, book_id: i64, qty: i32, order_id: i64) {
        let repo = self.repo.clone();
        let job_ctx = ctx.detach(self.durability_timeout);
        tokio::spawn(async move {
            if let Err(e) = repo.release(&job_ctx, book_id, qty, order_id).await {
                metrics::DURABILITY_JOB_FAILURES_TOTAL.inc();
                error!(
                    trace_id = %job_ctx.trace_id(),
                    op = "release",
                    book_id,
                    qty,
                    order_id,
                    error = %e,
                    "durable stock write failed; replay with these arguments"
                );
            }
        });
    }

    fn spawn_durable_restock(&self, ctx: &RequestContext, book_id: i64, qty: i32) {
        let repo = self.repo.clone();
        let job_ctx = ctx.detach(self.durability_timeout);
        tokio::spawn(async move {
            if let Err(e) = repo.restock(&job_ctx, book_id, qty).await {
                metrics::DURABILITY_JOB_FAILURES_TOTAL.inc();
                error!(
                    trace_id = %job_ctx.trace_id(),
                    op = "restock",
                    book_id,
                    qty,
                    error = %e,
                    "durable stock write failed; replay with these arguments"
                );
            }
        });
    }
}

fn validate_qty(qty: i32) -> Result<()> {
    if qty <= 0 {
        return Err(Error::InvalidArgument(format!(
            "quantity must be positive, got {qty}"
        )));
    }
    Ok(())
}

#[async_trait]
impl StockKeeper for InventoryService {
    async fn get_stock(&self, ctx: &RequestContext, book_id: i64) -> Result<i64> {
        let mut conn = self.redis.clone();
        let cached: Option<i64> = ctx
            .bound(async {
                conn.get(scripts::stock_key(book_id))
                    .await
                    .map_err(Error::from)
            })
            .await?;

        if let Some(stock) = cached {
            return Ok(stock);
        }

        let record = self
            .repo
            .get(ctx, book_id)
            .await?
            .ok_or(Error::ItemNotFound(book_id))?;
        self.populate_miss(ctx, book_id, record.available as i64).await;
        Ok(record.available as i64)
    }

    async fn batch_get_stock(&self, ctx: &RequestContext, book_ids: &[i64]) -> Result<Vec<i64>> {
        if book_ids.is_empty() {
            return Ok(Vec::new());
        }
        // One MGET round-trip; absent keys read as zero.
        let mut cmd = redis::cmd("MGET");
        for book_id in book_ids {
            cmd.arg(scripts::stock_key(*book_id));
        }
        let mut conn = self.redis.clone();
        let values: Vec<Option<i64>> = ctx
            .bound(async { cmd.query_async(&mut conn).await.map_err(Error::from) })
            .await?;
        Ok(values.into_iter().map(|v| v.unwrap_or(0)).collect())
    }

    async fn deduct_stock(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        qty: i32,
        order_id: i64,
    ) -> Result<i64> {
        validate_qty(qty)?;
        let mut conn = self.redis.clone();
        let outcome = self
            .scripts
            .deduct(ctx, &mut conn, book_id, qty, order_id)
            .await?;

        match outcome {
            DeductOutcome::Done { remaining } => {
                metrics::stock_op("deduct", "ok");
                self.spawn_durable_deduct(ctx, book_id, qty, order_id);
                Ok(remaining)
            }
            DeductOutcome::AlreadyDone { remaining } => {
                metrics::stock_op("deduct", "already_done");
                debug!(book_id, order_id, "deduct already performed");
                Ok(remaining)
            }
            DeductOutcome::Insufficient { remaining } => {
                metrics::stock_op("deduct", "insufficient");
                warn!(book_id, qty, remaining, "insufficient stock");
                Err(Error::InsufficientStock { book_id })
            }
        }
    }

    async fn release_stock(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        qty: i32,
        order_id: i64,
    ) -> Result<i64> {
        validate_qty(qty)?;
        let mut conn = self.redis.clone();
        let outcome = self
            .scripts
            .release(ctx, &mut conn, book_id, qty, order_id)
            .await?;

        match outcome {
            ReleaseOutcome::Done { remaining } => {
                metrics::stock_op("release", "ok");
                self.spawn_durable_release(ctx, book_id, qty, order_id);
                Ok(remaining)
            }
            ReleaseOutcome::AlreadyDone { remaining } => {
                metrics::stock_op("release", "already_done");
                debug!(book_id, order_id, "release already performed");
                Ok(remaining)
            }
            ReleaseOutcome::NotDeducted { remaining } => {
                // No prior deduction for this order: adding stock here would
                // inflate inventory, so the release is refused.
                metrics::stock_op("release", "not_deducted");
                warn!(book_id, order_id, "release without matching deduct refused");
                Ok(remaining)
            }
        }
    }

    async fn restock(&self, ctx: &RequestContext, book_id: i64, qty: i32) -> Result<i64> {
        validate_qty(qty)?;
        let mut conn = self.redis.clone();
        let total = self.scripts.restock(ctx, &mut conn, book_id, qty).await?;
        metrics::stock_op("restock", "ok");
        self.spawn_durable_restock(ctx, book_id, qty);
        Ok(total)
    }
}
