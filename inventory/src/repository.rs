//! Durable stock repository: row-locked mutations with an audit-log append
//! in the same transaction.

use sqlx::{PgPool, Postgres, Transaction};

use bookshop_shared::context::RequestContext;
use bookshop_shared::error::{Error, Result};

use crate::models::{ChangeKind, StockRecord};

#[derive(Clone)]
pub struct StockRepository {
    pool: PgPool,
}

impl StockRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, ctx: &RequestContext, book_id: i64) -> Result<Option<StockRecord>> {
        let record = ctx
            .bound(async {
                sqlx::query_as::<_, StockRecord>(
                    "SELECT book_id, available, reserved, total, created_at, updated_at
                     FROM inventory WHERE book_id = $1",
                )
                .bind(book_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::from)
            })
            .await?;
        Ok(record)
    }

    /// Every known stock record; drives the startup warm-up.
    pub async fn list_all(&self, ctx: &RequestContext) -> Result<Vec<StockRecord>> {
        ctx.bound(async {
            sqlx::query_as::<_, StockRecord>(
                "SELECT book_id, available, reserved, total, created_at, updated_at
                 FROM inventory ORDER BY book_id",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await
    }

    /// Create the stock record when a catalog item is published. Records are
    /// never deleted.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        available: i32,
    ) -> Result<StockRecord> {
        if available < 0 {
            return Err(Error::InvalidArgument("initial stock must be >= 0".into()));
        }
        ctx.bound(async {
            sqlx::query_as::<_, StockRecord>(
                "INSERT INTO inventory (book_id, available, reserved, total, created_at, updated_at)
                 VALUES ($1, $2, 0, $2, NOW(), NOW())
                 ON CONFLICT (book_id) DO NOTHING
                 RETURNING book_id, available, reserved, total, created_at, updated_at",
            )
            .bind(book_id)
            .bind(available)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?
        .ok_or_else(|| Error::Duplicate(format!("stock record for book {book_id}")))
    }

    pub async fn deduct(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        qty: i32,
        order_id: i64,
    ) -> Result<StockRecord> {
        self.mutate(ctx, book_id, ChangeKind::Deduct, -qty, Some(order_id), "order deduct")
            .await
    }

    pub async fn release(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        qty: i32,
        order_id: i64,
    ) -> Result<StockRecord> {
        self.mutate(ctx, book_id, ChangeKind::Release, qty, Some(order_id), "order release")
            .await
    }

    pub async fn restock(&self, ctx: &RequestContext, book_id: i64, qty: i32) -> Result<StockRecord> {
        self.mutate(ctx, book_id, ChangeKind::Restock, qty, None, "restock")
            .await
    }

    /// One local transaction: blocking row lock, reload, validate, apply,
    /// append the log entry, commit. Lock waits are bounded by the request
    /// deadline; conflicts abort the whole transaction and the caller may
    /// retry.
    async fn mutate(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        kind: ChangeKind,
        delta: i32,
        order_id: Option<i64>,
        remark: &str,
    ) -> Result<StockRecord> {
        let mut tx = self.pool.begin().await?;

        let locked = ctx
            .bound(async {
                sqlx::query_as::<_, StockRecord>(
                    "SELECT book_id, available, reserved, total, created_at, updated_at
                     FROM inventory WHERE book_id = $1 FOR UPDATE",
                )
                .bind(book_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::from)
            })
            .await?;

        let record = match locked {
            Some(record) => record,
            // Restock may introduce a book the durable store has not seen.
            None if kind == ChangeKind::Restock => {
                sqlx::query_as::<_, StockRecord>(
                    "INSERT INTO inventory (book_id, available, reserved, total, created_at, updated_at)
                     VALUES ($1, 0, 0, 0, NOW(), NOW())
                     RETURNING book_id, available, reserved, total, created_at, updated_at",
                )
                .bind(book_id)
                .fetch_one(&mut *tx)
                .await?
            }
            None => return Err(Error::ItemNotFound(book_id)),
        };

        let before = record.available;
        let after = before + delta;
        if after < 0 {
            return Err(Error::InsufficientStock { book_id });
        }

        let mut updated = record.clone();
        updated.available = after;
        updated.total = updated.available + updated.reserved;
        updated.check_invariants()?;

        sqlx::query(
            "UPDATE inventory SET available = $1, total = $2, updated_at = NOW()
             WHERE book_id = $3",
        )
        .bind(updated.available)
        .bind(updated.total)
        .bind(book_id)
        .execute(&mut *tx)
        .await?;

        append_log(&mut tx, book_id, kind, delta, before, after, order_id, remark).await?;

        tx.commit().await?;
        Ok(updated)
    }
}

#[allow(clippy::too_many_arguments)]
async fn append_log(
    tx: &mut Transaction<'_, Postgres>,
    book_id: i64,
    kind: ChangeKind,
    delta: i32,
    before: i32,
    after: i32,
    order_id: Option<i64>,
    remark: &str,
) -> Result<()> {
    debug_assert_eq!(after - before, delta);
    sqlx::query(
        "INSERT INTO inventory_logs (book_id, change_kind, delta, before, after, order_id, remark, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())",
    )
    .bind(book_id)
    .bind(kind.as_str())
    .bind(delta)
    .bind(before)
    .bind(after)
    .bind(order_id)
    .bind(remark)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
