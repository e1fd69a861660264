//! Order aggregate persistence.

use async_trait::async_trait;
use sqlx::PgPool;

use bookshop_shared::context::RequestContext;
use bookshop_shared::error::{Error, Result};

use crate::models::{Order, OrderItem, OrderStatus};

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert the order and its items in one transaction.
    async fn insert(&self, ctx: &RequestContext, order: &Order) -> Result<()>;

    /// Load a live (not soft-deleted) order with items preloaded.
    async fn find(&self, ctx: &RequestContext, order_id: i64) -> Result<Option<Order>>;

    async fn list_by_user(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>>;

    /// Compare-and-set status transition. Returns `false` when the order was
    /// not in `from` anymore; concurrent transitions get exactly one winner.
    async fn update_status(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool>;

    async fn soft_delete(&self, ctx: &RequestContext, order_id: i64) -> Result<bool>;
}

#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(
            "SELECT id, order_id, book_id, book_title, quantity, unit_price
             FROM order_items WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, ctx: &RequestContext, order: &Order) -> Result<()> {
        ctx.check()?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO orders (id, order_no, user_id, total, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(order.id)
        .bind(&order.order_no)
        .bind(order.user_id)
        .bind(order.total)
        .bind(order.status)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return Err(Error::Duplicate(format!("order_no {}", order.order_no)));
                }
            }
            return Err(e.into());
        }

        for item in &order.items {
            sqlx::query(
                "INSERT INTO order_items (order_id, book_id, book_title, quantity, unit_price)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(order.id)
            .bind(item.book_id)
            .bind(&item.book_title)
            .bind(item.quantity)
            .bind(item.unit_price)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, ctx: &RequestContext, order_id: i64) -> Result<Option<Order>> {
        let row = ctx
            .bound(async {
                sqlx::query_as::<_, Order>(
                    "SELECT id, order_no, user_id, total, status, created_at, updated_at
                     FROM orders WHERE id = $1 AND deleted_at IS NULL",
                )
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::from)
            })
            .await?;

        let Some(mut order) = row else {
            return Ok(None);
        };
        order.items = self.load_items(order_id).await?;
        Ok(Some(order))
    }

    async fn list_by_user(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>> {
        let rows = ctx
            .bound(async {
                sqlx::query_as::<_, Order>(
                    "SELECT id, order_no, user_id, total, status, created_at, updated_at
                     FROM orders
                     WHERE user_id = $1 AND deleted_at IS NULL
                     ORDER BY created_at DESC
                     LIMIT $2 OFFSET $3",
                )
                .bind(user_id)
                .bind(limit.clamp(1, 100))
                .bind(offset.max(0))
                .fetch_all(&self.pool)
                .await
                .map_err(Error::from)
            })
            .await?;

        let mut orders = Vec::with_capacity(rows.len());
        for mut order in rows {
            order.items = self.load_items(order.id).await?;
            orders.push(order);
        }
        Ok(orders)
    }

    async fn update_status(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool> {
        let result = ctx
            .bound(async {
                sqlx::query(
                    "UPDATE orders SET status = $1, updated_at = NOW()
                     WHERE id = $2 AND status = $3 AND deleted_at IS NULL",
                )
                .bind(to)
                .bind(order_id)
                .bind(from)
                .execute(&self.pool)
                .await
                .map_err(Error::from)
            })
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn soft_delete(&self, ctx: &RequestContext, order_id: i64) -> Result<bool> {
        let result = ctx
            .bound(async {
                sqlx::query(
                    "UPDATE orders SET deleted_at = NOW()
                     WHERE id = $1 AND deleted_at IS NULL",
                )
                .bind(order_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from)
            })
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
