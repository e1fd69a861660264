//! Order pipeline: the create-order saga and the order lifecycle operations.
//!
//! Create-order runs four forward steps (catalog lookup, inventory
//! deduction, order persist, expiry scheduling), each external hop guarded
//! by a circuit breaker. A failed forward leaves the system as if the
//! request never happened: completed steps are compensated in reverse, so no
//! order row and no net stock change survive, modulo idempotency marks that
//! expire on their own.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use validator::Validate;

use bookshop_inventory::StockKeeper;
use bookshop_shared::breaker::CircuitBreaker;
use bookshop_shared::clients::{CatalogClient, PaymentClient, PaymentOutcome};
use bookshop_shared::context::RequestContext;
use bookshop_shared::error::{Error, Result};
use bookshop_shared::metrics;
use bookshop_shared::saga::Saga;

use crate::cache::DetailCache;
use crate::models::{
    compute_total, format_minor_units, next_order_id, next_order_no, CreateOrderRequest, Order,
    OrderItem, OrderReceipt, OrderStatus,
};
use crate::pending::ExpiryQueue;
use crate::repository::OrderStore;

#[derive(Debug, Clone)]
pub struct OrderSettings {
    pub payment_timeout: Duration,
    pub max_items_per_order: usize,
    pub max_quantity_per_item: i32,
    pub saga_timeout: Duration,
    pub compensation_timeout: Duration,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            payment_timeout: Duration::from_secs(15 * 60),
            max_items_per_order: 20,
            max_quantity_per_item: 99,
            saga_timeout: Duration::from_secs(30),
            compensation_timeout: Duration::from_secs(10),
        }
    }
}

/// Intermediate values the saga steps share: catalog snapshots, the
/// deductions already made, the computed total.
#[derive(Default)]
struct PipelineState {
    items: Vec<OrderItem>,
    total: i64,
    deducted: Vec<(i64, i32)>,
}

pub struct OrderService {
    store: Arc<dyn OrderStore>,
    stock: Arc<dyn StockKeeper>,
    catalog: Arc<dyn CatalogClient>,
    payment: Arc<dyn PaymentClient>,
    cache: Arc<dyn DetailCache>,
    pending: Arc<dyn ExpiryQueue>,
    catalog_breaker: Arc<CircuitBreaker>,
    inventory_breaker: Arc<CircuitBreaker>,
    payment_breaker: Arc<CircuitBreaker>,
    settings: OrderSettings,
}

impl OrderService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn OrderStore>,
        stock: Arc<dyn StockKeeper>,
        catalog: Arc<dyn CatalogClient>,
        payment: Arc<dyn PaymentClient>,
        cache: Arc<dyn DetailCache>,
        pending: Arc<dyn ExpiryQueue>,
        catalog_breaker: Arc<CircuitBreaker>,
        inventory_breaker: Arc<CircuitBreaker>,
        payment_breaker: Arc<CircuitBreaker>,
        settings: OrderSettings,
    ) -> Self {
        Self {
            store,
            stock,
            catalog,
            payment,
            cache,
            pending,
            catalog_breaker,
            inventory_breaker,
            payment_breaker,
            settings,
        }
    }

    pub async fn create_order(
        &self,
        ctx: &RequestContext,
        request: CreateOrderRequest,
    ) -> Result<OrderReceipt> {
        let timer = metrics::ORDER_CREATE_SECONDS.start_timer();
        self.validate_request(&request)?;

        // The numeric id exists before the first deduction so the inventory
        // idempotency marks carry it; the cancel and expiry flows can then
        // release under the same (book, order) key.
        let order_id = next_order_id();
        let order_no = next_order_no();
        let user_id = request.user_id;
        let state = Arc::new(Mutex::new(PipelineState::default()));

        let saga = Saga::new(
            "create-order",
            self.settings.saga_timeout,
            self.settings.compensation_timeout,
        )
        .step("lookup-catalog", {
            let catalog = self.catalog.clone();
            let breaker = self.catalog_breaker.clone();
            let state = state.clone();
            let lines = request.items.clone();
            move |ctx: RequestContext| {
                let catalog = catalog.clone();
                let breaker = breaker.clone();
                let state = state.clone();
                let lines = lines.clone();
                async move {
                    let mut items = Vec::with_capacity(lines.len());
                    for line in &lines {
                        let book = breaker
                            .call(|| catalog.get_book(&ctx, line.book_id))
                            .await?;
                        items.push(OrderItem {
                            id: 0,
                            order_id,
                            book_id: book.id,
                            book_title: book.title,
                            quantity: line.quantity,
                            unit_price: book.unit_price,
                        });
                    }
                    let total = compute_total(&items);
                    let mut shared = state.lock().expect("pipeline state poisoned");
                    shared.items = items;
                    shared.total = total;
                    Ok(())
                }
            }
        })
        .step_with_compensation(
            "deduct-inventory",
            {
                let stock = self.stock.clone();
                let breaker = self.inventory_breaker.clone();
                let state = state.clone();
                move |ctx: RequestContext| {
                    let stock = stock.clone();
                    let breaker = breaker.clone();
                    let state = state.clone();
                    async move {
                        let lines: Vec<(i64, i32)> = {
                            let shared = state.lock().expect("pipeline state poisoned");
                            shared
                                .items
                                .iter()
                                .map(|item| (item.book_id, item.quantity))
                                .collect()
                        };
                        for (book_id, qty) in lines {
                            breaker
                                .call(|| stock.deduct_stock(&ctx, book_id, qty, order_id))
                                .await?;
                            state
                                .lock()
                                .expect("pipeline state poisoned")
                                .deducted
                                .push((book_id, qty));
                        }
                        Ok(())
                    }
                }
            },
            {
                let stock = self.stock.clone();
                let state = state.clone();
                move |ctx: RequestContext| {
                    let stock = stock.clone();
                    let state = state.clone();
                    async move {
                        let deducted: Vec<(i64, i32)> = state
                            .lock()
                            .expect("pipeline state poisoned")
                            .deducted
                            .clone();
                        let mut first_error = None;
                        // Forward recording order, as the deductions happened.
                        for (book_id, qty) in deducted {
                            if let Err(e) =
                                stock.release_stock(&ctx, book_id, qty, order_id).await
                            {
                                warn!(order_id, book_id, qty, error = %e, "compensating release failed");
                                first_error.get_or_insert(e);
                            }
                        }
                        match first_error {
                            None => Ok(()),
                            Some(e) => Err(e),
                        }
                    }
                }
            },
        )
        .step_with_compensation(
            "persist-order",
            {
                let store = self.store.clone();
                let state = state.clone();
                let order_no = order_no.clone();
                move |ctx: RequestContext| {
                    let store = store.clone();
                    let state = state.clone();
                    let order_no = order_no.clone();
                    async move {
                        let (items, total) = {
                            let shared = state.lock().expect("pipeline state poisoned");
                            (shared.items.clone(), shared.total)
                        };
                        let now = Utc::now();
                        let order = Order {
                            id: order_id,
                            order_no,
                            user_id,
                            total,
                            status: OrderStatus::Pending,
                            created_at: now,
                            updated_at: now,
                            items,
                        };
                        match store.insert(&ctx, &order).await {
                            Ok(()) => Ok(()),
                            Err(e @ Error::Duplicate(_)) => Err(e),
                            Err(Error::DeadlineExceeded) => Err(Error::DeadlineExceeded),
                            Err(e) => Err(Error::OrderPersist(e.to_string())),
                        }
                    }
                }
            },
            {
                let store = self.store.clone();
                let cache = self.cache.clone();
                move |ctx: RequestContext| {
                    let store = store.clone();
                    let cache = cache.clone();
                    async move {
                        let cancelled = store
                            .update_status(&ctx, order_id, OrderStatus::Pending, OrderStatus::Cancelled)
                            .await?;
                        if cancelled {
                            cache.evict(order_id).await;
                            metrics::order_cancelled("compensation");
                        }
                        Ok(())
                    }
                }
            },
        )
        .step_with_compensation(
            "schedule-expiry",
            {
                let pending = self.pending.clone();
                let payment_timeout = self.settings.payment_timeout;
                move |ctx: RequestContext| {
                    let pending = pending.clone();
                    async move {
                        let expires_at =
                            Utc::now().timestamp() + payment_timeout.as_secs() as i64;
                        pending.schedule(&ctx, order_id, expires_at).await
                    }
                }
            },
            {
                let pending = self.pending.clone();
                move |ctx: RequestContext| {
                    let pending = pending.clone();
                    async move { pending.remove(&ctx, order_id).await }
                }
            },
        );

        saga.execute(ctx).await?;

        metrics::ORDERS_CREATED_TOTAL.inc();
        timer.observe_duration();
        let total = state.lock().expect("pipeline state poisoned").total;
        info!(order_id, order_no = %order_no, user_id, total, "order created");

        Ok(OrderReceipt {
            order_id,
            order_no,
            total,
            total_display: format_minor_units(total),
        })
    }

    /// Read through the 5-minute write-through cache; misses load from the
    /// durable store with items preloaded.
    pub async fn get_order(&self, ctx: &RequestContext, order_id: i64) -> Result<Order> {
        ctx.check()?;
        if let Some(order) = self.cache.get(order_id).await {
            return Ok(order);
        }
        let order = self
            .store
            .find(ctx, order_id)
            .await?
            .ok_or(Error::OrderNotFound(order_id))?;
        self.cache.put(&order).await;
        Ok(order)
    }

    pub async fn list_orders(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>> {
        self.store.list_by_user(ctx, user_id, limit, offset).await
    }

    pub async fn cancel_order(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        caller_user_id: i64,
    ) -> Result<()> {
        let order = self
            .store
            .find(ctx, order_id)
            .await?
            .ok_or(Error::OrderNotFound(order_id))?;

        if order.user_id != caller_user_id {
            return Err(Error::PermissionDenied);
        }
        if !order.status.can_transition_to(OrderStatus::Cancelled) {
            return Err(Error::IllegalStateTransition {
                from: order.status.as_str(),
                to: OrderStatus::Cancelled.as_str(),
            });
        }

        // The compare-and-set arbitrates races with the expiry scanner and
        // payment confirmation: exactly one transition wins.
        let won = self
            .store
            .update_status(ctx, order_id, order.status, OrderStatus::Cancelled)
            .await?;
        if !won {
            return Err(Error::IllegalStateTransition {
                from: order.status.as_str(),
                to: OrderStatus::Cancelled.as_str(),
            });
        }

        self.release_items(ctx, &order).await;
        self.remove_pending(ctx, order_id).await;
        self.cache.evict(order_id).await;
        metrics::order_cancelled("user");
        info!(order_id, caller_user_id, "order cancelled");
        Ok(())
    }

    pub async fn confirm_payment(&self, ctx: &RequestContext, order_id: i64) -> Result<()> {
        let order = self
            .store
            .find(ctx, order_id)
            .await?
            .ok_or(Error::OrderNotFound(order_id))?;

        if order.status != OrderStatus::Pending {
            return Err(Error::IllegalStateTransition {
                from: order.status.as_str(),
                to: OrderStatus::Paid.as_str(),
            });
        }

        let outcome = self
            .payment_breaker
            .call(|| self.payment.pay(ctx, order_id, order.total, "mock"))
            .await?;
        if outcome == PaymentOutcome::Failed {
            return Err(Error::Dependency(format!(
                "payment declined for order {order_id}"
            )));
        }

        let won = self
            .store
            .update_status(ctx, order_id, OrderStatus::Pending, OrderStatus::Paid)
            .await?;
        if !won {
            return Err(Error::IllegalStateTransition {
                from: order.status.as_str(),
                to: OrderStatus::Paid.as_str(),
            });
        }

        self.remove_pending(ctx, order_id).await;
        self.cache.evict(order_id).await;
        info!(order_id, total = order.total, "payment confirmed");
        Ok(())
    }

    pub async fn mark_shipped(&self, ctx: &RequestContext, order_id: i64) -> Result<()> {
        self.transition(ctx, order_id, OrderStatus::Paid, OrderStatus::Shipped)
            .await
    }

    pub async fn mark_completed(&self, ctx: &RequestContext, order_id: i64) -> Result<()> {
        self.transition(ctx, order_id, OrderStatus::Shipped, OrderStatus::Completed)
            .await
    }

    pub async fn delete_order(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        caller_user_id: i64,
    ) -> Result<()> {
        let order = self
            .store
            .find(ctx, order_id)
            .await?
            .ok_or(Error::OrderNotFound(order_id))?;
        if order.user_id != caller_user_id {
            return Err(Error::PermissionDenied);
        }
        if !order.status.is_terminal() {
            return Err(Error::InvalidArgument(
                "only completed or cancelled orders can be deleted".into(),
            ));
        }
        self.store.soft_delete(ctx, order_id).await?;
        self.cache.evict(order_id).await;
        Ok(())
    }

    /// One scanner work item: auto-cancel an expired unpaid order and return
    /// its held stock. The pending entry is removed only after the release
    /// attempt, so a crash in between re-processes the order next tick;
    /// releases are idempotent, so that is safe.
    pub async fn expire_order(&self, ctx: &RequestContext, order_id: i64) -> Result<()> {
        let Some(order) = self.store.find(ctx, order_id).await? else {
            self.pending.remove(ctx, order_id).await?;
            return Ok(());
        };

        if order.status != OrderStatus::Pending {
            self.pending.remove(ctx, order_id).await?;
            self.cache.evict(order_id).await;
            return Ok(());
        }

        let won = self
            .store
            .update_status(ctx, order_id, OrderStatus::Pending, OrderStatus::Cancelled)
            .await?;
        if won {
            self.release_items(ctx, &order).await;
            metrics::order_cancelled("expired");
            info!(order_id, order_no = %order.order_no, "unpaid order expired");
        }

        self.pending.remove(ctx, order_id).await?;
        self.cache.evict(order_id).await;
        Ok(())
    }

    fn validate_request(&self, request: &CreateOrderRequest) -> Result<()> {
        if request.user_id <= 0 {
            return Err(Error::InvalidArgument("user id is required".into()));
        }
        request
            .validate()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        if request.items.len() > self.settings.max_items_per_order {
            return Err(Error::InvalidArgument(format!(
                "order exceeds {} items",
                self.settings.max_items_per_order
            )));
        }
        for line in &request.items {
            if line.quantity < 1 || line.quantity > self.settings.max_quantity_per_item {
                return Err(Error::InvalidArgument(format!(
                    "quantity for book {} must be within [1, {}]",
                    line.book_id, self.settings.max_quantity_per_item
                )));
            }
        }
        Ok(())
    }

    async fn transition(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<()> {
        let order = self
            .store
            .find(ctx, order_id)
            .await?
            .ok_or(Error::OrderNotFound(order_id))?;
        if order.status != from || !from.can_transition_to(to) {
            return Err(Error::IllegalStateTransition {
                from: order.status.as_str(),
                to: to.as_str(),
            });
        }
        let won = self.store.update_status(ctx, order_id, from, to).await?;
        if !won {
            return Err(Error::IllegalStateTransition {
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        self.cache.evict(order_id).await;
        Ok(())
    }

    /// Release failures are logged, never propagated: the durable audit
    /// trail plus idempotent retries recover the stock later.
    async fn release_items(&self, ctx: &RequestContext, order: &Order) {
        for item in &order.items {
            if let Err(e) = self
                .stock
                .release_stock(ctx, item.book_id, item.quantity, order.id)
                .await
            {
                warn!(
                    order_id = order.id,
                    book_id = item.book_id,
                    qty = item.quantity,
                    trace_id = %ctx.trace_id(),
                    error = %e,
                    "stock release failed"
                );
            }
        }
    }

    async fn remove_pending(&self, ctx: &RequestContext, order_id: i64) {
        // Best-effort: a leftover entry is skipped by the scanner once the
        // order has left PENDING.
        if let Err(e) = self.pending.remove(ctx, order_id).await {
            warn!(order_id, error = %e, "failed to remove pending-order entry");
        }
    }
}
