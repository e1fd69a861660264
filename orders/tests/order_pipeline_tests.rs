//! End-to-end tests for the create-order pipeline, the cancel flows and the
//! expiry scanner, run against in-process fakes of the stores.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;

use bookshop_inventory::StockKeeper;
use bookshop_orders::cache::DetailCache;
use bookshop_orders::pending::ExpiryQueue;
use bookshop_orders::repository::OrderStore;
use bookshop_orders::{
    CreateOrderRequest, ExpiryScanner, Order, OrderLine, OrderService, OrderSettings, OrderStatus,
};
use bookshop_shared::breaker::{BreakerSettings, CircuitBreaker};
use bookshop_shared::clients::{Book, CatalogClient, MockPaymentGateway};
use bookshop_shared::context::RequestContext;
use bookshop_shared::error::{Error, Result};

// ---------------------------------------------------------------------------
// In-memory fakes
// ---------------------------------------------------------------------------

/// Stock fake mirroring the fast-store script semantics: atomic per call,
/// idempotent per (op, book, order) through marks, release refused without a
/// matching deduct.
#[derive(Default)]
struct MemoryStock {
    inner: Mutex<StockState>,
}

#[derive(Default)]
struct StockState {
    stock: HashMap<i64, i64>,
    deduct_marks: HashSet<(i64, i64)>,
    release_marks: HashSet<(i64, i64)>,
    deduct_log: Vec<(i64, i64, i32)>,
    release_log: Vec<(i64, i64, i32)>,
}

impl MemoryStock {
    fn with_stock(entries: &[(i64, i64)]) -> Arc<Self> {
        let fake = Self::default();
        {
            let mut state = fake.inner.lock().unwrap();
            for (book_id, qty) in entries {
                state.stock.insert(*book_id, *qty);
            }
        }
        Arc::new(fake)
    }

    fn available(&self, book_id: i64) -> i64 {
        *self.inner.lock().unwrap().stock.get(&book_id).unwrap_or(&0)
    }

    fn deducts_for(&self, book_id: i64) -> Vec<(i64, i64, i32)> {
        self.inner
            .lock()
            .unwrap()
            .deduct_log
            .iter()
            .filter(|(b, _, _)| *b == book_id)
            .copied()
            .collect()
    }

    fn releases_for(&self, book_id: i64) -> Vec<(i64, i64, i32)> {
        self.inner
            .lock()
            .unwrap()
            .release_log
            .iter()
            .filter(|(b, _, _)| *b == book_id)
            .copied()
            .collect()
    }
}

#[async_trait]
impl StockKeeper for MemoryStock {
    async fn get_stock(&self, ctx: &RequestContext, book_id: i64) -> Result<i64> {
        ctx.check()?;
        Ok(self.available(book_id))
    }

    async fn batch_get_stock(&self, ctx: &RequestContext, book_ids: &[i64]) -> Result<Vec<i64>> {
        ctx.check()?;
        Ok(book_ids.iter().map(|id| self.available(*id)).collect())
    }

    async fn deduct_stock(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        qty: i32,
        order_id: i64,
    ) -> Result<i64> {
        ctx.check()?;
        let mut state = self.inner.lock().unwrap();
        let current = *state.stock.get(&book_id).unwrap_or(&0);
        if state.deduct_marks.contains(&(book_id, order_id)) {
            return Ok(current);
        }
        if current < qty as i64 {
            return Err(Error::InsufficientStock { book_id });
        }
        let remaining = current - qty as i64;
        state.stock.insert(book_id, remaining);
        state.deduct_marks.insert((book_id, order_id));
        state.deduct_log.push((book_id, order_id, qty));
        Ok(remaining)
    }

    async fn release_stock(
        &self,
        ctx: &RequestContext,
        book_id: i64,
        qty: i32,
        order_id: i64,
    ) -> Result<i64> {
        ctx.check()?;
        let mut state = self.inner.lock().unwrap();
        let current = *state.stock.get(&book_id).unwrap_or(&0);
        if state.release_marks.contains(&(book_id, order_id)) {
            return Ok(current);
        }
        if !state.deduct_marks.contains(&(book_id, order_id)) {
            return Ok(current);
        }
        let now = current + qty as i64;
        state.stock.insert(book_id, now);
        state.deduct_marks.remove(&(book_id, order_id));
        state.release_marks.insert((book_id, order_id));
        state.release_log.push((book_id, order_id, qty));
        Ok(now)
    }

    async fn restock(&self, ctx: &RequestContext, book_id: i64, qty: i32) -> Result<i64> {
        ctx.check()?;
        let mut state = self.inner.lock().unwrap();
        let now = *state.stock.get(&book_id).unwrap_or(&0) + qty as i64;
        state.stock.insert(book_id, now);
        Ok(now)
    }
}

#[derive(Default)]
struct MemoryOrderStore {
    orders: Mutex<HashMap<i64, Order>>,
    deleted: Mutex<HashSet<i64>>,
    fail_inserts: AtomicBool,
}

impl MemoryOrderStore {
    fn status_of(&self, order_id: i64) -> Option<OrderStatus> {
        self.orders.lock().unwrap().get(&order_id).map(|o| o.status)
    }

    fn len(&self) -> usize {
        self.orders.lock().unwrap().len()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, ctx: &RequestContext, order: &Order) -> Result<()> {
        ctx.check()?;
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::Internal("simulated storage failure".into()));
        }
        let mut orders = self.orders.lock().unwrap();
        if orders.values().any(|o| o.order_no == order.order_no) {
            return Err(Error::Duplicate(format!("order_no {}", order.order_no)));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find(&self, ctx: &RequestContext, order_id: i64) -> Result<Option<Order>> {
        ctx.check()?;
        if self.deleted.lock().unwrap().contains(&order_id) {
            return Ok(None);
        }
        Ok(self.orders.lock().unwrap().get(&order_id).cloned())
    }

    async fn list_by_user(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>> {
        ctx.check()?;
        let deleted = self.deleted.lock().unwrap().clone();
        let mut orders: Vec<Order> = self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.user_id == user_id && !deleted.contains(&o.id))
            .cloned()
            .collect();
        orders.sort_by_key(|o| std::cmp::Reverse(o.created_at));
        Ok(orders
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update_status(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool> {
        ctx.check()?;
        let mut orders = self.orders.lock().unwrap();
        match orders.get_mut(&order_id) {
            Some(order) if order.status == from => {
                order.status = to;
                order.updated_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn soft_delete(&self, ctx: &RequestContext, order_id: i64) -> Result<bool> {
        ctx.check()?;
        Ok(self.deleted.lock().unwrap().insert(order_id))
    }
}

#[derive(Default)]
struct MemoryCache {
    inner: Mutex<HashMap<i64, Order>>,
}

#[async_trait]
impl DetailCache for MemoryCache {
    async fn get(&self, order_id: i64) -> Option<Order> {
        self.inner.lock().unwrap().get(&order_id).cloned()
    }

    async fn put(&self, order: &Order) {
        self.inner.lock().unwrap().insert(order.id, order.clone());
    }

    async fn evict(&self, order_id: i64) {
        self.inner.lock().unwrap().remove(&order_id);
    }
}

#[derive(Default)]
struct MemoryQueue {
    inner: Mutex<HashMap<i64, i64>>,
}

impl MemoryQueue {
    fn contains(&self, order_id: i64) -> bool {
        self.inner.lock().unwrap().contains_key(&order_id)
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[async_trait]
impl ExpiryQueue for MemoryQueue {
    async fn schedule(&self, ctx: &RequestContext, order_id: i64, expires_at: i64) -> Result<()> {
        ctx.check()?;
        self.inner.lock().unwrap().insert(order_id, expires_at);
        Ok(())
    }

    async fn remove(&self, ctx: &RequestContext, order_id: i64) -> Result<()> {
        ctx.check()?;
        self.inner.lock().unwrap().remove(&order_id);
        Ok(())
    }

    async fn due(&self, ctx: &RequestContext, now: i64, limit: usize) -> Result<Vec<i64>> {
        ctx.check()?;
        let mut due: Vec<(i64, i64)> = self
            .inner
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, score)| **score <= now)
            .map(|(id, score)| (*id, *score))
            .collect();
        due.sort_by_key(|(_, score)| *score);
        Ok(due.into_iter().take(limit).map(|(id, _)| id).collect())
    }
}

struct StaticCatalog {
    books: HashMap<i64, Book>,
}

impl StaticCatalog {
    fn with_books(books: &[(i64, &str, i64)]) -> Arc<Self> {
        Arc::new(Self {
            books: books
                .iter()
                .map(|(id, title, price)| {
                    (
                        *id,
                        Book {
                            id: *id,
                            title: title.to_string(),
                            unit_price: *price,
                            publisher_id: 1,
                        },
                    )
                })
                .collect(),
        })
    }
}

#[async_trait]
impl CatalogClient for StaticCatalog {
    async fn get_book(&self, ctx: &RequestContext, id: i64) -> Result<Book> {
        ctx.check()?;
        self.books.get(&id).cloned().ok_or(Error::ItemNotFound(id))
    }

    async fn batch_get_books(&self, ctx: &RequestContext, ids: &[i64]) -> Result<Vec<Book>> {
        ctx.check()?;
        Ok(ids.iter().filter_map(|id| self.books.get(id).cloned()).collect())
    }
}

mock! {
    Catalog {}

    #[async_trait]
    impl CatalogClient for Catalog {
        async fn get_book(&self, ctx: &RequestContext, id: i64) -> Result<Book>;
        async fn batch_get_books(&self, ctx: &RequestContext, ids: &[i64]) -> Result<Vec<Book>>;
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    stock: Arc<MemoryStock>,
    store: Arc<MemoryOrderStore>,
    cache: Arc<MemoryCache>,
    queue: Arc<MemoryQueue>,
    service: Arc<OrderService>,
}

fn harness(
    catalog: Arc<dyn CatalogClient>,
    stock: Arc<MemoryStock>,
    settings: OrderSettings,
    approve_payments: bool,
) -> Harness {
    let store = Arc::new(MemoryOrderStore::default());
    let cache = Arc::new(MemoryCache::default());
    let queue = Arc::new(MemoryQueue::default());
    let payment = Arc::new(if approve_payments {
        MockPaymentGateway::approve_all()
    } else {
        MockPaymentGateway::new(0.0)
    });

    let service = Arc::new(OrderService::new(
        store.clone(),
        stock.clone(),
        catalog,
        payment,
        cache.clone(),
        queue.clone(),
        Arc::new(CircuitBreaker::new(BreakerSettings::new("catalog"))),
        Arc::new(CircuitBreaker::new(BreakerSettings::new("inventory"))),
        Arc::new(CircuitBreaker::new(BreakerSettings::new("payment"))),
        settings,
    ));

    Harness {
        stock,
        store,
        cache,
        queue,
        service,
    }
}

fn ctx() -> RequestContext {
    RequestContext::new(Duration::from_secs(5))
}

fn order_for(book_id: i64, quantity: i32) -> CreateOrderRequest {
    CreateOrderRequest {
        user_id: 7,
        items: vec![OrderLine { book_id, quantity }],
    }
}

const BOOK: i64 = 11;

fn default_harness(initial_stock: i64) -> Harness {
    harness(
        StaticCatalog::with_books(&[(BOOK, "The Left Hand of Darkness", 1850)]),
        MemoryStock::with_stock(&[(BOOK, initial_stock)]),
        OrderSettings::default(),
        true,
    )
}

// ---------------------------------------------------------------------------
// Create-order pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sequential_sell_through() {
    let h = default_harness(10);

    let first = h.service.create_order(&ctx(), order_for(BOOK, 3)).await.unwrap();
    assert_eq!(h.stock.available(BOOK), 7);
    assert_eq!(first.total, 3 * 1850);
    assert_eq!(first.total_display, "55.50");

    h.service.create_order(&ctx(), order_for(BOOK, 4)).await.unwrap();
    assert_eq!(h.stock.available(BOOK), 3);

    let rejected = h.service.create_order(&ctx(), order_for(BOOK, 5)).await;
    assert!(matches!(
        rejected,
        Err(Error::InsufficientStock { book_id: BOOK })
    ));
    assert_eq!(h.stock.available(BOOK), 3);

    h.service.create_order(&ctx(), order_for(BOOK, 3)).await.unwrap();
    assert_eq!(h.stock.available(BOOK), 0);
    assert_eq!(h.store.len(), 3);
}

#[tokio::test]
async fn test_no_oversell_under_contention() {
    let h = default_harness(10);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let service = h.service.clone();
        handles.push(tokio::spawn(async move {
            service.create_order(&ctx(), order_for(BOOK, 1)).await
        }));
    }

    let mut ok = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(Error::InsufficientStock { book_id }) => {
                assert_eq!(book_id, BOOK);
                insufficient += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(ok, 10);
    assert_eq!(insufficient, 10);
    assert_eq!(h.stock.available(BOOK), 0);
    assert_eq!(h.stock.deducts_for(BOOK).len(), 10);
    assert_eq!(h.store.len(), 10);
}

#[tokio::test]
async fn test_compensation_on_persist_failure() {
    let h = default_harness(5);
    h.store.fail_inserts.store(true, Ordering::SeqCst);

    let result = h.service.create_order(&ctx(), order_for(BOOK, 2)).await;
    assert!(matches!(result, Err(Error::OrderPersist(_))));

    // No order row, stock back where it was.
    assert_eq!(h.store.len(), 0);
    assert_eq!(h.stock.available(BOOK), 5);
    assert_eq!(h.queue.len(), 0);

    // The audit trail shows the deduct and the paired release under the
    // same (book, order) key.
    let deducts = h.stock.deducts_for(BOOK);
    let releases = h.stock.releases_for(BOOK);
    assert_eq!(deducts.len(), 1);
    assert_eq!(releases.len(), 1);
    assert_eq!(deducts[0].1, releases[0].1);
    assert_eq!(deducts[0].2, 2);
    assert_eq!(releases[0].2, 2);
}

#[tokio::test]
async fn test_partial_deduct_rolls_back_on_insufficient_item() {
    const OTHER: i64 = 12;
    let h = harness(
        StaticCatalog::with_books(&[(BOOK, "Dune", 1250), (OTHER, "Hyperion", 999)]),
        MemoryStock::with_stock(&[(BOOK, 10), (OTHER, 1)]),
        OrderSettings::default(),
        true,
    );

    let request = CreateOrderRequest {
        user_id: 7,
        items: vec![
            OrderLine {
                book_id: BOOK,
                quantity: 2,
            },
            OrderLine {
                book_id: OTHER,
                quantity: 5,
            },
        ],
    };
    let result = h.service.create_order(&ctx(), request).await;
    assert!(matches!(
        result,
        Err(Error::InsufficientStock { book_id: OTHER })
    ));

    // The first item was deducted before the second failed; the rollback
    // returned it.
    assert_eq!(h.stock.deducts_for(BOOK).len(), 1);
    assert_eq!(h.stock.releases_for(BOOK).len(), 1);
    assert_eq!(h.stock.available(BOOK), 10);
    assert_eq!(h.stock.available(OTHER), 1);
    assert_eq!(h.store.len(), 0);
}

#[tokio::test]
async fn test_unknown_book_fails_atomically() {
    let h = harness(
        StaticCatalog::with_books(&[(BOOK, "Dune", 1250)]),
        MemoryStock::with_stock(&[(BOOK, 10)]),
        OrderSettings::default(),
        true,
    );

    let request = CreateOrderRequest {
        user_id: 7,
        items: vec![
            OrderLine {
                book_id: BOOK,
                quantity: 1,
            },
            OrderLine {
                book_id: 999,
                quantity: 1,
            },
        ],
    };
    let result = h.service.create_order(&ctx(), request).await;
    assert!(matches!(result, Err(Error::ItemNotFound(999))));
    assert_eq!(h.stock.available(BOOK), 10);
    assert_eq!(h.store.len(), 0);
}

#[tokio::test]
async fn test_catalog_outage_surfaces_dependency_error() {
    let mut catalog = MockCatalog::new();
    catalog
        .expect_get_book()
        .returning(|_, _| Err(Error::Dependency("catalog unreachable".into())));

    let h = harness(
        Arc::new(catalog),
        MemoryStock::with_stock(&[(BOOK, 10)]),
        OrderSettings::default(),
        true,
    );

    let result = h.service.create_order(&ctx(), order_for(BOOK, 1)).await;
    assert!(matches!(result, Err(Error::Dependency(_))));
    assert_eq!(h.stock.available(BOOK), 10);
    assert_eq!(h.store.len(), 0);
}

#[tokio::test]
async fn test_validation_rejects_bad_requests() {
    let h = default_harness(10);

    let empty = CreateOrderRequest {
        user_id: 7,
        items: vec![],
    };
    assert!(matches!(
        h.service.create_order(&ctx(), empty).await,
        Err(Error::InvalidArgument(_))
    ));

    let zero_user = CreateOrderRequest {
        user_id: 0,
        items: vec![OrderLine {
            book_id: BOOK,
            quantity: 1,
        }],
    };
    assert!(matches!(
        h.service.create_order(&ctx(), zero_user).await,
        Err(Error::InvalidArgument(_))
    ));

    assert!(matches!(
        h.service.create_order(&ctx(), order_for(BOOK, 0)).await,
        Err(Error::InvalidArgument(_))
    ));

    assert!(matches!(
        h.service.create_order(&ctx(), order_for(BOOK, 100)).await,
        Err(Error::InvalidArgument(_))
    ));

    let oversized = CreateOrderRequest {
        user_id: 7,
        items: (0..21)
            .map(|i| OrderLine {
                book_id: i,
                quantity: 1,
            })
            .collect(),
    };
    assert!(matches!(
        h.service.create_order(&ctx(), oversized).await,
        Err(Error::InvalidArgument(_))
    ));

    // Nothing moved.
    assert_eq!(h.stock.available(BOOK), 10);
    assert_eq!(h.store.len(), 0);
}

#[tokio::test]
async fn test_created_order_is_pending_and_scheduled() {
    let h = default_harness(10);
    let receipt = h.service.create_order(&ctx(), order_for(BOOK, 2)).await.unwrap();

    assert_eq!(receipt.order_no.len(), 20);
    assert_eq!(h.store.status_of(receipt.order_id), Some(OrderStatus::Pending));
    assert!(h.queue.contains(receipt.order_id));

    let order = h.service.get_order(&ctx(), receipt.order_id).await.unwrap();
    assert_eq!(order.items.len(), 1);
    assert_eq!(order.items[0].book_title, "The Left Hand of Darkness");
    assert_eq!(order.total, 2 * 1850);
}

// ---------------------------------------------------------------------------
// Lifecycle: cancel, pay, ship, complete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_releases_stock() {
    let h = default_harness(10);
    let receipt = h.service.create_order(&ctx(), order_for(BOOK, 4)).await.unwrap();
    assert_eq!(h.stock.available(BOOK), 6);

    h.service.cancel_order(&ctx(), receipt.order_id, 7).await.unwrap();

    assert_eq!(h.store.status_of(receipt.order_id), Some(OrderStatus::Cancelled));
    assert_eq!(h.stock.available(BOOK), 10);
    assert!(!h.queue.contains(receipt.order_id));

    // Terminal: a second cancel is an illegal transition.
    assert!(matches!(
        h.service.cancel_order(&ctx(), receipt.order_id, 7).await,
        Err(Error::IllegalStateTransition { .. })
    ));
}

#[tokio::test]
async fn test_cancel_requires_ownership() {
    let h = default_harness(10);
    let receipt = h.service.create_order(&ctx(), order_for(BOOK, 1)).await.unwrap();

    let result = h.service.cancel_order(&ctx(), receipt.order_id, 8).await;
    assert!(matches!(result, Err(Error::PermissionDenied)));
    assert_eq!(h.store.status_of(receipt.order_id), Some(OrderStatus::Pending));

    assert!(matches!(
        h.service.cancel_order(&ctx(), 424242, 7).await,
        Err(Error::OrderNotFound(424242))
    ));
}

#[tokio::test]
async fn test_payment_confirmation_flow() {
    let h = default_harness(10);
    let receipt = h.service.create_order(&ctx(), order_for(BOOK, 2)).await.unwrap();

    h.service.confirm_payment(&ctx(), receipt.order_id).await.unwrap();
    assert_eq!(h.store.status_of(receipt.order_id), Some(OrderStatus::Paid));
    assert!(!h.queue.contains(receipt.order_id));

    // Paid orders keep their stock; paying twice is illegal.
    assert_eq!(h.stock.available(BOOK), 8);
    assert!(matches!(
        h.service.confirm_payment(&ctx(), receipt.order_id).await,
        Err(Error::IllegalStateTransition { .. })
    ));

    h.service.mark_shipped(&ctx(), receipt.order_id).await.unwrap();
    h.service.mark_completed(&ctx(), receipt.order_id).await.unwrap();
    assert_eq!(
        h.store.status_of(receipt.order_id),
        Some(OrderStatus::Completed)
    );
}

#[tokio::test]
async fn test_declined_payment_keeps_order_pending() {
    let h = harness(
        StaticCatalog::with_books(&[(BOOK, "Dune", 1250)]),
        MemoryStock::with_stock(&[(BOOK, 10)]),
        OrderSettings::default(),
        false,
    );
    let receipt = h.service.create_order(&ctx(), order_for(BOOK, 1)).await.unwrap();

    let result = h.service.confirm_payment(&ctx(), receipt.order_id).await;
    assert!(matches!(result, Err(Error::Dependency(_))));
    assert_eq!(h.store.status_of(receipt.order_id), Some(OrderStatus::Pending));
    assert!(h.queue.contains(receipt.order_id));
}

#[tokio::test]
async fn test_get_order_uses_cache_until_invalidated() {
    let h = default_harness(10);
    let receipt = h.service.create_order(&ctx(), order_for(BOOK, 1)).await.unwrap();

    let loaded = h.service.get_order(&ctx(), receipt.order_id).await.unwrap();
    assert_eq!(loaded.status, OrderStatus::Pending);

    // A write-through copy is now cached: a direct store mutation is not
    // visible until something invalidates.
    h.store
        .update_status(&ctx(), receipt.order_id, OrderStatus::Pending, OrderStatus::Paid)
        .await
        .unwrap();
    let stale = h.service.get_order(&ctx(), receipt.order_id).await.unwrap();
    assert_eq!(stale.status, OrderStatus::Pending);

    h.cache.evict(receipt.order_id).await;
    let fresh = h.service.get_order(&ctx(), receipt.order_id).await.unwrap();
    assert_eq!(fresh.status, OrderStatus::Paid);
}

#[tokio::test]
async fn test_soft_delete_requires_terminal_status() {
    let h = default_harness(10);
    let receipt = h.service.create_order(&ctx(), order_for(BOOK, 1)).await.unwrap();

    assert!(matches!(
        h.service.delete_order(&ctx(), receipt.order_id, 7).await,
        Err(Error::InvalidArgument(_))
    ));

    h.service.cancel_order(&ctx(), receipt.order_id, 7).await.unwrap();
    h.service.delete_order(&ctx(), receipt.order_id, 7).await.unwrap();

    assert!(matches!(
        h.service.get_order(&ctx(), receipt.order_id).await,
        Err(Error::OrderNotFound(_))
    ));
}

#[tokio::test]
async fn test_list_orders_by_user() {
    let h = default_harness(10);
    h.service.create_order(&ctx(), order_for(BOOK, 1)).await.unwrap();
    h.service.create_order(&ctx(), order_for(BOOK, 2)).await.unwrap();

    let other_user = CreateOrderRequest {
        user_id: 9,
        items: vec![OrderLine {
            book_id: BOOK,
            quantity: 1,
        }],
    };
    h.service.create_order(&ctx(), other_user).await.unwrap();

    let mine = h.service.list_orders(&ctx(), 7, 10, 0).await.unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|o| o.user_id == 7));
}

// ---------------------------------------------------------------------------
// Expiry scanner
// ---------------------------------------------------------------------------

fn instant_expiry_settings() -> OrderSettings {
    OrderSettings {
        payment_timeout: Duration::ZERO,
        ..OrderSettings::default()
    }
}

#[tokio::test]
async fn test_scanner_cancels_expired_order_and_returns_stock() {
    let h = harness(
        StaticCatalog::with_books(&[(BOOK, "Dune", 1250)]),
        MemoryStock::with_stock(&[(BOOK, 10)]),
        instant_expiry_settings(),
        true,
    );
    let receipt = h.service.create_order(&ctx(), order_for(BOOK, 2)).await.unwrap();
    assert_eq!(h.stock.available(BOOK), 8);

    let scanner = ExpiryScanner::new(
        h.service.clone(),
        h.queue.clone(),
        Duration::from_secs(60),
        100,
    );
    scanner.scan_once().await;

    assert_eq!(h.store.status_of(receipt.order_id), Some(OrderStatus::Cancelled));
    assert_eq!(h.stock.available(BOOK), 10);
    assert!(!h.queue.contains(receipt.order_id));
}

#[tokio::test]
async fn test_scanner_skips_paid_orders() {
    let h = harness(
        StaticCatalog::with_books(&[(BOOK, "Dune", 1250)]),
        MemoryStock::with_stock(&[(BOOK, 10)]),
        instant_expiry_settings(),
        true,
    );
    let receipt = h.service.create_order(&ctx(), order_for(BOOK, 2)).await.unwrap();
    h.service.confirm_payment(&ctx(), receipt.order_id).await.unwrap();

    // Re-insert a stale entry, as if the removal raced a crash.
    h.queue.schedule(&ctx(), receipt.order_id, 0).await.unwrap();

    let scanner = ExpiryScanner::new(
        h.service.clone(),
        h.queue.clone(),
        Duration::from_secs(60),
        100,
    );
    scanner.scan_once().await;

    assert_eq!(h.store.status_of(receipt.order_id), Some(OrderStatus::Paid));
    assert_eq!(h.stock.available(BOOK), 8);
    assert!(!h.queue.contains(receipt.order_id));
}

#[tokio::test]
async fn test_expire_is_idempotent_across_reprocessing() {
    let h = harness(
        StaticCatalog::with_books(&[(BOOK, "Dune", 1250)]),
        MemoryStock::with_stock(&[(BOOK, 10)]),
        instant_expiry_settings(),
        true,
    );
    let receipt = h.service.create_order(&ctx(), order_for(BOOK, 2)).await.unwrap();

    // A crash between the cancel and the queue removal re-drives the same
    // order; the release marks make the second pass a no-op.
    h.service.expire_order(&ctx(), receipt.order_id).await.unwrap();
    h.service.expire_order(&ctx(), receipt.order_id).await.unwrap();

    assert_eq!(h.stock.available(BOOK), 10);
    assert_eq!(h.stock.releases_for(BOOK).len(), 1);
}

#[tokio::test]
async fn test_scanner_batch_is_bounded() {
    let h = harness(
        StaticCatalog::with_books(&[(BOOK, "Dune", 1250)]),
        MemoryStock::with_stock(&[(BOOK, 1000)]),
        instant_expiry_settings(),
        true,
    );
    for _ in 0..5 {
        h.service.create_order(&ctx(), order_for(BOOK, 1)).await.unwrap();
    }

    let scanner = ExpiryScanner::new(h.service.clone(), h.queue.clone(), Duration::from_secs(60), 2);
    scanner.scan_once().await;
    assert_eq!(h.queue.len(), 3);

    scanner.scan_once().await;
    scanner.scan_once().await;
    assert_eq!(h.queue.len(), 0);
    assert_eq!(h.stock.available(BOOK), 1000);
}
