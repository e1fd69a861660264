use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use bookshop_inventory::{InventoryService, StockRepository};
use bookshop_orders::{
    ExpiryScanner, OrderService, OrderSettings, PgOrderStore, RedisDetailCache, RedisExpiryQueue,
};
use bookshop_shared::breaker::{BreakerSettings, CircuitBreaker};
use bookshop_shared::clients::{HttpCatalogClient, MockPaymentGateway};
use bookshop_shared::config::BreakerConfig;
use bookshop_shared::context::RequestContext;
use bookshop_shared::{database, redis as fast_store, AppConfig};

mod health;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    config.validate().map_err(anyhow::Error::msg)?;
    init_tracing(&config);
    info!("configuration loaded");

    let pool = database::connect(&config.database).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("database ready");

    let redis = fast_store::connect(&config.redis).await?;

    // Inventory: fast store fronted, durable store authoritative.
    let stock_repo = StockRepository::new(pool.clone());
    let inventory = Arc::new(
        InventoryService::new(redis.clone(), stock_repo)
            .with_durability_timeout(config.request_timeout()),
    );

    let warmup_ctx = RequestContext::background(Duration::from_secs(30));
    if let Err(e) = inventory.warm_up(&warmup_ctx).await {
        warn!(error = %e, "inventory warm-up failed; fast store will fill on demand");
    }

    // Order pipeline and its collaborators.
    let catalog = Arc::new(HttpCatalogClient::new(
        config.clients.catalog_url.clone(),
        Duration::from_secs(config.clients.catalog_timeout),
    )?);
    let payment = Arc::new(MockPaymentGateway::new(config.clients.payment_success_ratio));
    let pending = Arc::new(RedisExpiryQueue::new(redis.clone()));
    let cache = Arc::new(RedisDetailCache::new(
        redis.clone(),
        config.order.detail_cache_ttl,
    ));

    let orders = Arc::new(OrderService::new(
        Arc::new(PgOrderStore::new(pool.clone())),
        inventory.clone(),
        catalog,
        payment,
        cache,
        pending.clone(),
        breaker("catalog", &config.breaker),
        breaker("inventory", &config.breaker),
        breaker("payment", &config.breaker),
        OrderSettings {
            payment_timeout: config.payment_timeout(),
            max_items_per_order: config.order.max_items_per_order,
            max_quantity_per_item: config.order.max_quantity_per_item,
            saga_timeout: config.saga_timeout(),
            compensation_timeout: config.compensation_timeout(),
        },
    ));

    ExpiryScanner::new(
        orders.clone(),
        pending,
        config.scanner_tick(),
        config.order.scanner_batch,
    )
    .spawn();

    // Business transport is wired by the surrounding host; this binary
    // exposes the operational surface only.
    let checker = Arc::new(health::HealthChecker::new(pool, redis));
    let app = health::monitoring_routes(checker).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!(%addr, "bookshop order/inventory core listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "bookshop=info,tower_http=info".into());

    if config.tracing.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn breaker(name: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
    let settings = BreakerSettings::new(name)
        .with_max_half_open_requests(config.max_half_open_requests)
        .with_interval(Duration::from_secs(config.interval))
        .with_open_timeout(Duration::from_secs(config.open_timeout))
        .with_ready_to_trip(BreakerSettings::trip_rule(
            config.consecutive_failures,
            config.min_requests,
            config.failure_rate,
        ));
    Arc::new(CircuitBreaker::new(settings))
}
