pub mod cache;
pub mod models;
pub mod pending;
pub mod repository;
pub mod scanner;
pub mod service;

pub use cache::{DetailCache, RedisDetailCache};
pub use models::{CreateOrderRequest, Order, OrderItem, OrderLine, OrderReceipt, OrderStatus};
pub use pending::{ExpiryQueue, RedisExpiryQueue};
pub use repository::{OrderStore, PgOrderStore};
pub use scanner::ExpiryScanner;
pub use service::{OrderService, OrderSettings};
