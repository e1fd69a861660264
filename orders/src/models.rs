use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum OrderStatus {
    Pending = 1,
    Paid = 2,
    Shipped = 3,
    Completed = 4,
    Cancelled = 5,
}

impl OrderStatus {
    /// The only legal edges of the order state machine. Everything else is
    /// an illegal transition.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Cancelled)
                | (Paid, Shipped)
                | (Paid, Cancelled)
                | (Shipped, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Order aggregate root. Items are a strict one-to-many owned by the order;
/// catalog data is snapshotted into them at creation, never re-read.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub order_no: String,
    pub user_id: i64,
    /// Money in minor units.
    pub total: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub book_id: i64,
    /// Title snapshot taken at order time.
    pub book_title: String,
    pub quantity: i32,
    /// Unit price snapshot in minor units.
    pub unit_price: i64,
}

/// `total = Σ quantity × unit_price`, computed once at creation.
pub fn compute_total(items: &[OrderItem]) -> i64 {
    items
        .iter()
        .map(|item| item.quantity as i64 * item.unit_price)
        .sum()
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub user_id: i64,
    #[validate(length(min = 1, message = "order must contain at least one item"))]
    pub items: Vec<OrderLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderLine {
    pub book_id: i64,
    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: i64,
    pub order_no: String,
    /// Minor units.
    pub total: i64,
    /// Decimal rendering for display boundaries.
    pub total_display: String,
}

/// Time-prefixed business key: `YYYYMMDDhhmmss` + 6 random digits, 20 chars.
pub fn next_order_no() -> String {
    order_no_at(Utc::now())
}

pub fn order_no_at(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}{:06}", now.format("%Y%m%d%H%M%S"), suffix)
}

/// Numeric order id, generated before the saga runs so inventory
/// idempotency marks carry the real id from the first deduction on.
/// Millisecond-prefixed, so ids sort roughly by creation time.
pub fn next_order_id() -> i64 {
    let millis = Utc::now().timestamp_millis();
    let suffix: i64 = rand::thread_rng().gen_range(0..1_000_000);
    millis * 1_000_000 + suffix
}

/// Render minor units as a decimal string; money is never a float.
pub fn format_minor_units(amount: i64) -> String {
    Decimal::new(amount, 2).to_string()
}
