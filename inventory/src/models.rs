use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bookshop_shared::error::{Error, Result};

/// Authoritative stock row, one per catalog item.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StockRecord {
    pub book_id: i64,
    pub available: i32,
    /// Units deducted by confirmed orders but not yet shipped. Carried for
    /// conservation bookkeeping; no operation moves stock through it at this
    /// tier.
    pub reserved: i32,
    pub total: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockRecord {
    /// `available >= 0`, `reserved >= 0`, `total = available + reserved`,
    /// checked on every mutation before commit.
    pub fn check_invariants(&self) -> Result<()> {
        if self.available < 0 || self.reserved < 0 || self.total != self.available + self.reserved {
            return Err(Error::Internal(format!(
                "stock invariant violated for book {}: available={} reserved={} total={}",
                self.book_id, self.available, self.reserved, self.total
            )));
        }
        Ok(())
    }
}

/// Append-only audit log row. Stored as plain columns; `change_kind` is the
/// upper-case kind string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockLogEntry {
    pub id: i64,
    pub book_id: i64,
    pub change_kind: String,
    pub delta: i32,
    pub before: i32,
    pub after: i32,
    pub order_id: Option<i64>,
    pub remark: String,
    pub created_at: DateTime<Utc>,
}

impl StockLogEntry {
    /// `after = before + delta`; DEDUCT moves stock down, RELEASE/RESTOCK up.
    pub fn check_invariants(&self) -> Result<()> {
        if self.after - self.before != self.delta {
            return Err(Error::Internal(format!(
                "log delta mismatch for book {}: {} -> {} but delta {}",
                self.book_id, self.before, self.after, self.delta
            )));
        }
        let sign_ok = match self.change_kind.as_str() {
            "DEDUCT" => self.delta < 0,
            "RELEASE" | "RESTOCK" => self.delta > 0,
            _ => true,
        };
        if !sign_ok {
            return Err(Error::Internal(format!(
                "log delta sign mismatch for book {}: {} with delta {}",
                self.book_id, self.change_kind, self.delta
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Deduct,
    Release,
    Restock,
    Lock,
    Unlock,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Deduct => "DEDUCT",
            ChangeKind::Release => "RELEASE",
            ChangeKind::Restock => "RESTOCK",
            ChangeKind::Lock => "LOCK",
            ChangeKind::Unlock => "UNLOCK",
        }
    }
}
