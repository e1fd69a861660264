//! Atomic stock scripts for the fast store.
//!
//! Each operation is one Lua script, so it is indivisible with respect to any
//! concurrent script on the same stock key, while different books never
//! serialize against each other. Script bodies are registered once at
//! startup; `redis::Script` invokes them by SHA digest afterwards.

use redis::aio::ConnectionManager;
use redis::Script;

use bookshop_shared::context::RequestContext;
use bookshop_shared::error::{Error, Result};

/// Idempotency marks live for one hour.
pub const MARK_TTL_SECS: u64 = 3600;

const DEDUCT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return {'ALREADY_DONE', tonumber(redis.call('GET', KEYS[1]) or '0')}
end
local stock = tonumber(redis.call('GET', KEYS[1]) or '0')
local qty = tonumber(ARGV[1])
if stock < qty then
    return {'INSUFFICIENT', stock}
end
local left = redis.call('DECRBY', KEYS[1], qty)
redis.call('SET', KEYS[2], ARGV[2], 'EX', tonumber(ARGV[3]))
return {'OK', left}
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 1 then
    return {'ALREADY_DONE', tonumber(redis.call('GET', KEYS[1]) or '0')}
end
if redis.call('EXISTS', KEYS[2]) == 0 then
    return {'NOT_DEDUCTED', tonumber(redis.call('GET', KEYS[1]) or '0')}
end
local now = redis.call('INCRBY', KEYS[1], tonumber(ARGV[1]))
redis.call('DEL', KEYS[2])
redis.call('SET', KEYS[3], ARGV[2], 'EX', tonumber(ARGV[3]))
return {'OK', now}
"#;

const RESTOCK_SCRIPT: &str = r#"
return redis.call('INCRBY', KEYS[1], tonumber(ARGV[1]))
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductOutcome {
    Done { remaining: i64 },
    AlreadyDone { remaining: i64 },
    Insufficient { remaining: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Done { remaining: i64 },
    AlreadyDone { remaining: i64 },
    NotDeducted { remaining: i64 },
}

pub fn stock_key(book_id: i64) -> String {
    format!("stock:{book_id}")
}

pub fn deduct_mark(book_id: i64, order_id: i64) -> String {
    format!("deduct:{book_id}:{order_id}")
}

pub fn release_mark(book_id: i64, order_id: i64) -> String {
    format!("release:{book_id}:{order_id}")
}

pub struct StockScripts {
    deduct: Script,
    release: Script,
    restock: Script,
}

impl Default for StockScripts {
    fn default() -> Self {
        Self::new()
    }
}

impl StockScripts {
    pub fn new() -> Self {
        Self {
            deduct: Script::new(DEDUCT_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            restock: Script::new(RESTOCK_SCRIPT),
        }
    }

    pub async fn deduct(
        &self,
        ctx: &RequestContext,
        conn: &mut ConnectionManager,
        book_id: i64,
        qty: i32,
        order_id: i64,
    ) -> Result<DeductOutcome> {
        let (status, remaining): (String, i64) = ctx
            .bound(async {
                self.deduct
                    .key(stock_key(book_id))
                    .key(deduct_mark(book_id, order_id))
                    .arg(qty)
                    .arg(order_id)
                    .arg(MARK_TTL_SECS)
                    .invoke_async(conn)
                    .await
                    .map_err(Error::from)
            })
            .await?;
        parse_deduct(&status, remaining)
    }

    pub async fn release(
        &self,
        ctx: &RequestContext,
        conn: &mut ConnectionManager,
        book_id: i64,
        qty: i32,
        order_id: i64,
    ) -> Result<ReleaseOutcome> {
        let (status, remaining): (String, i64) = ctx
            .bound(async {
                self.release
                    .key(stock_key(book_id))
                    .key(deduct_mark(book_id, order_id))
                    .key(release_mark(book_id, order_id))
                    .arg(qty)
                    .arg(order_id)
                    .arg(MARK_TTL_SECS)
                    .invoke_async(conn)
                    .await
                    .map_err(Error::from)
            })
            .await?;
        parse_release(&status, remaining)
    }

    pub async fn restock(
        &self,
        ctx: &RequestContext,
        conn: &mut ConnectionManager,
        book_id: i64,
        qty: i32,
    ) -> Result<i64> {
        ctx.bound(async {
            self.restock
                .key(stock_key(book_id))
                .arg(qty)
                .invoke_async(conn)
                .await
                .map_err(Error::from)
        })
        .await
    }
}

fn parse_deduct(status: &str, remaining: i64) -> Result<DeductOutcome> {
    match status {
        "OK" => Ok(DeductOutcome::Done { remaining }),
        "ALREADY_DONE" => Ok(DeductOutcome::AlreadyDone { remaining }),
        "INSUFFICIENT" => Ok(DeductOutcome::Insufficient { remaining }),
        other => Err(Error::Internal(format!(
            "unexpected deduct script status: {other}"
        ))),
    }
}

fn parse_release(status: &str, remaining: i64) -> Result<ReleaseOutcome> {
    match status {
        "OK" => Ok(ReleaseOutcome::Done { remaining }),
        "ALREADY_DONE" => Ok(ReleaseOutcome::AlreadyDone { remaining }),
        "NOT_DEDUCTED" => Ok(ReleaseOutcome::NotDeducted { remaining }),
        other => Err(Error::Internal(format!(
            "unexpected release script status: {other}"
        ))),
    }
}
