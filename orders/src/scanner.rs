//! Periodic expiry scanner for unpaid orders.
//!
//! One single-threaded loop per instance. Per-tick work is capped so a
//! backlog drains across ticks without head-of-line blocking. Each tick runs
//! under its own background context with a fresh trace id.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use bookshop_shared::context::RequestContext;
use bookshop_shared::metrics;

use crate::pending::ExpiryQueue;
use crate::service::OrderService;

pub struct ExpiryScanner {
    orders: Arc<OrderService>,
    pending: Arc<dyn ExpiryQueue>,
    tick: Duration,
    batch: usize,
}

impl ExpiryScanner {
    pub fn new(
        orders: Arc<OrderService>,
        pending: Arc<dyn ExpiryQueue>,
        tick: Duration,
        batch: usize,
    ) -> Self {
        Self {
            orders,
            pending,
            tick,
            batch,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_secs = self.tick.as_secs(), batch = self.batch, "expiry scanner started");
        loop {
            interval.tick().await;
            self.scan_once().await;
        }
    }

    pub async fn scan_once(&self) {
        let timer = metrics::PENDING_SCAN_SECONDS.start_timer();
        let ctx = RequestContext::background(self.tick);
        let now = Utc::now().timestamp();

        let due = match self.pending.due(&ctx, now, self.batch).await {
            Ok(due) => due,
            Err(e) => {
                warn!(trace_id = %ctx.trace_id(), error = %e, "pending-order scan failed");
                return;
            }
        };
        if due.is_empty() {
            return;
        }

        info!(trace_id = %ctx.trace_id(), count = due.len(), "processing expired orders");
        for order_id in due {
            if let Err(e) = self.orders.expire_order(&ctx, order_id).await {
                warn!(
                    trace_id = %ctx.trace_id(),
                    order_id,
                    error = %e,
                    "expiry processing failed, will retry next tick"
                );
            }
        }
        timer.observe_duration();
    }
}
