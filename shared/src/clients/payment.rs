//! Payment collaborator. Only a randomized mock at this tier; the PAID
//! transition is driven by its outcome.

use async_trait::async_trait;
use rand::Rng;

use crate::context::RequestContext;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Success,
    Failed,
}

#[async_trait]
pub trait PaymentClient: Send + Sync {
    async fn pay(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        amount: i64,
        method: &str,
    ) -> Result<PaymentOutcome>;
}

pub struct MockPaymentGateway {
    success_ratio: f64,
}

impl MockPaymentGateway {
    pub fn new(success_ratio: f64) -> Self {
        Self {
            success_ratio: success_ratio.clamp(0.0, 1.0),
        }
    }

    /// Gateway that approves everything; used in tests and demos.
    pub fn approve_all() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl PaymentClient for MockPaymentGateway {
    async fn pay(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        amount: i64,
        method: &str,
    ) -> Result<PaymentOutcome> {
        ctx.check()?;
        let roll: f64 = rand::thread_rng().gen();
        let outcome = if roll < self.success_ratio {
            PaymentOutcome::Success
        } else {
            PaymentOutcome::Failed
        };
        tracing::info!(
            order_id,
            amount,
            method,
            outcome = ?outcome,
            "mock payment processed"
        );
        Ok(outcome)
    }
}
