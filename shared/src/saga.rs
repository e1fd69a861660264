//! Generic forward/compensate transaction coordinator.
//!
//! A saga is an ordered list of steps, each with a forward action and an
//! optional compensation. Forwards run sequentially under a child context
//! bounded by the saga timeout. On the first forward error (or parent
//! cancellation) the compensations of every step that was invoked run in
//! reverse order under a fresh detached context, so the cause of the failure
//! cannot cancel the rollback. Compensation errors are logged and skipped;
//! the original forward error is always what the caller sees.
//!
//! Steps share intermediate state through a mutable struct captured by the
//! step closures, typically behind `Arc<Mutex<_>>`.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::metrics;

type ActionFn = Box<dyn Fn(RequestContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct Step {
    name: String,
    forward: ActionFn,
    compensate: Option<ActionFn>,
}

pub struct Saga {
    name: String,
    timeout: Duration,
    compensation_timeout: Duration,
    steps: Vec<Step>,
}

impl Saga {
    pub fn new(name: impl Into<String>, timeout: Duration, compensation_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            compensation_timeout,
            steps: Vec::new(),
        }
    }

    /// Append a step with no compensation.
    pub fn step<F, Fut>(self, name: impl Into<String>, forward: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push(name.into(), boxed(forward), None)
    }

    /// Append a step with a paired compensation. The compensation must be
    /// idempotent; it can run after a crash re-drive.
    pub fn step_with_compensation<F, Fut, C, CFut>(
        self,
        name: impl Into<String>,
        forward: F,
        compensate: C,
    ) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        C: Fn(RequestContext) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push(name.into(), boxed(forward), Some(boxed(compensate)))
    }

    fn push(mut self, name: String, forward: ActionFn, compensate: Option<ActionFn>) -> Self {
        self.steps.push(Step {
            name,
            forward,
            compensate,
        });
        self
    }

    /// Run every forward in order; on failure, compensate in reverse every
    /// step whose forward was invoked, the failed step included, since it
    /// may have made partial progress before erroring. Compensations must
    /// therefore tolerate zero progress. Returns the first forward error.
    pub async fn execute(&self, ctx: &RequestContext) -> Result<()> {
        let child = ctx.child(self.timeout);
        // Count of steps whose forward ran and may have had effects.
        let mut attempted = 0usize;
        let mut failure: Option<(usize, Error)> = None;

        for (index, step) in self.steps.iter().enumerate() {
            if let Err(e) = child.check() {
                failure = Some((index, e));
                break;
            }
            debug!(saga = %self.name, step = %step.name, "saga step forward");
            attempted = index + 1;
            if let Err(e) = (step.forward)(child.clone()).await {
                failure = Some((index, e));
                break;
            }
        }

        let Some((failed_index, error)) = failure else {
            return Ok(());
        };

        warn!(
            saga = %self.name,
            step = %self.steps[failed_index].name,
            error = %error,
            "saga forward failed, compensating"
        );
        self.compensate(ctx, attempted).await;
        Err(error)
    }

    async fn compensate(&self, ctx: &RequestContext, attempted: usize) {
        // Fresh background context: the compensation must not be cancelled
        // by whatever killed the forward path.
        let comp_ctx = ctx.detach(self.compensation_timeout);

        for index in (0..attempted).rev() {
            let step = &self.steps[index];
            let Some(compensate) = &step.compensate else {
                continue;
            };
            metrics::saga_compensation(&self.name, &step.name);
            if let Err(e) = compensate(comp_ctx.clone()).await {
                warn!(
                    saga = %self.name,
                    step = %step.name,
                    trace_id = %comp_ctx.trace_id(),
                    error = %e,
                    "saga compensation failed"
                );
            }
        }
    }
}

fn boxed<F, Fut>(f: F) -> ActionFn
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}
