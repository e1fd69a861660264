//! Request-scoped context: deadline, trace identifiers and caller identity.
//!
//! Every public operation takes a `RequestContext`. Nested operations derive
//! a child span; background work (durability jobs, compensations, scanner
//! ticks) detaches into a fresh context that inherits only the trace id.

use std::future::Future;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RequestContext {
    trace_id: String,
    span_id: String,
    user_id: Option<i64>,
    deadline: Instant,
}

impl RequestContext {
    /// Root context for an inbound request.
    pub fn new(timeout: Duration) -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: short_id(),
            user_id: None,
            deadline: Instant::now() + timeout,
        }
    }

    /// Root context for background work with no originating request.
    pub fn background(timeout: Duration) -> Self {
        Self::new(timeout)
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Derive a child span. The child deadline never extends past the parent.
    pub fn child(&self, timeout: Duration) -> Self {
        let requested = Instant::now() + timeout;
        Self {
            trace_id: self.trace_id.clone(),
            span_id: short_id(),
            user_id: self.user_id,
            deadline: requested.min(self.deadline),
        }
    }

    /// Detach from the caller: fresh deadline, same trace id. Used by work
    /// that must outlive the originating request.
    pub fn detach(&self, timeout: Duration) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: short_id(),
            user_id: None,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Checked at every blocking point before touching I/O.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(Error::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Run a fallible future within the remaining time budget.
    pub async fn bound<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        match tokio::time::timeout(self.remaining(), fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    /// W3C trace header value for outbound RPCs.
    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }
}

fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}
