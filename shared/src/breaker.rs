//! Three-state circuit breaker guarding calls to external dependencies.
//!
//! CLOSED admits everything and accumulates counts over a sampling interval;
//! OPEN rejects until the open timeout elapses; HALF_OPEN admits a bounded
//! number of probes. A generation counter makes late success/failure records
//! safe: any record taken under a superseded generation is discarded, so a
//! stale failure cannot re-flip a breaker that has already recovered.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{Error, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Counts accumulated within the current generation.
#[derive(Debug, Clone, Default)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.requests as f64
        }
    }
}

pub type TripFn = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;
pub type SuccessFn = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
pub type StateChangeFn = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

pub struct BreakerSettings {
    pub name: String,
    pub max_half_open_requests: u32,
    pub interval: Duration,
    pub open_timeout: Duration,
    pub ready_to_trip: TripFn,
    /// Classifies an error result: `true` means the call still counts as a
    /// success for breaker purposes. Business errors never trip a breaker.
    pub is_successful: SuccessFn,
    pub on_state_change: Option<StateChangeFn>,
}

impl BreakerSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_half_open_requests: 1,
            interval: Duration::from_secs(10),
            open_timeout: Duration::from_secs(30),
            ready_to_trip: Arc::new(default_ready_to_trip),
            is_successful: Arc::new(|e| e.is_business()),
            on_state_change: None,
        }
    }

    pub fn with_max_half_open_requests(mut self, n: u32) -> Self {
        self.max_half_open_requests = n.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_ready_to_trip(mut self, f: TripFn) -> Self {
        self.ready_to_trip = f;
        self
    }

    pub fn with_is_successful(mut self, f: SuccessFn) -> Self {
        self.is_successful = f;
        self
    }

    pub fn with_on_state_change(mut self, f: StateChangeFn) -> Self {
        self.on_state_change = Some(f);
        self
    }

    /// Trip rule from breaker config: consecutive failures, or a failure
    /// rate over a minimum sample.
    pub fn trip_rule(consecutive_failures: u32, min_requests: u32, failure_rate: f64) -> TripFn {
        Arc::new(move |counts: &Counts| {
            counts.consecutive_failures >= consecutive_failures
                || (counts.requests >= min_requests && counts.failure_rate() > failure_rate)
        })
    }
}

fn default_ready_to_trip(counts: &Counts) -> bool {
    counts.consecutive_failures >= 5 || (counts.requests >= 10 && counts.failure_rate() > 0.5)
}

struct Inner {
    state: BreakerState,
    counts: Counts,
    generation: u64,
    /// End of the sampling interval in CLOSED; end of the open timeout in
    /// OPEN; unused in HALF_OPEN.
    expiry: Option<Instant>,
}

pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        let interval = settings.interval;
        metrics::breaker_state(&settings.name, BreakerState::Closed);
        Self {
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                counts: Counts::default(),
                generation: 0,
                expiry: interval_end(interval),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let (state, _) = self.current(&mut inner, Instant::now());
        state
    }

    pub fn counts(&self) -> Counts {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        inner.counts.clone()
    }

    /// Run `f` under the breaker. Rejected calls fail with
    /// [`Error::DependencyOpen`] without invoking `f`. The internal lock is
    /// never held while `f` is in flight.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let generation = self.before_request()?;
        let outcome = f().await;
        let success = match &outcome {
            Ok(_) => true,
            Err(err) => (self.settings.is_successful)(err),
        };
        self.after_request(generation, success);
        outcome
    }

    fn before_request(&self) -> Result<u64> {
        let (admitted, transition) = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            let now = Instant::now();
            let (state, changed) = self.current(&mut inner, now);

            let admitted = match state {
                BreakerState::Open => Err(Error::DependencyOpen(self.settings.name.clone())),
                BreakerState::HalfOpen
                    if inner.counts.requests >= self.settings.max_half_open_requests =>
                {
                    Err(Error::DependencyOpen(self.settings.name.clone()))
                }
                _ => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            };
            (admitted, changed)
        };
        self.notify(transition);
        admitted
    }

    fn after_request(&self, generation: u64, success: bool) {
        let transition = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            let now = Instant::now();
            let (state, mut changed) = self.current(&mut inner, now);

            // A state move since this call was admitted means its result no
            // longer describes the current generation; discard it.
            if inner.generation == generation {
                if success {
                    inner.counts.on_success();
                    if state == BreakerState::HalfOpen {
                        changed =
                            merge(changed, self.set_state(&mut inner, BreakerState::Closed, now));
                    }
                } else {
                    inner.counts.on_failure();
                    match state {
                        BreakerState::Closed if (self.settings.ready_to_trip)(&inner.counts) => {
                            changed =
                                merge(changed, self.set_state(&mut inner, BreakerState::Open, now));
                        }
                        BreakerState::HalfOpen => {
                            changed =
                                merge(changed, self.set_state(&mut inner, BreakerState::Open, now));
                        }
                        _ => {}
                    }
                }
            }
            changed
        };
        self.notify(transition);
    }

    /// Effective state at `now`, applying timed transitions: OPEN expires to
    /// HALF_OPEN; a CLOSED sampling interval rolls counts into a new
    /// generation.
    fn current(
        &self,
        inner: &mut Inner,
        now: Instant,
    ) -> (BreakerState, Option<(BreakerState, BreakerState)>) {
        let mut transition = None;
        match inner.state {
            BreakerState::Open => {
                if inner.expiry.is_some_and(|expiry| now >= expiry) {
                    transition = self.set_state(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::Closed => {
                if inner.expiry.is_some_and(|expiry| now >= expiry) {
                    self.new_generation(inner, now);
                }
            }
            BreakerState::HalfOpen => {}
        }
        (inner.state, transition)
    }

    fn set_state(
        &self,
        inner: &mut Inner,
        next: BreakerState,
        now: Instant,
    ) -> Option<(BreakerState, BreakerState)> {
        let prev = inner.state;
        if prev == next {
            return None;
        }
        inner.state = next;
        self.new_generation(inner, now);
        metrics::breaker_state(&self.settings.name, next);
        metrics::breaker_transition(&self.settings.name, next);
        Some((prev, next))
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            BreakerState::Closed => interval_end(self.settings.interval),
            BreakerState::Open => Some(now + self.settings.open_timeout),
            BreakerState::HalfOpen => None,
        };
    }

    fn notify(&self, transition: Option<(BreakerState, BreakerState)>) {
        if let Some((prev, next)) = transition {
            warn!(
                breaker = %self.settings.name,
                from = prev.as_str(),
                to = next.as_str(),
                "circuit breaker state change"
            );
            if let Some(callback) = &self.settings.on_state_change {
                callback(&self.settings.name, prev, next);
            }
        }
    }
}

fn interval_end(interval: Duration) -> Option<Instant> {
    if interval.is_zero() {
        None
    } else {
        Some(Instant::now() + interval)
    }
}

fn merge(
    first: Option<(BreakerState, BreakerState)>,
    second: Option<(BreakerState, BreakerState)>,
) -> Option<(BreakerState, BreakerState)> {
    second.or(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing() -> Result<()> {
        Err(Error::Dependency("downstream unavailable".into()))
    }

    fn settings() -> BreakerSettings {
        BreakerSettings::new("test")
            .with_open_timeout(Duration::from_millis(100))
            .with_ready_to_trip(Arc::new(|c: &Counts| c.consecutive_failures >= 5))
    }

    #[tokio::test]
    async fn test_trips_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(settings());

        for _ in 0..5 {
            let _ = breaker.call(|| async { failing() }).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Rejected without invoking the wrapped function.
        let invoked = AtomicU32::new(0);
        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::DependencyOpen(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let breaker = CircuitBreaker::new(settings());
        for _ in 0..5 {
            let _ = breaker.call(|| async { failing() }).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let result = breaker.call(|| async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(settings());
        for _ in 0..5 {
            let _ = breaker.call(|| async { failing() }).await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        let _ = breaker.call(|| async { failing() }).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_bounded_probes() {
        let breaker = CircuitBreaker::new(settings().with_max_half_open_requests(1));
        for _ in 0..5 {
            let _ = breaker.call(|| async { failing() }).await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        // First probe admitted; it holds the single half-open slot, so a
        // second concurrent call is rejected.
        let first = breaker.before_request();
        assert!(first.is_ok());
        let second = breaker.before_request();
        assert!(matches!(second, Err(Error::DependencyOpen(_))));
        breaker.after_request(first.unwrap(), true);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_stale_generation_record_ignored() {
        let breaker = CircuitBreaker::new(settings());

        // Admit a call in CLOSED, then trip the breaker before it records.
        let generation = breaker.before_request().unwrap();
        for _ in 0..5 {
            let _ = breaker.call(|| async { failing() }).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        tokio::time::sleep(Duration::from_millis(120)).await;
        let probe = breaker.before_request().unwrap();
        breaker.after_request(probe, true);
        assert_eq!(breaker.state(), BreakerState::Closed);

        // The stale failure must not re-open the recovered breaker.
        breaker.after_request(generation, false);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_business_errors_do_not_trip() {
        let breaker = CircuitBreaker::new(settings());
        for _ in 0..20 {
            let result: Result<()> = breaker
                .call(|| async { Err(Error::InsufficientStock { book_id: 9 }) })
                .await;
            assert!(matches!(result, Err(Error::InsufficientStock { .. })));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_state_change_callback() {
        let transitions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let breaker = CircuitBreaker::new(settings().with_on_state_change(Arc::new(
            move |name, prev, next| {
                seen.lock().unwrap().push((name.to_string(), prev, next));
            },
        )));

        for _ in 0..5 {
            let _ = breaker.call(|| async { failing() }).await;
        }
        let recorded = transitions.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![("test".to_string(), BreakerState::Closed, BreakerState::Open)]
        );
    }

    #[test]
    fn test_trip_rule_failure_rate() {
        let rule = BreakerSettings::trip_rule(5, 10, 0.5);
        let mut counts = Counts::default();
        for _ in 0..6 {
            counts.on_request();
            counts.on_failure();
            counts.consecutive_failures = 0; // isolate the rate clause
        }
        for _ in 0..5 {
            counts.on_request();
            counts.on_success();
        }
        assert!(rule(&counts));
    }
}
