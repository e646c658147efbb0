// =============================================================================
// Circuit breaker: pauses outbound requests after repeated rate-limit errors
// =============================================================================
//
// One breaker is shared by every chunk worker of an exchange client. State
// transitions happen under a single mutex; the mutex is never held across an
// await point (waiters compute their sleep under the lock, then sleep outside
// it).
//
//   CLOSED    - normal traffic; successes decay the throttle toward 1.0.
//   OPEN      - all requests wait until `cooldown_until`.
//   HALF_OPEN - probe traffic allowed; one success closes, one rate error
//               reopens with a fresh cooldown.
// =============================================================================

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

/// Throttle multiplier bounds.
const THROTTLE_FLOOR: f64 = 1.0;
const THROTTLE_CEIL: f64 = 5.0;
/// Growth on each rate error, decay on each success.
const THROTTLE_GROWTH: f64 = 1.5;
const THROTTLE_DECAY: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_rate_errors: u32,
    cooldown_until: Option<Instant>,
    throttle: f64,
    concurrency: usize,
}

/// Serialisable view for the debug endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_rate_errors: u32,
    pub throttle_multiplier: f64,
    pub concurrency: usize,
    pub cooldown_remaining_ms: u64,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    /// Consecutive rate errors that trip CLOSED -> OPEN.
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, initial_concurrency: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_rate_errors: 0,
                cooldown_until: None,
                throttle: THROTTLE_FLOOR,
                concurrency: initial_concurrency.max(1),
            }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// Block until the breaker admits traffic. While OPEN this waits out the
    /// cooldown, then transitions to HALF_OPEN and returns.
    pub async fn wait_ready(&self) {
        loop {
            let sleep_for = {
                let mut inner = self.inner.lock();
                match inner.state {
                    BreakerState::Closed | BreakerState::HalfOpen => None,
                    BreakerState::Open => {
                        let now = Instant::now();
                        match inner.cooldown_until {
                            Some(until) if now < until => Some(until - now),
                            _ => {
                                inner.state = BreakerState::HalfOpen;
                                info!("circuit breaker half-open, allowing probe traffic");
                                None
                            }
                        }
                    }
                }
            };
            match sleep_for {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Delay to apply before a request: `base * throttle_multiplier`.
    pub fn request_delay(&self, base: Duration) -> Duration {
        let throttle = self.inner.lock().throttle;
        base.mul_f64(throttle)
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_rate_errors = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.cooldown_until = None;
            info!("circuit breaker closed after successful probe");
        }
        inner.throttle = (inner.throttle * THROTTLE_DECAY).max(THROTTLE_FLOOR);
    }

    /// Record an HTTP 418/429/451. Grows the throttle, halves the worker
    /// concurrency, and trips the breaker at the configured threshold (or
    /// immediately when a HALF_OPEN probe fails). Returns true when this call
    /// opened the breaker.
    pub fn record_rate_error(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.consecutive_rate_errors += 1;
        inner.throttle = (inner.throttle * THROTTLE_GROWTH).min(THROTTLE_CEIL);
        inner.concurrency = (inner.concurrency / 2).max(1);

        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Open => true,
            BreakerState::Closed => inner.consecutive_rate_errors >= self.threshold,
        };

        if trip {
            let reopened = inner.state != BreakerState::Closed;
            inner.state = BreakerState::Open;
            inner.cooldown_until = Some(Instant::now() + self.cooldown);
            warn!(
                consecutive_rate_errors = inner.consecutive_rate_errors,
                cooldown_s = self.cooldown.as_secs(),
                throttle = inner.throttle,
                reopened,
                "circuit breaker open"
            );
        }
        trip
    }

    /// Worker concurrency currently admitted by the breaker.
    pub fn concurrency(&self) -> usize {
        self.inner.lock().concurrency
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let remaining = inner
            .cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0);
        BreakerSnapshot {
            state: inner.state,
            consecutive_rate_errors: inner.consecutive_rate_errors,
            throttle_multiplier: inner.throttle,
            concurrency: inner.concurrency,
            cooldown_remaining_ms: remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(60), 8)
    }

    #[test]
    fn trips_open_at_threshold() {
        let b = breaker();
        assert!(!b.record_rate_error());
        assert!(!b.record_rate_error());
        assert!(b.record_rate_error());
        assert_eq!(b.snapshot().state, BreakerState::Open);
        assert_eq!(b.snapshot().consecutive_rate_errors, 3);
    }

    #[test]
    fn throttle_grows_and_caps() {
        let b = breaker();
        for _ in 0..10 {
            b.record_rate_error();
        }
        let snap = b.snapshot();
        assert!((snap.throttle_multiplier - 5.0).abs() < 1e-9);
        assert_eq!(snap.concurrency, 1);
    }

    #[test]
    fn success_decays_throttle_toward_floor() {
        let b = breaker();
        b.record_rate_error();
        b.record_rate_error();
        let before = b.snapshot().throttle_multiplier;
        let mut last = before;
        for _ in 0..200 {
            b.record_success();
            let now = b.snapshot().throttle_multiplier;
            assert!(now <= last);
            last = now;
        }
        assert!((last - 1.0).abs() < 1e-9);
        assert_eq!(b.snapshot().consecutive_rate_errors, 0);
    }

    #[test]
    fn request_delay_scales_with_throttle() {
        let b = breaker();
        assert_eq!(b.request_delay(Duration::from_millis(100)), Duration::from_millis(100));
        b.record_rate_error();
        assert_eq!(b.request_delay(Duration::from_millis(100)), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn open_waits_cooldown_then_half_open() {
        let b = CircuitBreaker::new(1, Duration::from_secs(60), 4);
        assert!(b.record_rate_error());
        assert_eq!(b.snapshot().state, BreakerState::Open);

        // wait_ready must sleep through the cooldown (auto-advanced under the
        // paused clock) and land in HALF_OPEN.
        b.wait_ready().await;
        assert_eq!(b.snapshot().state, BreakerState::HalfOpen);

        // Successful probe closes the breaker.
        b.record_success();
        assert_eq!(b.snapshot().state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = CircuitBreaker::new(1, Duration::from_secs(30), 4);
        b.record_rate_error();
        b.wait_ready().await;
        assert_eq!(b.snapshot().state, BreakerState::HalfOpen);

        // A single rate error during the probe reopens immediately.
        assert!(b.record_rate_error());
        assert_eq!(b.snapshot().state, BreakerState::Open);
        assert!(b.snapshot().cooldown_remaining_ms > 0);
    }

    #[test]
    fn closed_passes_immediately() {
        let b = breaker();
        // No await needed to verify state, just the snapshot.
        assert_eq!(b.snapshot().state, BreakerState::Closed);
        assert_eq!(b.concurrency(), 8);
    }
}
