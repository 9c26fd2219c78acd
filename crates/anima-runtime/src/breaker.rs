use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state. `Open` rejects calls immediately; after the recovery
/// timeout one probe call is allowed in `HalfOpen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-recipient circuit breaker over the queue-full failure class.
///
/// Transitions: closed → open at the failure threshold; open → half-open
/// after the recovery timeout; half-open → closed on one success, back to
/// open on failure. Failures other than queue-full must not be recorded;
/// the caller passes them through without touching the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: BreakerState,
    failure_count: u32,
    success_count: u64,
    total_calls: u64,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: &str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold,
            recovery_timeout,
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            total_calls: 0,
            last_failure: None,
        }
    }

    /// Current state, promoting `Open` to `HalfOpen` once the recovery
    /// timeout has elapsed.
    pub fn state(&mut self) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(at) = self.last_failure {
                if at.elapsed() > self.recovery_timeout {
                    self.state = BreakerState::HalfOpen;
                    info!(breaker = %self.name, "circuit breaker half-open");
                }
            }
        }
        self.state
    }

    /// Gate one call. `false` means the breaker is open and the call must
    /// be rejected without an attempt.
    pub fn allow(&mut self) -> bool {
        self.total_calls += 1;
        self.state() != BreakerState::Open
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.failure_count = 0;
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
            info!(breaker = %self.name, "circuit breaker closed");
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if self.state == BreakerState::HalfOpen || self.failure_count >= self.failure_threshold {
            if self.state != BreakerState::Open {
                warn!(
                    breaker = %self.name,
                    failures = self.failure_count,
                    "circuit breaker open"
                );
            }
            self.state = BreakerState::Open;
        }
    }

    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_threshold_and_recovers() {
        let mut breaker = CircuitBreaker::new("test", 3, Duration::from_millis(20));

        for _ in 0..2 {
            assert!(breaker.allow());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut breaker = CircuitBreaker::new("test", 3, Duration::from_secs(1));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
