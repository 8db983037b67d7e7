//! Backend health tracking and circuit breaking.
//!
//! Each backend carries a circuit breaker fed from two sources: the
//! background probe loop and the dispatch path itself. The breaker has
//! three states:
//!
//! ```text
//! +--------+  N consecutive failures  +------+   cooldown elapsed   +-----------+
//! | Closed | -----------------------> | Open | -------------------> | Half-Open |
//! +--------+                          +------+                      +-----------+
//!     ^                                  ^                                |
//!     |        trial success             |         trial failure          |
//!     +----------------------------------+--------------------------------+
//! ```
//!
//! Open and Half-Open backends receive no routed traffic; the periodic
//! probe is the single trial request that closes a Half-Open circuit.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::pool::BackendPool;
use crate::registry::BackendRegistry;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Externally visible backend health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Healthy,
    /// Routable, but at half the concurrency cap.
    Degraded,
    /// Not routed to new work.
    Unhealthy,
}

impl BackendStatus {
    /// Gauge value for the `backend_health` metric.
    pub fn gauge_value(&self) -> f64 {
        match self {
            BackendStatus::Healthy => 1.0,
            BackendStatus::Degraded => 0.5,
            BackendStatus::Unhealthy => 0.0,
        }
    }
}

/// Per-backend circuit breaker. All state is atomic; timestamps are
/// milliseconds since breaker creation (0 means never).
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    last_transition_ms: AtomicU64,
    last_probe_ms: AtomicU64,
    last_probe_latency_us: AtomicU64,
    started: Instant,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            last_transition_ms: AtomicU64::new(0),
            last_probe_ms: AtomicU64::new(0),
            last_probe_latency_us: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        // +1 so 0 stays a "never" sentinel.
        self.started.elapsed().as_millis() as u64 + 1
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Derived status: Open/Half-Open circuits are Unhealthy; a closed
    /// circuit with recent consecutive failures is Degraded.
    pub fn status(&self) -> BackendStatus {
        match self.state() {
            CircuitState::Open | CircuitState::HalfOpen => BackendStatus::Unhealthy,
            CircuitState::Closed => {
                if self.consecutive_failures.load(Ordering::Acquire) > 0 {
                    BackendStatus::Degraded
                } else {
                    BackendStatus::Healthy
                }
            }
        }
    }

    /// Whether the router may send new work here.
    pub fn allows_traffic(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// When the circuit will next accept a trial, if currently open.
    pub fn open_until(&self) -> Option<Duration> {
        if self.state() != CircuitState::Open {
            return None;
        }
        let since = self
            .now_ms()
            .saturating_sub(self.last_transition_ms.load(Ordering::Acquire));
        let cooldown_ms = self.cooldown.as_millis() as u64;
        Some(Duration::from_millis(cooldown_ms.saturating_sub(since)))
    }

    /// Record a successful call or probe.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev != STATE_CLOSED {
            self.last_transition_ms.store(self.now_ms(), Ordering::Release);
            info!("circuit closed");
        }
    }

    /// Record a failed call or probe.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state() {
            CircuitState::Closed => {
                if failures >= self.failure_threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    self.last_transition_ms.store(self.now_ms(), Ordering::Release);
                    warn!(consecutive_failures = failures, "circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                // Trial failed: reopen and restart the cooldown.
                self.state.store(STATE_OPEN, Ordering::Release);
                self.last_transition_ms.store(self.now_ms(), Ordering::Release);
                warn!("circuit reopened after failed trial");
            }
            CircuitState::Open => {}
        }
    }

    /// If the circuit is Open and the cooldown has elapsed, move it to
    /// Half-Open and claim the single trial slot. Returns true for exactly
    /// one caller per Open period.
    pub fn try_begin_trial(&self) -> bool {
        if self.state() != CircuitState::Open {
            return false;
        }
        let since = self
            .now_ms()
            .saturating_sub(self.last_transition_ms.load(Ordering::Acquire));
        if since < self.cooldown.as_millis() as u64 {
            return false;
        }
        let claimed = self
            .state
            .compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.last_transition_ms.store(self.now_ms(), Ordering::Release);
            info!("circuit half-open, sending trial probe");
        }
        claimed
    }

    pub fn record_probe(&self) {
        self.last_probe_ms.store(self.now_ms(), Ordering::Release);
    }

    pub fn record_probe_latency(&self, latency: Duration) {
        self.last_probe_latency_us
            .store(latency.as_micros() as u64, Ordering::Release);
    }

    /// Latency of the last successful probe.
    pub fn probe_latency(&self) -> Option<Duration> {
        let us = self.last_probe_latency_us.load(Ordering::Acquire);
        if us == 0 {
            return None;
        }
        Some(Duration::from_micros(us))
    }

    /// Time since the last probe, if any ran.
    pub fn since_last_probe(&self) -> Option<Duration> {
        let ts = self.last_probe_ms.load(Ordering::Acquire);
        if ts == 0 {
            return None;
        }
        Some(Duration::from_millis(self.now_ms().saturating_sub(ts)))
    }
}

/// Point-in-time health view of one backend, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub backend_id: String,
    pub status: BackendStatus,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_ago_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_for_ms: Option<u64>,
    pub in_flight: usize,
}

/// Background prober: issues a cheap request to every backend on a fixed
/// cadence and feeds the circuit breakers.
pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    pool: Arc<BackendPool>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, pool: Arc<BackendPool>, interval: Duration) -> Self {
        Self { registry, pool, interval }
    }

    /// Run until `shutdown` fires. Intended to be spawned.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    debug!("health monitor stopping");
                    return;
                }
            }
            self.probe_all().await;
        }
    }

    /// One probe round over every registered backend.
    pub async fn probe_all(&self) {
        for backend in self.registry.all() {
            let breaker = &backend.breaker;
            // An open circuit is only probed once its cooldown allows a trial.
            if breaker.state() == CircuitState::Open && !breaker.try_begin_trial() {
                metrics::set_backend_health(&backend.id, breaker.status().gauge_value());
                continue;
            }

            breaker.record_probe();
            match self.pool.probe(&backend).await {
                Ok(latency) => {
                    debug!(backend = %backend.id, latency_ms = latency.as_millis() as u64, "probe ok");
                    breaker.record_probe_latency(latency);
                    breaker.record_success();
                }
                Err(e) => {
                    warn!(backend = %backend.id, error = %e, "probe failed");
                    breaker.record_failure();
                }
            }
            metrics::set_backend_health(&backend.id, breaker.status().gauge_value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_millis(20))
    }

    #[test]
    fn test_initial_state() {
        let b = breaker();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.status(), BackendStatus::Healthy);
        assert!(b.allows_traffic());
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.status(), BackendStatus::Degraded);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.status(), BackendStatus::Unhealthy);
        assert!(!b.allows_traffic());
        assert!(b.open_until().is_some());
    }

    #[test]
    fn test_success_resets_failures() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.status(), BackendStatus::Healthy);
    }

    #[test]
    fn test_trial_after_cooldown() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(!b.try_begin_trial(), "cooldown not elapsed yet");

        std::thread::sleep(Duration::from_millis(30));
        assert!(b.try_begin_trial());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        // Only one trial per open period.
        assert!(!b.try_begin_trial());

        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allows_traffic());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.try_begin_trial());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_status_gauge_values() {
        assert_eq!(BackendStatus::Healthy.gauge_value(), 1.0);
        assert_eq!(BackendStatus::Degraded.gauge_value(), 0.5);
        assert_eq!(BackendStatus::Unhealthy.gauge_value(), 0.0);
    }
}
