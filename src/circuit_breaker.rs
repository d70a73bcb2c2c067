use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        atomic::{
            AtomicU8,
            Ordering,
        },
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    clock::{Clock, to_delta},
    config::CircuitBreakerConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    /// Gauge encoding: closed 0, open 1, half-open 2.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker in front of the rate limit store.
///
/// Transitions happen under one mutex that is never held across an await;
/// `state()` reads a mirrored atomic and never waits on it.
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
    observed: AtomicU8,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
    half_open_in_flight: u32,
    // bumped on every entry into HalfOpen so stale permits cannot touch a
    // later probing round
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
enum BreakerPhase {
    Closed,
    Open { since: DateTime<Utc> },
    HalfOpen,
}

impl BreakerPhase {
    fn state(&self) -> CircuitState {
        match self {
            Self::Closed => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

/// Admission to make one store call.
///
/// Settle it with [`BreakerPermit::succeeded`] or [`BreakerPermit::failed`].
/// A permit dropped unsettled (the caller was cancelled) hands its probe slot
/// back without counting as either outcome.
#[must_use = "an unsettled permit records nothing"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: Option<u64>,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled
            && let Some(generation) = self.probe
        {
            self.breaker.release_probe(generation);
        }
    }
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            clock,
            state: Mutex::new(BreakerState {
                phase: BreakerPhase::Closed,
                consecutive_failures: 0,
                half_open_in_flight: 0,
                generation: 0,
            }),
            observed: AtomicU8::new(CircuitState::Closed.as_u8()),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.observed.load(Ordering::Acquire))
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, state: &mut BreakerState, phase: BreakerPhase) {
        let next = phase.state();
        state.phase = phase;
        state.consecutive_failures = 0;
        state.half_open_in_flight = 0;
        if next == CircuitState::HalfOpen {
            state.generation += 1;
        }
        self.observed.store(next.as_u8(), Ordering::Release);
        match next {
            CircuitState::Open => tracing::warn!(
                recovery_timeout_ms = self.cfg.recovery_timeout.as_millis() as u64,
                "rate limit store circuit opened"
            ),
            CircuitState::HalfOpen => tracing::info!("rate limit store circuit half-open; probing"),
            CircuitState::Closed => tracing::info!("rate limit store circuit closed"),
        }
    }

    /// Permit for one store call, or `None` while the circuit is open or all
    /// half-open probe slots are taken.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut state = self.lock();
        let now = self.clock.now();

        let phase = state.phase;
        let probe = match phase {
            BreakerPhase::Closed => None,
            BreakerPhase::Open { since } => {
                let recovered = since
                    .checked_add_signed(to_delta(self.cfg.recovery_timeout))
                    .is_some_and(|at| now >= at);
                if !recovered {
                    return None;
                }
                self.transition(&mut state, BreakerPhase::HalfOpen);
                state.half_open_in_flight = 1;
                Some(state.generation)
            }
            BreakerPhase::HalfOpen => {
                if state.half_open_in_flight >= self.cfg.half_open_max_requests {
                    return None;
                }
                state.half_open_in_flight += 1;
                Some(state.generation)
            }
        };

        Some(BreakerPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn is_current_probe(state: &BreakerState, probe: Option<u64>) -> bool {
        matches!(state.phase, BreakerPhase::HalfOpen) && probe == Some(state.generation)
    }

    fn on_success(&self, probe: Option<u64>) {
        let mut state = self.lock();
        let current_probe = Self::is_current_probe(&state, probe);
        let phase = state.phase;
        match phase {
            BreakerPhase::Closed => state.consecutive_failures = 0,
            BreakerPhase::HalfOpen if current_probe => {
                self.transition(&mut state, BreakerPhase::Closed);
            }
            // late results from calls admitted before the circuit opened
            // do not shortcut the recovery timeout
            BreakerPhase::HalfOpen | BreakerPhase::Open { .. } => {}
        }
    }

    fn on_failure(&self, probe: Option<u64>) {
        let mut state = self.lock();
        let now = self.clock.now();
        let current_probe = Self::is_current_probe(&state, probe);
        let phase = state.phase;

        match phase {
            BreakerPhase::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.cfg.failure_threshold {
                    self.transition(&mut state, BreakerPhase::Open { since: now });
                }
            }
            BreakerPhase::HalfOpen if current_probe => {
                self.transition(&mut state, BreakerPhase::Open { since: now });
            }
            BreakerPhase::HalfOpen | BreakerPhase::Open { .. } => {}
        }
    }

    fn release_probe(&self, generation: u64) {
        let mut state = self.lock();
        if Self::is_current_probe(&state, Some(generation)) {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }
}
