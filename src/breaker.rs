/// Circuit breaker de admissão de requisições
/// Estado protegido por um único mutex: toda transição é atômica
/// em relação às demais chamadas concorrentes
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BreakerError {
    #[error("circuit breaker interval must be greater than zero")]
    ZeroInterval,
    #[error("circuit breaker threshold must be greater than zero")]
    ZeroThreshold,
}

/// Resultado da admissão; `Trial` é a única requisição liberada em half-open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Rejected,
    Admitted,
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failures: u32,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct Breaker {
    threshold: u32,
    interval: Duration,
    inner: Mutex<Inner>,
}

type Transition = (BreakerState, BreakerState);

impl Breaker {
    pub fn new(interval: Duration, threshold: u32) -> Result<Self, BreakerError> {
        if interval.is_zero() {
            return Err(BreakerError::ZeroInterval);
        }
        if threshold == 0 {
            return Err(BreakerError::ZeroThreshold);
        }
        Ok(Self {
            threshold,
            interval,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                window_start: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let g = self.lock();
        BreakerSnapshot {
            state: g.state,
            failures: g.failures,
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn admit(&self) -> Admission {
        self.admit_at(Instant::now())
    }

    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        self.admit_at(now) != Admission::Rejected
    }

    /// Decide se a requisição pode seguir, e se ela é a tentativa do half-open
    /// Em Open, o intervalo é reavaliado a cada chamada (sem timer em background)
    pub fn admit_at(&self, now: Instant) -> Admission {
        let (admission, transition) = {
            let mut g = self.lock();
            let state = g.state;
            match state {
                BreakerState::Closed => (Admission::Admitted, None),
                BreakerState::Open => {
                    let expired = g
                        .opened_at
                        .is_none_or(|at| now.saturating_duration_since(at) >= self.interval);
                    if expired {
                        g.opened_at = None;
                        g.trial_in_flight = true;
                        (
                            Admission::Trial,
                            Some(Self::move_to(&mut g, BreakerState::HalfOpen)),
                        )
                    } else {
                        (Admission::Rejected, None)
                    }
                }
                BreakerState::HalfOpen => {
                    if g.trial_in_flight {
                        (Admission::Rejected, None)
                    } else {
                        g.trial_in_flight = true;
                        (Admission::Trial, None)
                    }
                }
            }
        };
        if let Some(t) = transition {
            self.record(t);
        }
        admission
    }

    pub fn on_success(&self) {
        let transition = {
            let mut g = self.lock();
            let state = g.state;
            match state {
                BreakerState::HalfOpen => {
                    g.trial_in_flight = false;
                    Some(Self::move_to(&mut g, BreakerState::Closed))
                }
                BreakerState::Closed | BreakerState::Open => None,
            }
        };
        if let Some(t) = transition {
            self.record(t);
        }
    }

    pub fn on_failure_at(&self, now: Instant) {
        let transition = {
            let mut g = self.lock();
            let state = g.state;
            match state {
                BreakerState::Closed => {
                    // janela de contagem: falhas mais antigas que `interval` não contam
                    let fresh_window = g
                        .window_start
                        .is_none_or(|start| now.saturating_duration_since(start) >= self.interval);
                    if fresh_window {
                        g.failures = 0;
                        g.window_start = Some(now);
                    }
                    g.failures += 1;
                    if g.failures >= self.threshold {
                        g.opened_at = Some(now);
                        Some(Self::move_to(&mut g, BreakerState::Open))
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen => {
                    g.trial_in_flight = false;
                    g.opened_at = Some(now);
                    Some(Self::move_to(&mut g, BreakerState::Open))
                }
                BreakerState::Open => None,
            }
        };
        if let Some(t) = transition {
            self.record(t);
        }
    }

    fn move_to(g: &mut Inner, to: BreakerState) -> Transition {
        let from = g.state;
        g.state = to;
        if matches!(to, BreakerState::Closed | BreakerState::Open) {
            g.failures = 0;
            g.window_start = None;
        }
        (from, to)
    }

    fn record(&self, (from, to): Transition) {
        match to {
            BreakerState::Open => warn!(
                from = from.as_str(),
                cooldown_ms = self.interval.as_millis() as u64,
                "circuit breaker opened"
            ),
            _ => info!(from = from.as_str(), to = to.as_str(), "circuit breaker transition"),
        }
        metrics::gauge!("circuit_breaker_state").set(to.gauge_value());
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
