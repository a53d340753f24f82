//! Bounded retries with capped, jittered exponential backoff
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Attempting(n) --ok--> done
//! Attempting(n) --permanent--> Fatal
//! Attempting(n) --transient, n < max--> Waiting(n, delay) --sleep--> Attempting(n+1)
//! Attempting(n) --transient, n = max--> Exhausted
//! ```
//!
//! Time comes from an injected [`Clock`], so tests drive the loop with
//! [`ManualClock`] and observe every requested delay. A [`RunDeadline`] turns
//! a wait that would end past the deadline, or an attempt started after it,
//! into [`RetryError::TimedOut`].

use crate::store::RemoteError;
use async_trait::async_trait;
use hl7_common::IngestError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_JITTER: f64 = 0.2;

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for RemoteError {
    fn is_transient(&self) -> bool {
        RemoteError::is_transient(self)
    }
}

impl Retryable for IngestError {
    fn is_transient(&self) -> bool {
        IngestError::is_transient(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra fraction added to each delay, in [0, 1)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Delay after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt-1) * (1 + U[0, jitter))`, capped at `max_delay`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);

        let factor = if self.jitter > 0.0 {
            1.0 + rng.gen_range(0.0..self.jitter)
        } else {
            1.0
        };

        exponential.mul_f64(factor).min(self.max_delay)
    }
}

#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio's timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: `sleep` returns at once, advances virtual time and
/// records the requested delay
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }

    /// Every delay requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        self.advance(duration);
    }
}

/// Run-level deadline shared by every retrier of a run. Unarmed until a run
/// starts; each run arms it afresh.
#[derive(Debug, Clone, Default)]
pub struct RunDeadline {
    at: Arc<Mutex<Option<Instant>>>,
}

impl RunDeadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deadline, returning the one it replaces
    pub fn arm(&self, at: Instant) -> Option<Instant> {
        self.at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(at)
    }

    /// Clear the deadline, returning the one it held
    pub fn disarm(&self) -> Option<Instant> {
        self.at.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn at(&self) -> Option<Instant> {
        *self.at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn passed(&self, instant: Instant) -> bool {
        self.at().is_some_and(|deadline| instant >= deadline)
    }

    fn exceeded_by(&self, instant: Instant) -> bool {
        self.at().is_some_and(|deadline| instant > deadline)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("run deadline reached after {attempts} attempts")]
    TimedOut { attempts: u32, last: Option<E> },

    #[error("{error}")]
    Fatal { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::TimedOut { attempts, .. }
            | RetryError::Fatal { attempts, .. } => *attempts,
        }
    }

    /// Transient errors that ran out of attempts, as opposed to permanent
    /// errors and deadline expiry
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn into_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::TimedOut { last, .. } => last,
            RetryError::Fatal { error, .. } => Some(error),
        }
    }
}

#[derive(Debug)]
enum RetryState<E> {
    Attempting { attempt: u32 },
    Waiting { attempt: u32, delay: Duration, last: E },
    Exhausted { attempts: u32, last: E },
}

/// Runs fallible async operations under a [`BackoffPolicy`]
#[derive(Debug)]
pub struct Retrier {
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
    deadline: RunDeadline,
    rng: Mutex<StdRng>,
}

impl Retrier {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            clock: Arc::new(TokioClock),
            deadline: RunDeadline::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_deadline(mut self, deadline: RunDeadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Seed the jitter source
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn deadline(&self) -> &RunDeadline {
        &self.deadline
    }

    /// Run `op` until it succeeds, fails permanently, exhausts the attempt
    /// ceiling or hits the run deadline. `op` receives the 1-based attempt.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut state = RetryState::Attempting { attempt: 1 };

        loop {
            state = match state {
                RetryState::Attempting { attempt } => {
                    if self.deadline.passed(self.clock.now()) {
                        return Err(RetryError::TimedOut {
                            attempts: attempt - 1,
                            last: None,
                        });
                    }

                    match op(attempt).await {
                        Ok(value) => {
                            if attempt > 1 {
                                debug!(label, attempt, "Succeeded after retry");
                            }
                            return Ok(value);
                        },
                        Err(error) if !error.is_transient() => {
                            return Err(RetryError::Fatal {
                                attempts: attempt,
                                error,
                            });
                        },
                        Err(last) if attempt >= self.policy.max_attempts => {
                            RetryState::Exhausted {
                                attempts: attempt,
                                last,
                            }
                        },
                        Err(last) => RetryState::Waiting {
                            attempt,
                            delay: self.next_delay(attempt),
                            last,
                        },
                    }
                },
                RetryState::Waiting {
                    attempt,
                    delay,
                    last,
                } => {
                    if self.deadline.exceeded_by(self.clock.now() + delay) {
                        warn!(label, attempt, error = %last, "Run deadline reached, not retrying");
                        return Err(RetryError::TimedOut {
                            attempts: attempt,
                            last: Some(last),
                        });
                    }

                    warn!(
                        label,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %last,
                        "Transient failure, backing off"
                    );
                    self.clock.sleep(delay).await;
                    RetryState::Attempting {
                        attempt: attempt + 1,
                    }
                },
                RetryState::Exhausted { attempts, last } => {
                    warn!(label, attempts, error = %last, "Retries exhausted");
                    return Err(RetryError::Exhausted { attempts, last });
                },
            };
        }
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        self.policy.delay_for(attempt, &mut *rng)
    }
}
