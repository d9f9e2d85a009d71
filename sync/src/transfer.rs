//! Bounded-concurrency transfer engine.
//!
//! One control loop owns the pending queue, the in-flight set, and the
//! concurrency cap. Units never share mutable state, so no locking is needed:
//! every outcome is classified and acted on by the loop itself.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use crag_config::TransferSettings;
use crag_providers::ProviderError;
use crag_providers::retry::{RetryConfig, calculate_retry_delay};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

/// Classified outcome of one attempt at a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T, O> {
    /// Terminal success.
    Done(O),
    /// Phase complete; continue with a fresh unit carrying the same index.
    Next(T),
    /// The service throttled the request.
    RateLimited(String),
    /// Network failure or server-side error.
    Transient(String),
    /// Rejected in a way that one retry under the alternate mode may fix.
    AlternateMode(String),
    /// Terminal failure.
    Failed(String),
}

impl<T, O> From<ProviderError> for Attempt<T, O> {
    fn from(error: ProviderError) -> Self {
        let message = error.to_string();
        match error {
            ProviderError::RateLimited(_) => Self::RateLimited(message),
            ProviderError::Transport(_) | ProviderError::Server { .. } => Self::Transient(message),
            ref e if e.is_invalid_extension() => Self::AlternateMode(message),
            _ => Self::Failed(message),
        }
    }
}

/// One queued piece of work and its attempt bookkeeping.
#[derive(Debug, Clone)]
pub struct TransferUnit<T> {
    pub index: usize,
    pub item: T,
    pub retries: u32,
    pub alternate: bool,
    pub throttled: u32,
}

impl<T> TransferUnit<T> {
    fn new(index: usize, item: T) -> Self {
        Self {
            index,
            item,
            retries: 0,
            alternate: false,
            throttled: 0,
        }
    }

    fn attempts_exhausted(&self, max_retries: u32) -> bool {
        self.retries + self.throttled > max_retries
    }
}

/// Terminal result for the input item at `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult<O> {
    pub index: usize,
    pub outcome: Result<O, String>,
}

impl<O> TransferResult<O> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }
}

/// Results in input order, plus the cap the run ended with.
#[derive(Debug, Clone)]
pub struct TransferReport<O> {
    pub results: Vec<TransferResult<O>>,
    pub final_concurrency: usize,
}

impl<O> TransferReport<O> {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &str)> {
        self.results
            .iter()
            .filter_map(|r| r.error().map(|e| (r.index, e)))
    }
}

#[derive(Debug, Clone)]
pub struct TransferEngine {
    max_concurrency: usize,
    max_retries: u32,
    backoff: RetryConfig,
    poll_interval: Duration,
    deadline: Option<Duration>,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::from_settings(&TransferSettings::default())
    }
}

impl TransferEngine {
    #[must_use]
    pub fn new(max_concurrency: usize, max_retries: u32) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            max_retries,
            backoff: RetryConfig::default(),
            poll_interval: Duration::from_millis(100),
            deadline: None,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &TransferSettings) -> Self {
        Self::new(settings.max_concurrency, settings.max_retries)
            .with_poll_interval(settings.poll_interval)
            .with_deadline(settings.deadline)
    }

    /// Delay schedule for requeued units. `max_retries` here is ignored; the
    /// engine's own bound applies.
    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        calculate_retry_delay(attempt.saturating_sub(1), &self.backoff, None)
    }

    /// Drive every item to a terminal result.
    ///
    /// `execute(item, alternate)` performs one attempt. `on_progress(done,
    /// total)` fires exactly once per item, when it resolves. The batch never
    /// aborts early; failures are reported per item.
    pub async fn run<T, O, F, Fut, P>(
        &self,
        items: Vec<T>,
        execute: F,
        mut on_progress: P,
    ) -> TransferReport<O>
    where
        T: Clone,
        F: Fn(T, bool) -> Fut,
        Fut: Future<Output = Attempt<T, O>>,
        P: FnMut(usize, usize),
    {
        let total = items.len();
        let mut outcomes: Vec<Option<Result<O, String>>> = (0..total).map(|_| None).collect();
        let mut pending: VecDeque<(TransferUnit<T>, Duration)> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| (TransferUnit::new(index, item), Duration::ZERO))
            .collect();
        let mut active = FuturesUnordered::new();
        let mut cap = self.max_concurrency;
        let mut completed = 0;
        let started = Instant::now();

        let mut resolve = |index: usize,
                           outcome: Result<O, String>,
                           outcomes: &mut [Option<Result<O, String>>]| {
            outcomes[index] = Some(outcome);
            completed += 1;
            on_progress(completed, total);
        };

        loop {
            if self.deadline.is_some_and(|limit| started.elapsed() >= limit) {
                warn!(
                    unresolved = outcomes.iter().filter(|o| o.is_none()).count(),
                    "Transfer deadline exceeded; abandoning remaining units"
                );
                break;
            }

            while active.len() < cap
                && let Some((unit, delay)) = pending.pop_front()
            {
                active.push(attempt(unit, delay, &execute));
            }
            if active.is_empty() {
                break;
            }

            let Ok(Some((mut unit, outcome))) = timeout(self.poll_interval, active.next()).await
            else {
                continue;
            };

            match outcome {
                Attempt::Done(output) => resolve(unit.index, Ok(output), &mut outcomes),
                Attempt::Next(item) => {
                    debug!(index = unit.index, "Unit advanced to next phase");
                    pending.push_back((TransferUnit::new(unit.index, item), Duration::ZERO));
                }
                Attempt::RateLimited(message) => {
                    let halved = (cap / 2).max(1);
                    if halved < cap {
                        warn!(cap = halved, "Rate limited; reducing concurrency");
                        cap = halved;
                    }
                    unit.throttled += 1;
                    if unit.attempts_exhausted(self.max_retries) {
                        resolve(unit.index, Err(message), &mut outcomes);
                    } else {
                        let delay = self.backoff_delay(unit.throttled);
                        pending.push_back((unit, delay));
                    }
                }
                Attempt::Transient(message) => {
                    unit.retries += 1;
                    if unit.attempts_exhausted(self.max_retries) {
                        warn!(index = unit.index, error = %message, "Retries exhausted");
                        resolve(unit.index, Err(message), &mut outcomes);
                    } else {
                        debug!(index = unit.index, retry_count = unit.retries, error = %message, "Requeueing unit");
                        let delay = self.backoff_delay(unit.retries);
                        pending.push_back((unit, delay));
                    }
                }
                Attempt::AlternateMode(message) => {
                    if unit.alternate {
                        resolve(unit.index, Err(message), &mut outcomes);
                    } else {
                        debug!(index = unit.index, "Retrying unit in alternate mode");
                        unit.alternate = true;
                        pending.push_back((unit, Duration::ZERO));
                    }
                }
                Attempt::Failed(message) => resolve(unit.index, Err(message), &mut outcomes),
            }
        }

        drop(active);
        let unresolved: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.is_none().then_some(index))
            .collect();
        for index in unresolved {
            resolve(index, Err("deadline exceeded".to_string()), &mut outcomes);
        }

        let results = outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.map(|outcome| TransferResult { index, outcome }))
            .collect();
        TransferReport {
            results,
            final_concurrency: cap,
        }
    }
}

async fn attempt<T, O, F, Fut>(
    unit: TransferUnit<T>,
    delay: Duration,
    execute: &F,
) -> (TransferUnit<T>, Attempt<T, O>)
where
    T: Clone,
    F: Fn(T, bool) -> Fut,
    Fut: Future<Output = Attempt<T, O>>,
{
    if !delay.is_zero() {
        sleep(delay).await;
    }
    let outcome = execute(unit.item.clone(), unit.alternate).await;
    (unit, outcome)
}
