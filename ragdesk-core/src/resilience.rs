//! Retry with exponential backoff for remote calls.
//!
//! A [`RetryPolicy`] wraps any fallible async operation together with a classifier that
//! decides whether a failure is transient. Transient failures are retried after an
//! exponentially growing, capped and jittered delay; fatal failures surface after a single
//! call. Every retry is reported through a callback so callers can surface it as a
//! diagnostic, but the policy itself never touches application state.
//!
//! Cancellation is cooperative: the token is checked before each attempt and raced against
//! every backoff sleep.

use crate::error::{FailureClass, RemoteError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff parameters for one family of remote calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of calls, including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: u64,
    /// Scale each delay by a random factor below one.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2,
            jitter: true,
        }
    }
}

/// Diagnostic emitted before sleeping ahead of the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEvent {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub delay: Duration,
    pub reason: String,
}

/// A successful result plus the number of calls it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError<E> {
    #[error("{error}")]
    Fatal { error: E, attempts: u32 },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { last: E, attempts: u32 },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    pub fn map<F, U>(self, f: F) -> RetryError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            RetryError::Fatal { error, attempts } => RetryError::Fatal {
                error: f(error),
                attempts,
            },
            RetryError::Exhausted { last, attempts } => RetryError::Exhausted {
                last: f(last),
                attempts,
            },
            RetryError::Cancelled { attempts } => RetryError::Cancelled { attempts },
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without sleeping. Handy for offline runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1,
            jitter: false,
        }
    }

    /// Un-jittered delays before each retry, in order: the initial delay, then growing by
    /// `multiplier`, capped at `max_delay_ms`.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> {
        let max_delay = Duration::from_millis(self.max_delay_ms);
        let growth =
            ExponentialBackoff::from_millis(self.multiplier.max(1)).factor(self.initial_delay_ms);

        std::iter::once(Duration::from_millis(self.initial_delay_ms))
            .chain(growth)
            .map(move |delay| delay.min(max_delay))
    }

    fn delays(&self) -> impl Iterator<Item = Duration> {
        let jittered = self.jitter;
        self.schedule()
            .map(move |delay| if jittered { jitter(delay) } else { delay })
    }

    /// Runs `op` with the default classifier for [`RemoteError`].
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<Attempted<T>, RetryError<RemoteError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.run_with(cancel, RemoteError::failure_class, |_| {}, op)
            .await
    }

    /// Runs `op` until it succeeds, fails fatally, exhausts the attempt cap, or is cancelled.
    ///
    /// `classify` decides the fate of each failure and `on_retry` is invoked once per
    /// scheduled retry, before the backoff sleep starts.
    pub async fn run_with<T, E, F, Fut, C, O>(
        &self,
        cancel: &CancellationToken,
        classify: C,
        mut on_retry: O,
        mut op: F,
    ) -> Result<Attempted<T>, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureClass,
        O: FnMut(RetryEvent),
    {
        let cap = self.max_attempts.max(1);
        let mut attempts = 0;
        let mut delays = self.delays();

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts });
            }

            attempts += 1;
            let error = match op().await {
                Ok(value) => return Ok(Attempted { value, attempts }),
                Err(error) => error,
            };

            if classify(&error) == FailureClass::Fatal {
                debug!(attempts, error = %error, "Fatal failure, not retrying");
                return Err(RetryError::Fatal { error, attempts });
            }

            if attempts >= cap {
                warn!(attempts, error = %error, "Retry attempts exhausted");
                return Err(RetryError::Exhausted {
                    last: error,
                    attempts,
                });
            }

            let delay = delays.next().unwrap_or_default();
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );
            on_retry(RetryEvent {
                attempt: attempts,
                delay,
                reason: error.to_string(),
            });

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
