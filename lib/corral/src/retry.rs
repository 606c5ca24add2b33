// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded retries for calls to external services.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use corral_config::RetryConfig;
use slog::{info, warn, Logger};

use crate::services::ServiceError;

/// What a follow-up query says about a non-idempotent call whose result was
/// lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The call took effect despite the error.
    Completed,

    /// The call had no effect and may be reissued.
    NotApplied,
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_interval: Duration,
    max_interval: Duration,
    multiplier: f64,
    step_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_interval: config.initial_interval(),
            max_interval: config.max_interval(),
            multiplier: config.multiplier,
            step_timeout: config.step_timeout(),
        }
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Makes one call, bounded by the step timeout.
    pub async fn once<T, Fut>(&self, call: Fut) -> Result<T, ServiceError>
    where
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        match tokio::time::timeout(self.step_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(self.step_timeout)),
        }
    }

    /// Calls `op` until it succeeds, fails permanently, or runs out of
    /// attempts. Only safe for calls that may be repeated.
    pub async fn idempotent<T, F, Fut>(
        &self,
        log: &Logger,
        what: &'static str,
        mut op: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 0;
        let max_attempts = self.max_attempts;
        let step_timeout = self.step_timeout;
        backoff::future::retry(self.backoff(), || {
            attempt += 1;
            let attempt = attempt;
            let call = tokio::time::timeout(step_timeout, op());
            async move {
                let err = match call.await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(e)) => e,
                    Err(_) => ServiceError::Timeout(step_timeout),
                };
                if err.is_transient() && attempt < max_attempts {
                    warn!(log, "retrying failed call";
                          "call" => what,
                          "attempt" => attempt,
                          "error" => %err);
                    Err(backoff::Error::transient(err))
                } else {
                    warn!(log, "call failed";
                          "call" => what,
                          "attempt" => attempt,
                          "error" => %err);
                    Err(backoff::Error::permanent(err))
                }
            }
        })
        .await
    }

    /// Issues a call that must not be repeated blindly.
    ///
    /// If the call fails, `verify` is asked (with retries) whether it took
    /// effect anyway. A call that completed is reported as success; one that
    /// did not is reissued only if its error was transient and attempts
    /// remain. If the remote state cannot be established the original error
    /// is returned. Reissues are spaced by the same backoff as
    /// [`RetryPolicy::idempotent`].
    pub async fn non_idempotent<F, Fut, V, VFut>(
        &self,
        log: &Logger,
        what: &'static str,
        mut call: F,
        mut verify: V,
    ) -> Result<(), ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), ServiceError>>,
        V: FnMut() -> VFut,
        VFut: Future<Output = Result<RemoteOutcome, ServiceError>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.once(call()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            warn!(log, "non-idempotent call failed, checking remote state";
                  "call" => what,
                  "attempt" => attempt,
                  "error" => %err);

            match self.idempotent(log, "verify", &mut verify).await {
                Ok(RemoteOutcome::Completed) => {
                    info!(log, "call took effect despite error";
                          "call" => what);
                    return Ok(());
                }
                Ok(RemoteOutcome::NotApplied)
                    if err.is_transient() && attempt < self.max_attempts =>
                {
                    let pause =
                        backoff.next_backoff().unwrap_or(self.max_interval);
                    tokio::time::sleep(pause).await;
                }
                Ok(RemoteOutcome::NotApplied) => return Err(err),
                Err(verify_err) => {
                    warn!(log, "could not establish remote state";
                          "call" => what,
                          "error" => %verify_err);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts: 3,
            initial_interval_ms: 10,
            max_interval_ms: 100,
            multiplier: 2.0,
            step_timeout_ms: 1000,
        })
    }

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_up_to_the_cap() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = policy()
            .idempotent(&log(), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::Unavailable("down".to_string())) }
            })
            .await;
        assert!(matches!(res, Err(ServiceError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = policy()
            .idempotent(&log(), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::Failed("bad".to_string())) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_calls_time_out() {
        let res: Result<(), _> = policy()
            .idempotent(&log(), "test", || std::future::pending())
            .await;
        assert_eq!(res, Err(ServiceError::Timeout(Duration::from_secs(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let res = policy()
            .idempotent(&log(), "test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ServiceError::Timeout(Duration::ZERO))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(res, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn non_idempotent_calls_check_before_reissuing() {
        let calls = AtomicU32::new(0);
        let res = policy()
            .non_idempotent(
                &log(),
                "migrate",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ServiceError::Timeout(Duration::ZERO)) }
                },
                || async { Ok(RemoteOutcome::Completed) },
            )
            .await;
        assert_eq!(res, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "never reissued");

        let calls = AtomicU32::new(0);
        let res = policy()
            .non_idempotent(
                &log(),
                "migrate",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ServiceError::Timeout(Duration::ZERO)) }
                },
                || async { Ok(RemoteOutcome::NotApplied) },
            )
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reissues_back_off_like_retries() {
        // Three attempts pause twice: about 10ms then about 20ms, each
        // jittered by up to half.
        let start = tokio::time::Instant::now();
        let res = policy()
            .non_idempotent(
                &log(),
                "migrate",
                || async { Err(ServiceError::Unavailable("busy".to_string())) },
                || async { Ok(RemoteOutcome::NotApplied) },
            )
            .await;
        assert!(res.is_err());
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(15), "{waited:?}");
        assert!(waited <= Duration::from_millis(45), "{waited:?}");

        let start = tokio::time::Instant::now();
        let res: Result<(), _> = policy()
            .idempotent(&log(), "test", || async {
                Err(ServiceError::Unavailable("busy".to_string()))
            })
            .await;
        assert!(res.is_err());
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(15), "{waited:?}");
        assert!(waited <= Duration::from_millis(45), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn non_idempotent_permanent_failures_are_not_reissued() {
        let calls = AtomicU32::new(0);
        let res = policy()
            .non_idempotent(
                &log(),
                "rebuild",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ServiceError::Failed("disk".to_string())) }
                },
                || async { Ok(RemoteOutcome::NotApplied) },
            )
            .await;
        assert_eq!(res, Err(ServiceError::Failed("disk".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
