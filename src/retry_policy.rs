// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Defines the retry policies for whole-operation attempts.
//!
//! These policies govern restarting an operation from its last confirmed
//! state (e.g. re-running an upload attempt after a connection reset). The
//! policies for resuming an already-started stream live in
//! [resume_policy][crate::resume_policy].

use crate::backoff_policy::BackoffPolicy;
use crate::error::rpc::Code;
use crate::{Error, Result};
use std::sync::Arc;

/// The result of a retry policy decision.
#[derive(Debug)]
pub enum RetryResult {
    /// The error is retryable, continue the loop.
    Continue(Error),
    /// The error is retryable, but the policy is out of budget.
    Exhausted(Error),
    /// The error is not retryable.
    Permanent(Error),
}

/// The state of a retry loop, passed to the policy on each error.
#[derive(Debug, Default)]
pub struct RetryState {
    /// The number of attempts that have already failed.
    pub attempt_count: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn set_attempt_count(mut self, v: u32) -> Self {
        self.attempt_count = v;
        self
    }
}

/// Determines whether a failed attempt should be retried.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    fn on_error(&self, state: &RetryState, error: Error) -> RetryResult;
}

/// Extension trait for [RetryPolicy].
pub trait RetryPolicyExt: Sized {
    /// Decorates a policy to stop after a fixed number of attempts.
    fn with_attempt_limit(self, maximum_attempts: u32) -> LimitedAttemptCount<Self> {
        LimitedAttemptCount::new(self, maximum_attempts)
    }
}
impl<T: RetryPolicy> RetryPolicyExt for T {}

/// The recommended baseline policy.
///
/// Continues on errors that are transient by nature: I/O failures, timeouts,
/// and the transient service codes. Failures to *observe* a success (a
/// malformed success-shaped response) are also treated as retryable, since
/// the underlying operation did not fail; the parse error stays attached as
/// the cause.
#[derive(Debug)]
pub struct TransientErrors;

impl RetryPolicy for TransientErrors {
    fn on_error(&self, _state: &RetryState, error: Error) -> RetryResult {
        match error {
            e if self::is_transient(&e) => RetryResult::Continue(e),
            e => RetryResult::Permanent(e),
        }
    }
}

fn is_transient(error: &Error) -> bool {
    match error {
        e if e.is_io() => true,
        e if e.is_timeout() => true,
        e if e.is_deserialization() => true,
        e => e.status().is_some_and(|s| is_transient_code(s.code)),
    }
}

fn is_transient_code(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::ResourceExhausted | Code::Internal | Code::DeadlineExceeded
    )
}

/// Decorates a retry policy to stop after a fixed number of attempts.
#[derive(Debug)]
pub struct LimitedAttemptCount<P> {
    inner: P,
    maximum_attempts: u32,
}

impl<P> LimitedAttemptCount<P> {
    pub fn new(inner: P, maximum_attempts: u32) -> Self {
        Self {
            inner,
            maximum_attempts,
        }
    }
}

impl<P> RetryPolicy for LimitedAttemptCount<P>
where
    P: RetryPolicy,
{
    fn on_error(&self, state: &RetryState, error: Error) -> RetryResult {
        match self.inner.on_error(state, error) {
            RetryResult::Continue(e) if state.attempt_count + 1 >= self.maximum_attempts => {
                RetryResult::Exhausted(e)
            }
            result => result,
        }
    }
}

/// Drives an attempt function through the retry and backoff policies.
pub(crate) async fn retry_loop<T, F>(
    mut attempt: F,
    retry: Arc<dyn RetryPolicy>,
    backoff: Arc<dyn BackoffPolicy>,
) -> Result<T>
where
    F: AsyncFnMut(u32) -> Result<T>,
{
    let mut state = RetryState::new();
    loop {
        match attempt(state.attempt_count).await {
            Ok(value) => return Ok(value),
            Err(e) => match retry.on_error(&state, e) {
                RetryResult::Continue(e) => {
                    state.attempt_count += 1;
                    let delay = backoff.on_failure(state.attempt_count);
                    tracing::debug!("attempt {} failed, backing off {delay:?}: {e}", state.attempt_count);
                    tokio::time::sleep(delay).await;
                }
                RetryResult::Exhausted(e) => return Err(Error::exhausted(e)),
                RetryResult::Permanent(e) => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff_policy::ExponentialBackoff;
    use crate::error::rpc::Status;
    use std::time::Duration;

    fn transient() -> Error {
        Error::io("connection reset")
    }

    fn permanent() -> Error {
        Error::service(Status::new(Code::PermissionDenied, "nope"))
    }

    #[test]
    fn transient_errors_policy() {
        let p = TransientErrors;
        let r = p.on_error(&RetryState::new(), transient());
        assert!(matches!(r, RetryResult::Continue(_)), "{r:?}");
        let r = p.on_error(&RetryState::new(), Error::timeout("deadline"));
        assert!(matches!(r, RetryResult::Continue(_)), "{r:?}");
        let r = p.on_error(&RetryState::new(), Error::deser("bad body on 200"));
        assert!(matches!(r, RetryResult::Continue(_)), "{r:?}");
        let r = p.on_error(
            &RetryState::new(),
            Error::service(Status::new(Code::Unavailable, "retry me")),
        );
        assert!(matches!(r, RetryResult::Continue(_)), "{r:?}");
        let r = p.on_error(&RetryState::new(), permanent());
        assert!(matches!(r, RetryResult::Permanent(_)), "{r:?}");
        let r = p.on_error(&RetryState::new(), Error::ser("bad payload"));
        assert!(matches!(r, RetryResult::Permanent(_)), "{r:?}");
    }

    #[test]
    fn attempt_limit() {
        let p = TransientErrors.with_attempt_limit(3);
        let r = p.on_error(&RetryState::new(), transient());
        assert!(matches!(r, RetryResult::Continue(_)), "{r:?}");
        let r = p.on_error(&RetryState::new().set_attempt_count(1), transient());
        assert!(matches!(r, RetryResult::Continue(_)), "{r:?}");
        let r = p.on_error(&RetryState::new().set_attempt_count(2), transient());
        assert!(matches!(r, RetryResult::Exhausted(_)), "{r:?}");
        let r = p.on_error(&RetryState::new().set_attempt_count(5), permanent());
        assert!(matches!(r, RetryResult::Permanent(_)), "{r:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn loop_retries_then_succeeds() -> anyhow::Result<()> {
        let retry: Arc<dyn RetryPolicy> = Arc::new(TransientErrors.with_attempt_limit(5));
        let backoff: Arc<dyn BackoffPolicy> = Arc::new(ExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(1),
            1.0,
        ));
        let got = retry_loop(
            async |attempt| {
                if attempt < 2 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            },
            retry,
            backoff,
        )
        .await?;
        assert_eq!(got, 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exhausts() {
        let retry: Arc<dyn RetryPolicy> = Arc::new(TransientErrors.with_attempt_limit(2));
        let backoff: Arc<dyn BackoffPolicy> = Arc::new(ExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(1),
            1.0,
        ));
        let got = retry_loop::<u32, _>(async |_| Err(transient()), retry, backoff).await;
        let err = got.unwrap_err();
        assert!(err.is_exhausted(), "{err:?}");
    }

    #[tokio::test]
    async fn loop_permanent() {
        let retry: Arc<dyn RetryPolicy> = Arc::new(TransientErrors.with_attempt_limit(2));
        let backoff: Arc<dyn BackoffPolicy> =
            Arc::new(ExponentialBackoff::new(Duration::ZERO, Duration::ZERO, 1.0));
        let got = retry_loop::<u32, _>(async |_| Err(permanent()), retry, backoff).await;
        let err = got.unwrap_err();
        assert!(err.status().is_some(), "{err:?}");
    }
}
