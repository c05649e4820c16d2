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

//! Defines the resume policies for in-flight streams.
//!
//! Even if a stream starts successfully, it may fail after it starts. The
//! engine can automatically reopen the stream and resume the pending ranges
//! (reads) or the unconfirmed suffix (writes). The traits and types in this
//! module let applications control which errors are resumable and how many
//! interruptions are tolerated.
//!
//! Server-issued redirects are a special case: they are expected conditions,
//! resumed regardless of the inner policy, but only up to a bounded number of
//! attempts; past the bound they surface as an unavailable-class, exhausted
//! error.

use crate::Error;

pub use crate::retry_policy::RetryResult as ResumeResult;

/// The inputs into a resume policy query.
#[derive(Debug)]
#[non_exhaustive]
pub struct ResumeQuery {
    /// The number of times the stream has been interrupted already.
    pub attempt_count: u32,
}

impl ResumeQuery {
    pub fn new(attempt_count: u32) -> Self {
        Self { attempt_count }
    }
}

/// Determines if a stream should be reopened after an interruption.
pub trait ResumePolicy: Send + Sync + std::fmt::Debug {
    fn on_error(&self, query: &ResumeQuery, error: Error) -> ResumeResult;
}

impl ResumePolicy for std::sync::Arc<dyn ResumePolicy> {
    fn on_error(&self, query: &ResumeQuery, error: Error) -> ResumeResult {
        self.as_ref().on_error(query, error)
    }
}

/// Extension trait for [ResumePolicy].
pub trait ResumePolicyExt: Sized {
    /// Decorates a [ResumePolicy] to limit the number of resume attempts.
    fn with_attempt_limit(self, maximum_attempts: u32) -> LimitedAttemptCount<Self> {
        LimitedAttemptCount::new(self, maximum_attempts)
    }
}
impl<T: ResumePolicy> ResumePolicyExt for T {}

/// The recommended policy: resume transient interruptions, stop on anything
/// else.
#[derive(Debug)]
pub struct Recommended;

impl ResumePolicy for Recommended {
    fn on_error(&self, _query: &ResumeQuery, error: Error) -> ResumeResult {
        use crate::error::rpc::Code;
        let transient = error.is_io()
            || error.is_timeout()
            || error.status().is_some_and(|s| {
                matches!(
                    s.code,
                    Code::Unavailable
                        | Code::ResourceExhausted
                        | Code::Internal
                        | Code::DeadlineExceeded
                )
            });
        if transient {
            ResumeResult::Continue(error)
        } else {
            ResumeResult::Permanent(error)
        }
    }
}

/// A policy that resumes regardless of the error type.
///
/// Useful in tests, or combined with a very low attempt limit.
#[derive(Debug)]
pub struct AlwaysResume;

impl ResumePolicy for AlwaysResume {
    fn on_error(&self, _query: &ResumeQuery, error: Error) -> ResumeResult {
        ResumeResult::Continue(error)
    }
}

/// A policy that never resumes.
#[derive(Debug)]
pub struct NeverResume;

impl ResumePolicy for NeverResume {
    fn on_error(&self, _query: &ResumeQuery, error: Error) -> ResumeResult {
        ResumeResult::Permanent(error)
    }
}

/// Decorates a resume policy to stop after a fixed number of attempts.
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

impl<P> ResumePolicy for LimitedAttemptCount<P>
where
    P: ResumePolicy,
{
    fn on_error(&self, query: &ResumeQuery, error: Error) -> ResumeResult {
        match self.inner.on_error(query, error) {
            ResumeResult::Continue(e) if query.attempt_count >= self.maximum_attempts => {
                ResumeResult::Exhausted(e)
            }
            result => result,
        }
    }
}

/// Decorates a resume policy to treat redirects as resumable.
///
/// The streaming APIs use errors to redirect sessions between backends.
/// Those errors are not failures from the application's point of view, so
/// this decorator keeps them retryable even when the inner policy would
/// stop, bounded by the configured redirect attempt limit.
#[derive(Debug)]
pub(crate) struct ResumeRedirect<P> {
    inner: P,
    redirect_attempt_limit: u32,
}

impl<P> ResumeRedirect<P> {
    pub(crate) fn new(inner: P, redirect_attempt_limit: u32) -> Self {
        Self {
            inner,
            redirect_attempt_limit,
        }
    }
}

impl<P> ResumePolicy for ResumeRedirect<P>
where
    P: ResumePolicy,
{
    fn on_error(&self, query: &ResumeQuery, error: Error) -> ResumeResult {
        if error.redirect().is_some() {
            return if query.attempt_count < self.redirect_attempt_limit {
                ResumeResult::Continue(error)
            } else {
                ResumeResult::Exhausted(error)
            };
        }
        self.inner.on_error(query, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::rpc::{Code, Redirect, Status};

    fn io_error() -> Error {
        Error::io("stream interrupted")
    }

    fn permanent_error() -> Error {
        Error::service(Status::new(Code::PermissionDenied, "nope"))
    }

    fn redirect_error() -> Error {
        Error::service(
            Status::new(Code::Aborted, "redirected").with_redirect(Redirect {
                routing_token: Some("token".into()),
                handle: None,
            }),
        )
    }

    #[test]
    fn recommended() {
        let p = Recommended;
        let r = p.on_error(&ResumeQuery::new(0), io_error());
        assert!(matches!(r, ResumeResult::Continue(_)), "{r:?}");
        let r = p.on_error(
            &ResumeQuery::new(0),
            Error::service(Status::new(Code::Unavailable, "retry")),
        );
        assert!(matches!(r, ResumeResult::Continue(_)), "{r:?}");
        let r = p.on_error(&ResumeQuery::new(0), permanent_error());
        assert!(matches!(r, ResumeResult::Permanent(_)), "{r:?}");
    }

    #[test]
    fn always_and_never() {
        let r = AlwaysResume.on_error(&ResumeQuery::new(0), permanent_error());
        assert!(matches!(r, ResumeResult::Continue(_)), "{r:?}");
        let r = NeverResume.on_error(&ResumeQuery::new(0), io_error());
        assert!(matches!(r, ResumeResult::Permanent(_)), "{r:?}");
    }

    #[test]
    fn attempt_limit() {
        let p = AlwaysResume.with_attempt_limit(3);
        let r = p.on_error(&ResumeQuery::new(2), io_error());
        assert!(matches!(r, ResumeResult::Continue(_)), "{r:?}");
        let r = p.on_error(&ResumeQuery::new(3), io_error());
        assert!(matches!(r, ResumeResult::Exhausted(_)), "{r:?}");
    }

    #[test]
    fn redirects_resume_past_inner_policy() {
        let p = ResumeRedirect::new(NeverResume, 4);
        for attempt in 0..4 {
            let r = p.on_error(&ResumeQuery::new(attempt), redirect_error());
            assert!(matches!(r, ResumeResult::Continue(_)), "attempt={attempt} {r:?}");
        }
        let r = p.on_error(&ResumeQuery::new(4), redirect_error());
        assert!(matches!(r, ResumeResult::Exhausted(_)), "{r:?}");
    }

    #[test]
    fn non_redirects_pass_through() {
        let p = ResumeRedirect::new(NeverResume, 4);
        let r = p.on_error(&ResumeQuery::new(0), io_error());
        assert!(matches!(r, ResumeResult::Permanent(_)), "{r:?}");
    }
}
