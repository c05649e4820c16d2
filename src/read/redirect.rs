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

use crate::Error;
use crate::error::rpc::Status;
use crate::retry_policy::{RetryPolicy, RetryResult, RetryState};
use crate::wire::{ReadHandle, ReadSpec};
use std::sync::{Arc, Mutex};

/// Captures the redirect details of a stream error into the read spec.
///
/// The next stream opened from the spec presents the routing token and the
/// resumption handle to the service.
pub(crate) fn handle_redirect(spec: &Arc<Mutex<ReadSpec>>, status: Status) -> Error {
    if let Some(redirect) = status.redirect() {
        let mut guard = spec.lock().expect("never poisoned");
        guard.routing_token = redirect.routing_token.clone();
        guard.read_handle = redirect.handle.clone().map(|handle| ReadHandle { handle });
    }
    Error::service(status)
}

/// Decorates the retry policy to continue on redirect errors.
///
/// The streaming read API uses errors to redirect requests. Redirects are
/// ignored in the connect retry loop while respecting any limits set by the
/// application: if the policy is exhausted, or the error is transient, the
/// decorator has no effect. Only a "permanent" error that happens to be a
/// redirect is treated as retryable.
#[derive(Debug)]
pub(crate) struct RetryRedirect {
    inner: Arc<dyn RetryPolicy>,
}

impl RetryRedirect {
    pub(crate) fn new(inner: Arc<dyn RetryPolicy>) -> Self {
        Self { inner }
    }
}

impl RetryPolicy for RetryRedirect {
    fn on_error(&self, state: &RetryState, error: Error) -> RetryResult {
        match self.inner.on_error(state, error) {
            RetryResult::Permanent(e) if e.redirect().is_some() => RetryResult::Continue(e),
            // Exhausted(), Continue() and other permanent errors pass thru.
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::rpc::{Code, Redirect};
    use crate::retry_policy::{RetryPolicyExt, TransientErrors};
    use test_case::test_case;

    fn redirect_status(token: &str) -> Status {
        Status::new(Code::Aborted, "redirected").with_redirect(Redirect {
            routing_token: Some(token.to_string()),
            handle: Some(bytes::Bytes::from_static(b"handle-redirect")),
        })
    }

    #[test_case(Some("routing"), Some(&b"handle"[..]))]
    #[test_case(None, Some(&b"handle"[..]))]
    #[test_case(Some("routing"), None)]
    #[test_case(None, None)]
    fn reset(routing: Option<&str>, handle: Option<&[u8]>) {
        let redirect = Redirect {
            routing_token: routing.map(str::to_string),
            handle: handle.map(bytes::Bytes::copy_from_slice),
        };
        let status = Status::new(Code::Aborted, "redirected").with_redirect(redirect.clone());
        let spec = ReadSpec {
            routing_token: Some("initial-token".into()),
            read_handle: Some(ReadHandle {
                handle: bytes::Bytes::from_static(b"initial-handle"),
            }),
            ..ReadSpec::default()
        };
        let spec = Arc::new(Mutex::new(spec));

        let got = handle_redirect(&spec, status);
        assert!(got.status().is_some(), "{got:?}");
        let guard = spec.lock().expect("not poisoned");
        assert_eq!(guard.routing_token.as_deref(), routing);
        assert_eq!(
            guard.read_handle.as_ref().map(|h| &h.handle[..]),
            handle
        );
    }

    #[test]
    fn no_change_without_redirect() {
        let status = Status::new(Code::Aborted, "aborted");
        let spec = ReadSpec {
            routing_token: Some("initial-token".into()),
            ..ReadSpec::default()
        };
        let spec = Arc::new(Mutex::new(spec));
        let got = handle_redirect(&spec, status);
        assert!(got.status().is_some(), "{got:?}");
        let guard = spec.lock().expect("not poisoned");
        assert_eq!(guard.routing_token.as_deref(), Some("initial-token"));
    }

    #[test]
    fn retry_redirect() {
        let inner: Arc<dyn RetryPolicy> = Arc::new(TransientErrors.with_attempt_limit(3));
        let p = RetryRedirect::new(inner);

        let result = p.on_error(
            &RetryState::new(),
            Error::service(redirect_status("r1")),
        );
        assert!(matches!(&result, RetryResult::Continue(_)), "{result:?}");

        let result = p.on_error(&RetryState::new(), Error::io("reset"));
        assert!(matches!(&result, RetryResult::Continue(_)), "{result:?}");

        let result = p.on_error(
            &RetryState::new(),
            Error::service(Status::new(Code::PermissionDenied, "nope")),
        );
        assert!(matches!(&result, RetryResult::Permanent(_)), "{result:?}");
    }
}
