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

//! Per-transfer configuration.

use crate::backoff_policy::{BackoffPolicy, ExponentialBackoff};
use crate::resume_policy::{Recommended, ResumePolicy};
use crate::retry_policy::{RetryPolicy, RetryPolicyExt, TransientErrors};
use std::sync::Arc;

/// The minimum byte alignment at which the service acknowledges writes.
pub const QUANTUM: usize = 256 * 1024;

const DEFAULT_MAX_CHUNK_SIZE: usize = 8 * QUANTUM;
const DEFAULT_WRITER_BUFFER_SIZE: usize = 32 * QUANTUM;
const DEFAULT_REDIRECT_ATTEMPT_LIMIT: u32 = 4;
const DEFAULT_ATTEMPT_LIMIT: u32 = 5;

/// Options shared by the read and write paths of a transfer.
///
/// # Example
/// ```
/// use objectstream::options::TransferOptions;
/// use objectstream::retry_policy::{RetryPolicyExt, TransientErrors};
/// let options = TransferOptions::default()
///     .with_retry_policy(TransientErrors.with_attempt_limit(3))
///     .with_redirect_attempt_limit(2);
/// ```
#[derive(Clone, Debug)]
pub struct TransferOptions {
    pub(crate) quantum: usize,
    pub(crate) max_chunk_size: usize,
    pub(crate) writer_buffer_size: usize,
    pub(crate) redirect_attempt_limit: u32,
    pub(crate) checksums_enabled: bool,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) backoff_policy: Arc<dyn BackoffPolicy>,
    pub(crate) resume_policy: Arc<dyn ResumePolicy>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            quantum: QUANTUM,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            writer_buffer_size: DEFAULT_WRITER_BUFFER_SIZE,
            redirect_attempt_limit: DEFAULT_REDIRECT_ATTEMPT_LIMIT,
            checksums_enabled: true,
            retry_policy: Arc::new(TransientErrors.with_attempt_limit(DEFAULT_ATTEMPT_LIMIT)),
            backoff_policy: Arc::new(ExponentialBackoff::default()),
            resume_policy: Arc::new(Recommended),
        }
    }
}

impl TransferOptions {
    /// The maximum size of a single wire message.
    ///
    /// Rounded up to a multiple of the quantum.
    pub fn with_max_chunk_size(mut self, v: usize) -> Self {
        self.max_chunk_size = v;
        self
    }

    /// The maximum number of unconfirmed bytes buffered by a writer.
    pub fn with_writer_buffer_size(mut self, v: usize) -> Self {
        self.writer_buffer_size = v.max(self.quantum);
        self
    }

    /// The maximum number of consecutive stream redirects followed before
    /// the transfer fails.
    pub fn with_redirect_attempt_limit(mut self, v: u32) -> Self {
        self.redirect_attempt_limit = v;
        self
    }

    /// Disables per-chunk checksums.
    ///
    /// Useful when the transport already guarantees integrity.
    pub fn with_checksums_disabled(mut self) -> Self {
        self.checksums_enabled = false;
        self
    }

    /// The retry policy for whole-operation attempts.
    pub fn with_retry_policy<P: RetryPolicy + 'static>(mut self, v: P) -> Self {
        self.retry_policy = Arc::new(v);
        self
    }

    /// The backoff policy between attempts.
    pub fn with_backoff_policy<P: BackoffPolicy + 'static>(mut self, v: P) -> Self {
        self.backoff_policy = Arc::new(v);
        self
    }

    /// The resume policy for interrupted streams.
    pub fn with_resume_policy<P: ResumePolicy + 'static>(mut self, v: P) -> Self {
        self.resume_policy = Arc::new(v);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_quantum(mut self, v: usize) -> Self {
        self.quantum = v.max(1);
        self
    }

    pub(crate) fn segmenter(&self) -> crate::chunk::ChunkSegmenter {
        crate::chunk::ChunkSegmenter::new(self.quantum, self.max_chunk_size)
    }
}
