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

//! Tracks write offsets across an upload session.
//!
//! Two roles mutate this state concurrently: the sending path increments
//! `total_sent` as bytes are handed to the transport, and the
//! response-processing path advances `confirmed` from server
//! acknowledgements. Both counters are atomics; plain read-modify-write
//! would race when an ack for earlier data arrives while later data is being
//! sent.

use crate::error::WriteError;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

type WriteResult<T> = std::result::Result<T, WriteError>;

/// Sent and confirmed byte counters for one upload session.
///
/// Invariant: `confirmed <= total_sent`. A server acknowledgement that
/// violates it, in either direction, is classified as data loss and is never
/// retryable at the same offset.
#[derive(Debug)]
pub struct WriteCtx {
    quantum: u64,
    total_sent: AtomicU64,
    // -1 until the server reports any state for the session.
    confirmed: AtomicI64,
}

impl WriteCtx {
    /// A context for a session with no server-side state yet.
    pub fn new(quantum: usize) -> Self {
        Self {
            quantum: quantum.max(1) as u64,
            total_sent: AtomicU64::new(0),
            confirmed: AtomicI64::new(-1),
        }
    }

    /// A context for a taken-over session whose authoritative size is known.
    pub fn with_confirmed(quantum: usize, begin: u64) -> Self {
        Self {
            quantum: quantum.max(1) as u64,
            total_sent: AtomicU64::new(begin),
            confirmed: AtomicI64::new(begin as i64),
        }
    }

    /// Bytes handed to the transport so far.
    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Acquire)
    }

    /// Bytes the server has confirmed durable, if any state is known.
    pub fn confirmed(&self) -> Option<u64> {
        match self.confirmed.load(Ordering::Acquire) {
            n if n < 0 => None,
            n => Some(n as u64),
        }
    }

    /// Records `n` more bytes handed to the transport; returns the total.
    pub fn record_sent(&self, n: u64) -> u64 {
        self.total_sent.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Raises the sent high-water mark to `end`.
    ///
    /// Replaying bytes after a rewind does not advance the mark; only bytes
    /// past the previous high water count.
    pub fn record_sent_to(&self, end: u64) -> u64 {
        self.total_sent.fetch_max(end, Ordering::AcqRel).max(end)
    }

    /// Reconciles a server-reported persisted size.
    ///
    /// - equal to or ahead of the previous confirmation, and within the
    ///   bytes sent: normal advance.
    /// - behind the previous confirmation: the server forgot durable bytes.
    /// - past the bytes sent: the session's offsets are corrupted.
    pub fn record_confirmed(&self, reported: u64) -> WriteResult<()> {
        loop {
            let current = self.confirmed.load(Ordering::Acquire);
            if current >= 0 && reported < current as u64 {
                return Err(WriteError::UnexpectedRewind {
                    offset: current as u64,
                    persisted: reported,
                });
            }
            let sent = self.total_sent();
            if reported > sent {
                return Err(WriteError::TooMuchProgress {
                    sent,
                    persisted: reported,
                });
            }
            let exchange = self.confirmed.compare_exchange(
                current,
                reported as i64,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if exchange.is_ok() {
                return Ok(());
            }
        }
    }

    /// True when all sent bytes are confirmed durable.
    pub fn is_reconciled(&self) -> bool {
        self.confirmed() == Some(self.total_sent())
    }

    /// True when `offset` sits on an acknowledgeable flush boundary.
    pub fn is_quantum_aligned(&self, offset: u64) -> bool {
        offset % self.quantum == 0
    }

    /// Validates the persisted size reported on finalize.
    ///
    /// Finalization is only valid when the acknowledged size equals the
    /// bytes sent; any other value is a data-loss classification and must
    /// not be silently retried with the same body.
    pub fn check_finalized(&self, persisted: u64) -> WriteResult<()> {
        let sent = self.total_sent();
        if persisted < sent {
            return Err(WriteError::UnexpectedRewind {
                offset: sent,
                persisted,
            });
        }
        if persisted > sent {
            return Err(WriteError::TooMuchProgress { sent, persisted });
        }
        self.record_confirmed(persisted)
    }
}
