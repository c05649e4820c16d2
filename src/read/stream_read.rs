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

//! Per-read-id consumers of a multiplexed read stream.
//!
//! A [StreamRead] owns the lifecycle of one logical byte-range read: it
//! validates and orders the frames delivered under its read-id and hands
//! the bytes to the consumption side. Three kinds exist behind one closed
//! enum: byte-accumulating and zero-copy-accumulating reads resolve a
//! future on end-of-range; streaming reads feed a pull-style reader.
//!
//! A read stays open until its end marker, a terminal failure, or a close.
//! Frames delivered after that are a definite error, never a silent drop:
//! losing bytes quietly is the one unacceptable outcome.

use super::remaining::RemainingRange;
use crate::error::{ChecksumMismatch, ReadError};
use crate::range_spec::RangeSpec;
use crate::wire::{ChecksummedData, ReadRange};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

type ReadResult<T> = std::result::Result<T, ReadError>;

/// The lifecycle of one read-id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadState {
    /// Range registered, no bytes yet.
    Pending,
    /// At least one accepted frame, end not yet signaled.
    Active,
    /// The server signaled the end, the caller has not drained everything.
    EofPending,
    /// Complete or explicitly closed.
    Closed,
    /// Terminal failure; sticky.
    Failed,
}

#[derive(Debug)]
enum ReadKind {
    /// Accumulates into one contiguous buffer, resolved on end-of-range.
    Accumulate {
        buffer: Vec<u8>,
        tx: Option<oneshot::Sender<ReadResult<Bytes>>>,
    },
    /// Accumulates the fragments as delivered, resolved on end-of-range.
    ZeroCopy {
        parts: Vec<Bytes>,
        tx: Option<oneshot::Sender<ReadResult<Vec<Bytes>>>>,
    },
    /// Forwards fragments to a pull-style reader as they arrive.
    Streaming { tx: mpsc::Sender<ReadResult<Bytes>> },
    /// Replaced by [StreamRead::with_new_read_id]; accepts nothing.
    Retired,
}

/// One logical read multiplexed over a stream under a read-id.
#[derive(Debug)]
pub(crate) struct StreamRead {
    id: i64,
    state: ReadState,
    remaining: RemainingRange,
    kind: ReadKind,
}

impl StreamRead {
    pub fn accumulating(range: RangeSpec, tx: oneshot::Sender<ReadResult<Bytes>>) -> Self {
        Self {
            id: 0,
            state: ReadState::Pending,
            remaining: RemainingRange::new(range),
            kind: ReadKind::Accumulate {
                buffer: Vec::new(),
                tx: Some(tx),
            },
        }
    }

    pub fn zero_copy(range: RangeSpec, tx: oneshot::Sender<ReadResult<Vec<Bytes>>>) -> Self {
        Self {
            id: 0,
            state: ReadState::Pending,
            remaining: RemainingRange::new(range),
            kind: ReadKind::ZeroCopy {
                parts: Vec::new(),
                tx: Some(tx),
            },
        }
    }

    pub fn streaming(range: RangeSpec, tx: mpsc::Sender<ReadResult<Bytes>>) -> Self {
        Self {
            id: 0,
            state: ReadState::Pending,
            remaining: RemainingRange::new(range),
            kind: ReadKind::Streaming { tx },
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ReadState {
        self.state
    }

    /// Assigns the initial read-id, before the range is first requested.
    pub fn assigned(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    /// Consumes one frame delivered under this read-id.
    ///
    /// Validates ordering against the remaining range and the per-frame
    /// checksum, then returns the delivery action to run outside any lock.
    pub fn accept(
        &mut self,
        data: Option<ChecksummedData>,
        range: ReadRange,
        end: bool,
    ) -> ReadResult<Handler> {
        if matches!(self.state, ReadState::Closed | ReadState::Failed)
            || matches!(self.kind, ReadKind::Retired)
        {
            return Err(ReadError::ReadClosed(self.id));
        }
        self.remaining.update(range)?;
        let Some(data) = data else {
            self.remaining.handle_empty(end)?;
            self.state = if end {
                self.end_state()
            } else {
                ReadState::Active
            };
            if end {
                return Ok(self.resolve());
            }
            return Ok(Handler(Inner::NoData));
        };
        if let Some(want) = data.crc32c {
            let got = crc32c::crc32c(&data.content);
            if want != got {
                return Err(ReadError::ChecksumMismatch(ChecksumMismatch::Crc32c {
                    got,
                    want,
                }));
            }
        }
        self.state = if end {
            self.end_state()
        } else {
            ReadState::Active
        };
        let forwarded = match &mut self.kind {
            ReadKind::Accumulate { buffer, .. } => {
                buffer.extend_from_slice(&data.content);
                None
            }
            ReadKind::ZeroCopy { parts, .. } => {
                parts.push(data.content);
                None
            }
            ReadKind::Streaming { tx } => Some(Handler(Inner::Send(tx.clone(), data.content))),
            ReadKind::Retired => unreachable!("checked above"),
        };
        if let Some(handler) = forwarded {
            return Ok(handler);
        }
        if end {
            return Ok(self.resolve());
        }
        Ok(Handler(Inner::NoData))
    }

    fn end_state(&self) -> ReadState {
        match self.kind {
            // Accumulating reads resolve in full on the end marker.
            ReadKind::Accumulate { .. } | ReadKind::ZeroCopy { .. } => ReadState::Closed,
            // The pull-style reader still has to drain buffered bytes.
            ReadKind::Streaming { .. } | ReadKind::Retired => ReadState::EofPending,
        }
    }

    fn resolve(&mut self) -> Handler {
        match &mut self.kind {
            ReadKind::Accumulate { buffer, tx } => {
                let value = Bytes::from_owner(std::mem::take(buffer));
                match tx.take() {
                    Some(tx) => Handler(Inner::ResolveBytes(tx, value)),
                    None => Handler(Inner::NoData),
                }
            }
            ReadKind::ZeroCopy { parts, tx } => {
                let value = std::mem::take(parts);
                match tx.take() {
                    Some(tx) => Handler(Inner::ResolveParts(tx, value)),
                    None => Handler(Inner::NoData),
                }
            }
            ReadKind::Streaming { .. } | ReadKind::Retired => Handler(Inner::NoData),
        }
    }

    /// Fails the read because the underlying stream is gone.
    pub async fn interrupted(&mut self, error: std::sync::Arc<crate::Error>) {
        self.fail(ReadError::UnrecoverableInterrupt(error)).await;
    }

    /// Marks the read as failed; sticky, all consumers observe the cause.
    pub async fn fail(&mut self, error: ReadError) {
        self.state = ReadState::Failed;
        match &mut self.kind {
            ReadKind::Accumulate { buffer, tx } => {
                buffer.clear();
                if let Some(tx) = tx.take() {
                    if tx.send(Err(error)).is_err() {
                        tracing::error!("cannot notify reader (dropped?) of a read failure");
                    }
                }
            }
            ReadKind::ZeroCopy { parts, tx } => {
                parts.clear();
                if let Some(tx) = tx.take() {
                    if tx.send(Err(error)).is_err() {
                        tracing::error!("cannot notify reader (dropped?) of a read failure");
                    }
                }
            }
            ReadKind::Streaming { tx } => {
                if tx.send(Err(error)).await.is_err() {
                    tracing::error!("cannot notify reader (dropped?) of a read failure");
                }
            }
            ReadKind::Retired => {}
        }
    }

    /// Releases buffered fragments and stops accepting frames.
    pub fn close(&mut self) {
        self.state = ReadState::Closed;
        match &mut self.kind {
            ReadKind::Accumulate { buffer, tx } => {
                buffer.clear();
                let _ = tx.take();
            }
            ReadKind::ZeroCopy { parts, tx } => {
                parts.clear();
                let _ = tx.take();
            }
            ReadKind::Streaming { .. } | ReadKind::Retired => {}
        }
    }

    /// The next range to (re-)request from the server.
    ///
    /// After the end of the range this reports a zero length at the final
    /// offset, which callers use to detect a fully-satisfied read.
    pub fn make_read_range(&self) -> ReadRange {
        self.remaining.as_wire(self.id)
    }

    /// Whether this read may share a transport stream with `other`.
    ///
    /// The two accumulating kinds are interchangeable; streaming reads are
    /// never shareable, not even with each other.
    pub fn can_share_stream_with(&self, other: &StreamRead) -> bool {
        let sharable = |kind: &ReadKind| {
            matches!(kind, ReadKind::Accumulate { .. } | ReadKind::ZeroCopy { .. })
        };
        sharable(&self.kind) && sharable(&other.kind)
    }

    /// Re-keys the read during a retry or redirect.
    ///
    /// The accumulating kinds change identity in place: the same instance
    /// keeps serving the same logical range. The streaming kind returns a
    /// replacement and the original becomes a permanently non-accepting
    /// tombstone, so a late frame under the old id can never be merged
    /// into the new instance's buffer.
    pub fn with_new_read_id(mut self, id: i64) -> (StreamRead, Option<StreamRead>) {
        match self.kind {
            ReadKind::Accumulate { .. } | ReadKind::ZeroCopy { .. } => {
                self.id = id;
                (self, None)
            }
            ReadKind::Retired => (self, None),
            ReadKind::Streaming { tx } => {
                let replacement = StreamRead {
                    id,
                    state: self.state,
                    remaining: self.remaining,
                    kind: ReadKind::Streaming { tx },
                };
                let tombstone = StreamRead {
                    id: self.id,
                    state: ReadState::Closed,
                    remaining: self.remaining,
                    kind: ReadKind::Retired,
                };
                (replacement, Some(tombstone))
            }
        }
    }

    /// True for tombstones left behind by a streaming re-key.
    pub fn is_retired(&self) -> bool {
        matches!(self.kind, ReadKind::Retired)
    }
}

/// The delivery action produced by [StreamRead::accept], run outside the
/// registry lock.
#[derive(Debug)]
pub(crate) struct Handler(Inner);

#[derive(Debug)]
enum Inner {
    NoData,
    Send(mpsc::Sender<ReadResult<Bytes>>, Bytes),
    ResolveBytes(oneshot::Sender<ReadResult<Bytes>>, Bytes),
    ResolveParts(oneshot::Sender<ReadResult<Vec<Bytes>>>, Vec<Bytes>),
}

impl Handler {
    pub async fn send(self) {
        match self.0 {
            Inner::NoData => {}
            // The application can drop the consumer side at any time;
            // failed sends just release the content.
            Inner::Send(tx, data) => {
                let _ = tx.send(Ok(data)).await;
            }
            Inner::ResolveBytes(tx, value) => {
                let _ = tx.send(Ok(value));
            }
            Inner::ResolveParts(tx, value) => {
                let _ = tx.send(Ok(value));
            }
        }
    }
}
