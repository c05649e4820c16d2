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

//! Splits logical write buffers into wire-sized, checksummed chunks.
//!
//! The storage protocol only acknowledges writes at multiples of a fixed
//! *quantum*, so every chunk except the final one of an upload must be sized
//! to a multiple of that quantum. The segmenter accepts a sequence of buffers
//! to avoid forcing a copy when the caller already holds discontiguous
//! memory; chunks that fall inside a single buffer are zero-copy slices.

use crate::checksum::Crc32cValue;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// One wire-sized piece of an upload.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    /// Absolute byte offset of this chunk within the object.
    pub offset: u64,
    /// The chunk payload.
    pub data: Bytes,
    /// The payload checksum, if checksums are enabled.
    pub crc32c: Option<Crc32cValue>,
    /// Set only on the final chunk of a finalizing segmentation.
    pub last: bool,
}

impl Chunk {
    /// The offset immediately after this chunk.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// The result of an aligned (non-finalizing) segmentation.
#[derive(Debug, Default)]
pub struct Segments {
    /// Quantum-aligned chunks, in offset order.
    pub chunks: Vec<Chunk>,
    /// Bytes past the last quantum boundary, returned to the caller.
    pub remainder: Vec<Bytes>,
}

/// Splits input buffers into chunks bounded by the configured maximum size
/// and aligned to the configured quantum.
#[derive(Clone, Debug)]
pub struct ChunkSegmenter {
    quantum: usize,
    max_chunk_size: usize,
}

impl ChunkSegmenter {
    /// Creates a segmenter.
    ///
    /// The maximum chunk size is rounded up to a positive multiple of the
    /// quantum; an aligned flush below the quantum is not expressible in the
    /// protocol.
    pub fn new(quantum: usize, max_chunk_size: usize) -> Self {
        let quantum = quantum.max(1);
        let max_chunk_size = max_chunk_size.div_ceil(quantum).max(1) * quantum;
        Self {
            quantum,
            max_chunk_size,
        }
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Segments as many whole quantum blocks as `buffers` contains.
    ///
    /// Bytes past the last quantum boundary are returned unconsumed in
    /// [Segments::remainder]; the caller keeps them for the next flush. An
    /// input exactly divisible by the quantum leaves no remainder and
    /// produces no short chunk.
    pub fn segment<I>(&self, base_offset: u64, buffers: I, checksums: bool) -> Segments
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut input = Cursor::new(buffers);
        let aligned = (input.remaining() / self.quantum as u64) * self.quantum as u64;
        let chunks = self.consume(&mut input, base_offset, aligned, checksums, false);
        Segments {
            chunks,
            remainder: input.into_remainder(),
        }
    }

    /// Segments everything in `buffers`, marking the final chunk as the end
    /// of the object.
    ///
    /// A zero-length input still produces exactly one terminal chunk, which
    /// is how a zero-byte object is finalized.
    pub fn segment_final<I>(&self, base_offset: u64, buffers: I, checksums: bool) -> Vec<Chunk>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut input = Cursor::new(buffers);
        let total = input.remaining();
        let mut chunks = self.consume(&mut input, base_offset, total, checksums, true);
        if chunks.is_empty() {
            chunks.push(Chunk {
                offset: base_offset,
                data: Bytes::new(),
                crc32c: checksums.then(|| Crc32cValue::of(b"")),
                last: true,
            });
        }
        chunks
    }

    fn consume(
        &self,
        input: &mut Cursor,
        base_offset: u64,
        mut budget: u64,
        checksums: bool,
        finalizing: bool,
    ) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut offset = base_offset;
        while budget > 0 {
            let take = std::cmp::min(budget, self.max_chunk_size as u64) as usize;
            let data = input.take(take);
            budget -= data.len() as u64;
            let crc32c = checksums.then(|| Crc32cValue::of(&data));
            let len = data.len() as u64;
            chunks.push(Chunk {
                offset,
                crc32c,
                last: finalizing && budget == 0,
                data,
            });
            offset += len;
        }
        chunks
    }
}

/// A consuming view over a sequence of buffers.
///
/// `take` is zero-copy while a request fits in the front buffer and copies
/// only when a chunk spans buffer boundaries.
#[derive(Debug)]
struct Cursor {
    buffers: VecDeque<Bytes>,
}

impl Cursor {
    fn new<I: IntoIterator<Item = Bytes>>(buffers: I) -> Self {
        Self {
            buffers: buffers.into_iter().filter(|b| !b.is_empty()).collect(),
        }
    }

    fn remaining(&self) -> u64 {
        self.buffers.iter().map(|b| b.len() as u64).sum()
    }

    fn take(&mut self, n: usize) -> Bytes {
        let Some(front) = self.buffers.front_mut() else {
            return Bytes::new();
        };
        if front.len() >= n {
            let data = front.split_to(n);
            if front.is_empty() {
                self.buffers.pop_front();
            }
            return data;
        }
        let mut data = BytesMut::with_capacity(n);
        let mut needed = n;
        while needed > 0 {
            let Some(front) = self.buffers.front_mut() else {
                break;
            };
            let take = std::cmp::min(needed, front.len());
            data.put(front.split_to(take));
            needed -= take;
            if front.is_empty() {
                self.buffers.pop_front();
            }
        }
        data.freeze()
    }

    fn into_remainder(self) -> Vec<Bytes> {
        self.buffers.into_iter().collect()
    }
}
