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

//! Tracks how much of a requested range remains to be served.
//!
//! Applications may request ranges relative to the end of the object or
//! without a length limit. Once the first frame arrives such ranges are
//! normalized to a non-negative offset, and the normalized range advances
//! with every frame. Both forms must be usable to resume a stream: the
//! next range to request is always `{start + delivered, remaining}`.

use crate::error::ReadError;
use crate::range_spec::RangeSpec;
use crate::wire::ReadRange;

type ReadResult<T> = std::result::Result<T, ReadError>;

/// A range with a known, non-negative offset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct NormalizedRange {
    offset: i64,
    length: Option<i64>,
}

impl NormalizedRange {
    pub fn new(offset: i64) -> ReadResult<Self> {
        if offset < 0 {
            return Err(ReadError::BadOffset(offset));
        }
        Ok(Self {
            offset,
            length: None,
        })
    }

    pub fn with_length(mut self, length: i64) -> ReadResult<Self> {
        if length < 0 {
            return Err(ReadError::BadLength(length));
        }
        self.length = Some(length);
        Ok(self)
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn length(&self) -> Option<i64> {
        self.length
    }

    pub fn as_wire(&self, id: i64) -> ReadRange {
        ReadRange {
            read_id: id,
            read_offset: self.offset,
            read_length: self.length.unwrap_or_default(),
        }
    }

    /// Advances the range over a received frame.
    pub fn update(&mut self, frame: ReadRange) -> ReadResult<()> {
        if frame.read_offset != self.offset {
            return Err(ReadError::OutOfOrder {
                got: frame.read_offset,
                expected: self.offset,
            });
        }
        if frame.read_length < 0 {
            return Err(ReadError::BadLength(frame.read_length));
        }
        if let Some(expected) = self.length {
            if frame.read_length > expected {
                return Err(ReadError::LongRead {
                    got: frame.read_length as u64,
                    expected: expected as u64,
                });
            }
        }
        self.offset += frame.read_length;
        self.length = self.length.map(|l| l - frame.read_length);
        Ok(())
    }

    /// Validates a data-less frame; an end marker with bytes still owed is
    /// a short read.
    pub fn handle_empty(&self, end: bool) -> ReadResult<()> {
        match (end, self.length) {
            (true, Some(l)) if l > 0 => Err(ReadError::ShortRead(l as u64)),
            _ => Ok(()),
        }
    }
}

/// The remaining range: as requested until the first frame arrives, then
/// normalized.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum RemainingRange {
    Requested(RangeSpec),
    Normalized(NormalizedRange),
}

impl RemainingRange {
    pub fn new(spec: RangeSpec) -> Self {
        Self::Requested(spec)
    }

    pub fn update(&mut self, frame: ReadRange) -> ReadResult<()> {
        match self {
            Self::Normalized(range) => range.update(frame)?,
            Self::Requested(spec) => {
                let mut range = Self::normalize(*spec, frame)?;
                range.update(frame)?;
                *self = Self::Normalized(range);
            }
        };
        Ok(())
    }

    fn normalize(spec: RangeSpec, frame: ReadRange) -> ReadResult<NormalizedRange> {
        let (offset, limit) = match spec {
            // The server resolves end-relative offsets.
            RangeSpec::Tail(_) => return NormalizedRange::new(frame.read_offset),
            RangeSpec::All => (0, 0),
            RangeSpec::Head(n) => (0, n),
            RangeSpec::Offset(o) => (o, 0),
            RangeSpec::Segment { offset, limit } => (offset, limit),
        };
        if frame.read_offset as u64 != offset {
            return Err(ReadError::OutOfOrder {
                got: frame.read_offset,
                expected: offset as i64,
            });
        }
        if limit != 0 && frame.read_length as u64 > limit {
            return Err(ReadError::LongRead {
                got: frame.read_length as u64,
                expected: limit,
            });
        }
        match limit {
            0 => NormalizedRange::new(frame.read_offset),
            l => NormalizedRange::new(frame.read_offset)?
                .with_length(l.clamp(0, i64::MAX as u64) as i64),
        }
    }

    pub fn as_wire(&self, id: i64) -> ReadRange {
        match self {
            Self::Requested(spec) => spec.as_wire(id),
            Self::Normalized(range) => range.as_wire(id),
        }
    }

    pub fn handle_empty(&self, end: bool) -> ReadResult<()> {
        match self {
            Self::Normalized(range) => range.handle_empty(end),
            // An end marker before any frame: only a problem when the
            // request promised a fixed amount of data.
            Self::Requested(RangeSpec::Segment { limit, .. }) if end && *limit > 0 => {
                Err(ReadError::ShortRead(*limit))
            }
            Self::Requested(RangeSpec::Head(n)) if end && *n > 0 => Err(ReadError::ShortRead(*n)),
            Self::Requested(_) => Ok(()),
        }
    }
}
