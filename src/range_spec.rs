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

//! Logical byte ranges for object reads.

use crate::wire;

/// A requested byte range of an object.
///
/// Ranges may be unbounded, relative to the end of the object, or a fixed
/// segment. The engine normalizes them to absolute positions once the first
/// response arrives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeSpec {
    /// The full object.
    All,
    /// The first `n` bytes.
    Head(u64),
    /// The last `n` bytes.
    Tail(u64),
    /// From `offset` to the end of the object.
    Offset(u64),
    /// `limit` bytes starting at `offset`; a zero limit means unbounded.
    Segment { offset: u64, limit: u64 },
}

impl RangeSpec {
    /// The full object.
    pub fn all() -> Self {
        Self::All
    }

    /// The first `n` bytes.
    pub fn head(n: u64) -> Self {
        Self::Head(n)
    }

    /// The last `n` bytes.
    pub fn tail(n: u64) -> Self {
        Self::Tail(n)
    }

    /// From `offset` to the end of the object.
    pub fn offset(offset: u64) -> Self {
        Self::Offset(offset)
    }

    /// `limit` bytes starting at `offset`.
    pub fn segment(offset: u64, limit: u64) -> Self {
        Self::Segment { offset, limit }
    }

    /// The wire form of this range under a given read-id.
    pub(crate) fn as_wire(&self, id: i64) -> wire::ReadRange {
        let (read_offset, read_length) = match *self {
            Self::All => (0, 0),
            Self::Head(n) => (0, n as i64),
            Self::Tail(n) => (-(n as i64), 0),
            Self::Offset(o) => (o as i64, 0),
            Self::Segment { offset, limit } => (offset as i64, limit as i64),
        };
        wire::ReadRange {
            read_id: id,
            read_offset,
            read_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(RangeSpec::all(), 0, 0)]
    #[test_case(RangeSpec::head(100), 0, 100)]
    #[test_case(RangeSpec::tail(100), -100, 0)]
    #[test_case(RangeSpec::offset(100), 100, 0)]
    #[test_case(RangeSpec::segment(100, 200), 100, 200)]
    fn as_wire(input: RangeSpec, offset: i64, length: i64) {
        let got = input.as_wire(42);
        assert_eq!(got.read_id, 42);
        assert_eq!(got.read_offset, offset);
        assert_eq!(got.read_length, length);
    }
}
