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

//! Composable CRC32C values for object transfers.
//!
//! Checksums are load-bearing in this engine: the data-loss detection path
//! depends on combining per-chunk checksums into the checksum of the whole
//! stream. Combination uses the polynomial CRC32C windowing algorithm (via
//! [crc32c::crc32c_combine]), not byte concatenation and recompute.

use crate::model::ObjectChecksums;

/// A CRC32C checksum over a known number of bytes.
///
/// The value distinguishes "zero bytes consumed" from "N bytes consumed with
/// value V". Two values whose byte ranges are contiguous can be combined, and
/// combining is associative with hashing: hashing a whole buffer equals
/// combining the hashes of its parts, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Crc32cValue {
    /// No bytes have been consumed.
    Zero,
    /// `len` bytes have been consumed, hashing to `value`.
    LengthKnown { value: u32, len: u64 },
}

impl Crc32cValue {
    /// The value for an empty byte range.
    pub fn zero() -> Self {
        Self::Zero
    }

    /// Computes the value for a single buffer.
    pub fn of(data: &[u8]) -> Self {
        Self::LengthKnown {
            value: crc32c::crc32c(data),
            len: data.len() as u64,
        }
    }

    /// Combines `self` with the value of the byte range immediately
    /// following it.
    pub fn concat(self, next: Crc32cValue) -> Self {
        match (self, next) {
            (v, Self::Zero) => v,
            (Self::Zero, v) => v,
            (
                Self::LengthKnown { value: a, len: la },
                Self::LengthKnown { value: b, len: lb },
            ) => Self::LengthKnown {
                value: crc32c::crc32c_combine(a, b, lb as usize),
                len: la + lb,
            },
        }
    }

    /// The checksum value, if any bytes were consumed.
    pub fn value(&self) -> Option<u32> {
        match self {
            Self::Zero => None,
            Self::LengthKnown { value, .. } => Some(*value),
        }
    }

    /// The number of bytes consumed.
    pub fn len(&self) -> u64 {
        match self {
            Self::Zero => 0,
            Self::LengthKnown { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The checksums to report when finalizing an upload.
    ///
    /// A zero-byte object still has a well-defined checksum.
    pub fn finalize(&self) -> ObjectChecksums {
        ObjectChecksums::new().set_crc32c(self.value().unwrap_or_else(|| crc32c::crc32c(b"")))
    }
}

/// Incrementally accumulates the checksum of a byte stream.
///
/// `update` is offset-aware so that replayed ranges (common after a rewind)
/// do not corrupt the running value: bytes before the current position are
/// skipped, bytes past it are ignored.
#[derive(Clone, Debug, Default)]
pub struct Crc32cAccumulator {
    checksum: u32,
    offset: u64,
}

impl Crc32cAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `data`, which starts at absolute position `offset`.
    pub fn update(&mut self, offset: u64, data: &bytes::Bytes) {
        let end = offset + data.len() as u64;
        if (offset..end).contains(&self.offset) {
            let data = data.clone().split_off((self.offset - offset) as usize);
            self.checksum = crc32c::crc32c_append(self.checksum, &data);
            self.offset = end;
        }
    }

    /// The accumulated value.
    pub fn finalize(&self) -> Crc32cValue {
        match self.offset {
            0 => Crc32cValue::Zero,
            len => Crc32cValue::LengthKnown {
                value: self.checksum,
                len,
            },
        }
    }
}
