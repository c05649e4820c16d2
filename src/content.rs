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

//! Rewindable upload data sources.
//!
//! When an upload attempt fails the engine must resend every byte the
//! service has not confirmed, without re-reading already-consumed,
//! non-rewindable sources from the start. [RewindableContent] abstracts the
//! supported backings: nothing, a single buffer, a sequence of buffers, or a
//! file reopened fresh per attempt.
//!
//! Consumption state is a single absolute cursor; the bytes produced after
//! `rewind_to(n)` depend only on `n` and the backing content, never on how
//! much was consumed before. Rewinding twice to the same offset is a no-op.

use crate::{Error, Result};
use bytes::Bytes;
use std::path::PathBuf;

const READ_SIZE: usize = 256 * 1024;

/// A byte source that supports sequential consumption plus "rewind to
/// absolute offset".
#[derive(Debug)]
pub struct RewindableContent {
    inner: Inner,
    offset: u64,
}

#[derive(Debug)]
enum Inner {
    Empty,
    Buffers {
        buffers: Vec<Bytes>,
        total: u64,
    },
    File {
        path: PathBuf,
        size: u64,
        // Opened lazily, dropped on rewind so each attempt reads through a
        // fresh handle positioned at the cursor.
        open: Option<tokio::fs::File>,
    },
}

impl RewindableContent {
    /// Content with no bytes, used to finalize zero-byte objects.
    pub fn empty() -> Self {
        Self {
            inner: Inner::Empty,
            offset: 0,
        }
    }

    /// Content backed by a single in-memory buffer.
    pub fn from_bytes(data: Bytes) -> Self {
        Self::from_buffers(vec![data])
    }

    /// Content backed by a sequence of buffers with independent sizes.
    pub fn from_buffers(buffers: Vec<Bytes>) -> Self {
        let buffers: Vec<Bytes> = buffers.into_iter().filter(|b| !b.is_empty()).collect();
        let total = buffers.iter().map(|b| b.len() as u64).sum();
        if total == 0 {
            return Self::empty();
        }
        Self {
            inner: Inner::Buffers { buffers, total },
            offset: 0,
        }
    }

    /// Content backed by a file, opened fresh per attempt.
    pub async fn from_path<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await.map_err(Error::io)?;
        Ok(Self {
            inner: Inner::File {
                path,
                size: metadata.len(),
                open: None,
            },
            offset: 0,
        })
    }

    /// The total number of bytes in the content, independent of the cursor.
    pub fn total_len(&self) -> u64 {
        match &self.inner {
            Inner::Empty => 0,
            Inner::Buffers { total, .. } => *total,
            Inner::File { size, .. } => *size,
        }
    }

    /// The number of bytes remaining from the current cursor.
    pub fn len(&self) -> u64 {
        self.total_len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current cursor position.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Repositions the cursor to an absolute offset.
    ///
    /// Rewinding outside `[0, total_len()]` is a programmer error, reported
    /// as an invalid-argument [Error], not a retryable condition.
    pub fn rewind_to(&mut self, offset: u64) -> Result<()> {
        if offset > self.total_len() {
            return Err(Error::invalid(format!(
                "rewind offset {offset} is past the end of the content ({})",
                self.total_len()
            )));
        }
        self.offset = offset;
        if let Inner::File { open, .. } = &mut self.inner {
            *open = None;
        }
        Ok(())
    }

    /// Produces the next run of bytes from the cursor, at most `max` long.
    ///
    /// Returns `None` once the content is exhausted. Buffer-backed content
    /// yields at most one backing buffer's span per call.
    pub async fn next(&mut self, max: usize) -> Result<Option<Bytes>> {
        if max == 0 || self.len() == 0 {
            return Ok(None);
        }
        match &mut self.inner {
            Inner::Empty => Ok(None),
            Inner::Buffers { buffers, .. } => {
                let mut skip = self.offset;
                for b in buffers.iter() {
                    if skip < b.len() as u64 {
                        let start = skip as usize;
                        let end = std::cmp::min(b.len(), start + max);
                        let data = b.slice(start..end);
                        self.offset += data.len() as u64;
                        return Ok(Some(data));
                    }
                    skip -= b.len() as u64;
                }
                Ok(None)
            }
            Inner::File { path, size, open } => {
                use tokio::io::{AsyncReadExt, AsyncSeekExt};
                if open.is_none() {
                    let mut file = tokio::fs::File::open(path.as_path()).await.map_err(Error::io)?;
                    file.seek(std::io::SeekFrom::Start(self.offset))
                        .await
                        .map_err(Error::io)?;
                    *open = Some(file);
                }
                let remaining = (*size - self.offset) as usize;
                let mut buffer = vec![0_u8; max.min(READ_SIZE).min(remaining)];
                let file = open.as_mut().expect("opened above");
                let n = file.read(&mut buffer).await.map_err(Error::io)?;
                if n == 0 {
                    return Ok(None);
                }
                buffer.truncate(n);
                self.offset += n as u64;
                Ok(Some(Bytes::from_owner(buffer)))
            }
        }
    }
}
