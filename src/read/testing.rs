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

//! A scriptable in-memory read transport for tests.
//!
//! The fake serves one object: the first message of every stream carries
//! the object metadata, each requested range is streamed in fixed-size
//! checksummed frames, and failure points inject stream errors, redirects,
//! corrupted frames, and per-range errors.

use crate::Result;
use crate::error::rpc::Status;
use crate::model::Object;
use crate::transport::{ChannelStream, ReadTransport, StartResult};
use crate::wire::{
    ChecksummedData, RangeData, ReadHandle, ReadRange, ReadRequest, ReadResponse,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{Receiver, Sender};

const FRAGMENT_SIZE: usize = 64;

/// Failure points consumed in order, one per connection.
#[derive(Clone, Debug)]
pub(crate) enum FailPoint {
    /// Reject the stream open with this status.
    #[allow(dead_code)]
    OnOpen(Status),
    /// Break the stream with this status in place of the n-th frame of the
    /// connection.
    AfterFrames(u32, Status),
    /// Corrupt the checksum of the n-th frame of the connection.
    CorruptFrame(u32),
}

#[derive(Debug, Default)]
struct Shared {
    content: Vec<u8>,
    connections: u32,
    requests: Vec<ReadRequest>,
    // Ranges starting at this offset answer with a per-range error.
    error_range: Option<(u64, Status)>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeReadTransport {
    shared: Arc<Mutex<Shared>>,
    plan: Arc<Mutex<VecDeque<FailPoint>>>,
}

impl FakeReadTransport {
    pub fn new(content: Vec<u8>) -> Self {
        Self::with_plan(content, [])
    }

    pub fn with_plan<I: IntoIterator<Item = FailPoint>>(content: Vec<u8>, plan: I) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                content,
                ..Shared::default()
            })),
            plan: Arc::new(Mutex::new(plan.into_iter().collect())),
        }
    }

    /// Any range starting at `offset` answers with a per-range error.
    pub fn fail_range_at(&self, offset: u64, status: Status) {
        self.shared.lock().expect("never poisoned").error_range = Some((offset, status));
    }

    pub fn connections(&self) -> u32 {
        self.shared.lock().expect("never poisoned").connections
    }

    pub fn requests(&self) -> Vec<ReadRequest> {
        self.shared.lock().expect("never poisoned").requests.clone()
    }
}

impl ReadTransport for FakeReadTransport {
    type Stream = ChannelStream<ReadResponse>;

    async fn open(&self, rx: Receiver<ReadRequest>) -> Result<StartResult<Self::Stream>> {
        {
            let mut plan = self.plan.lock().expect("never poisoned");
            if matches!(plan.front(), Some(FailPoint::OnOpen(_))) {
                if let Some(FailPoint::OnOpen(status)) = plan.pop_front() {
                    return Ok(Err(status));
                }
            }
        }
        let trigger = self.plan.lock().expect("never poisoned").pop_front();
        self.shared.lock().expect("never poisoned").connections += 1;
        let (tx, responses) = tokio::sync::mpsc::channel(64);
        tokio::spawn(serve(rx, tx, self.shared.clone(), trigger));
        Ok(Ok(ChannelStream::new(responses)))
    }
}

async fn serve(
    mut rx: Receiver<ReadRequest>,
    tx: Sender<std::result::Result<ReadResponse, Status>>,
    shared: Arc<Mutex<Shared>>,
    mut trigger: Option<FailPoint>,
) {
    let mut frames = 0_u32;
    let mut sent_metadata = false;
    while let Some(request) = rx.recv().await {
        let (content, error_range) = {
            let mut shared = shared.lock().expect("never poisoned");
            shared.requests.push(request.clone());
            (shared.content.clone(), shared.error_range.clone())
        };
        if !sent_metadata {
            let metadata = Object::new()
                .set_name("fake-object")
                .set_bucket("fake-bucket")
                .set_generation(1_i64)
                .set_size(content.len() as i64);
            let first = ReadResponse {
                metadata: Some(metadata),
                ranges: Vec::new(),
                read_handle: Some(ReadHandle {
                    handle: Bytes::from_static(b"fake-read-handle"),
                }),
            };
            if tx.send(Ok(first)).await.is_err() {
                return;
            }
            sent_metadata = true;
        }
        for range in request.ranges {
            let len = content.len() as i64;
            let offset = if range.read_offset < 0 {
                (len + range.read_offset).max(0)
            } else {
                range.read_offset.min(len)
            };
            let end = if range.read_length == 0 {
                len
            } else {
                (offset + range.read_length).min(len)
            };
            if let Some((error_offset, status)) = &error_range {
                if offset as u64 == *error_offset {
                    let data = RangeData {
                        read_range: Some(range),
                        status: Some(status.clone()),
                        ..RangeData::default()
                    };
                    let response = ReadResponse {
                        ranges: vec![data],
                        ..ReadResponse::default()
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        return;
                    }
                    continue;
                }
            }
            let mut cursor = offset;
            loop {
                let fragment = (end - cursor).min(FRAGMENT_SIZE as i64) as usize;
                let last = cursor + fragment as i64 >= end;
                frames += 1;
                if let Some(FailPoint::AfterFrames(count, status)) = trigger.clone() {
                    if frames >= count {
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                }
                let slice = &content[cursor as usize..cursor as usize + fragment];
                let mut crc = crc32c::crc32c(slice);
                if let Some(FailPoint::CorruptFrame(count)) = trigger.clone() {
                    if frames == count {
                        crc = crc.wrapping_add(1);
                        trigger = None;
                    }
                }
                let frame = RangeData {
                    read_range: Some(ReadRange {
                        read_id: range.read_id,
                        read_offset: cursor,
                        read_length: fragment as i64,
                    }),
                    data: Some(ChecksummedData {
                        content: Bytes::copy_from_slice(slice),
                        crc32c: Some(crc),
                    }),
                    range_end: last,
                    status: None,
                };
                let response = ReadResponse {
                    ranges: vec![frame],
                    ..ReadResponse::default()
                };
                if tx.send(Ok(response)).await.is_err() {
                    return;
                }
                cursor += fragment as i64;
                if last {
                    break;
                }
            }
        }
    }
}
