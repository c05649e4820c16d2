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

//! A scriptable in-memory write transport for tests.
//!
//! The fake behaves like a tiny storage service: it tracks the persisted
//! size, accepts contiguous writes, answers flush/state-lookup messages, and
//! finalizes on a finish marker. Failure points inject stream errors,
//! redirects, and misreported persisted sizes at chosen moments.

use crate::Result;
use crate::error::rpc::{Code, Status};
use crate::model::{Object, ObjectChecksums};
use crate::transport::{ChannelStream, StartResult, WriteTransport};
use crate::wire::{WriteRequest, WriteResponse, WriteSpec, WriteStatus};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{Receiver, Sender};

/// Failure points consumed in order, one per connection.
#[derive(Clone, Debug)]
pub(crate) enum FailPoint {
    /// Reject the stream open with this status.
    OnOpen(Status),
    /// Break the stream with this status when the n-th data message of the
    /// connection arrives, without persisting it.
    AfterDataMessages(u32, Status),
    /// Once `after_data_messages` data messages arrived, answer the next
    /// flush/state-lookup with this absolute persisted size, regardless of
    /// reality.
    MisreportPersisted {
        after_data_messages: u32,
        value: u64,
    },
}

#[derive(Debug, Default)]
pub(crate) struct ServerLog {
    pub content: Vec<u8>,
    pub persisted: u64,
    pub finalized: Option<Object>,
    pub connections: u32,
    pub requests: Vec<WriteRequest>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeWriteTransport {
    pub log: Arc<Mutex<ServerLog>>,
    plan: Arc<Mutex<VecDeque<FailPoint>>>,
}

impl FakeWriteTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan<I: IntoIterator<Item = FailPoint>>(plan: I) -> Self {
        Self {
            log: Arc::new(Mutex::new(ServerLog::default())),
            plan: Arc::new(Mutex::new(plan.into_iter().collect())),
        }
    }

    pub fn content(&self) -> Vec<u8> {
        self.log.lock().expect("never poisoned").content.clone()
    }

    /// Pre-populates the object, as if a previous process wrote it.
    pub fn seed(&self, content: Vec<u8>) {
        let mut log = self.log.lock().expect("never poisoned");
        log.persisted = content.len() as u64;
        log.content = content;
    }

    pub fn connections(&self) -> u32 {
        self.log.lock().expect("never poisoned").connections
    }
}

impl WriteTransport for FakeWriteTransport {
    type Stream = ChannelStream<WriteResponse>;

    async fn start_session(&self, _spec: &WriteSpec) -> Result<String> {
        Ok("fake-upload-id".to_string())
    }

    async fn open(&self, rx: Receiver<WriteRequest>) -> Result<StartResult<Self::Stream>> {
        {
            let mut plan = self.plan.lock().expect("never poisoned");
            if matches!(plan.front(), Some(FailPoint::OnOpen(_))) {
                if let Some(FailPoint::OnOpen(status)) = plan.pop_front() {
                    return Ok(Err(status));
                }
            }
        }
        let trigger = {
            let mut plan = self.plan.lock().expect("never poisoned");
            match plan.front() {
                Some(FailPoint::AfterDataMessages(..))
                | Some(FailPoint::MisreportPersisted { .. }) => plan.pop_front(),
                _ => None,
            }
        };
        self.log.lock().expect("never poisoned").connections += 1;
        let (tx, responses) = tokio::sync::mpsc::channel(64);
        tokio::spawn(serve(rx, tx, self.log.clone(), trigger));
        Ok(Ok(ChannelStream::new(responses)))
    }
}

async fn serve(
    mut rx: Receiver<WriteRequest>,
    tx: Sender<std::result::Result<WriteResponse, Status>>,
    log: Arc<Mutex<ServerLog>>,
    mut trigger: Option<FailPoint>,
) {
    let mut data_messages = 0_u32;
    while let Some(request) = rx.recv().await {
        let mut outgoing = Vec::new();
        let mut stop = false;
        {
            let mut log = log.lock().expect("never poisoned");
            log.requests.push(request.clone());
            if let Some(data) = &request.data {
                data_messages += 1;
                if let Some(FailPoint::AfterDataMessages(count, status)) = trigger.clone() {
                    if data_messages >= count {
                        outgoing.push(Err(status));
                        stop = true;
                        trigger = None;
                    }
                }
                if !stop {
                    if request.write_offset == log.persisted {
                        log.content.extend_from_slice(&data.content);
                        log.persisted += data.content.len() as u64;
                    } else if request.write_offset < log.persisted {
                        // A replayed prefix; keep only the new suffix.
                        let skip = (log.persisted - request.write_offset) as usize;
                        if skip < data.content.len() {
                            log.content.extend_from_slice(&data.content[skip..]);
                            log.persisted += (data.content.len() - skip) as u64;
                        }
                    } else {
                        outgoing.push(Err(Status::new(
                            Code::InvalidArgument,
                            "write offset past persisted size",
                        )));
                        stop = true;
                    }
                }
            }
            if !stop {
                if request.finish_write {
                    let object = Object::new()
                        .set_name("fake-object")
                        .set_bucket("fake-bucket")
                        .set_generation(1_i64)
                        .set_size(log.persisted as i64)
                        .set_checksums(
                            ObjectChecksums::new().set_crc32c(crc32c::crc32c(&log.content)),
                        );
                    log.finalized = Some(object.clone());
                    outgoing.push(Ok(WriteResponse {
                        status: Some(WriteStatus::Resource(object)),
                        write_handle: None,
                    }));
                } else if request.flush || request.state_lookup {
                    let mut persisted = log.persisted;
                    if let Some(FailPoint::MisreportPersisted {
                        after_data_messages,
                        value,
                    }) = trigger.clone()
                    {
                        if data_messages >= after_data_messages {
                            persisted = value;
                            trigger = None;
                        }
                    }
                    outgoing.push(Ok(WriteResponse {
                        status: Some(WriteStatus::PersistedSize(persisted)),
                        write_handle: None,
                    }));
                }
            }
        }
        for response in outgoing {
            if tx.send(response).await.is_err() {
                return;
            }
        }
        if stop {
            return;
        }
    }
}
