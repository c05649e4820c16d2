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

//! The wire message model for bidi transfers.
//!
//! These types mirror the shapes of the storage protocol messages. Encoding
//! them for a concrete transport is out of scope for this crate; the
//! transport seam ([crate::transport]) moves them as values.

use crate::model::Object;
use bytes::Bytes;

/// A run of bytes and, optionally, its CRC32C checksum.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChecksummedData {
    pub content: Bytes,
    pub crc32c: Option<u32>,
}

/// An opaque handle identifying a writable session state on the server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteHandle {
    pub handle: Bytes,
}

/// An opaque handle identifying an open read session on the server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadHandle {
    pub handle: Bytes,
}

/// Opens a brand-new (possibly appendable) object write session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteSpec {
    pub bucket: String,
    pub object: String,
    pub appendable: bool,
    pub if_generation_match: Option<i64>,
}

/// Resumes (takes over) an existing appendable object write session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppendSpec {
    pub bucket: String,
    pub object: String,
    pub generation: i64,
    pub write_handle: Option<WriteHandle>,
    pub routing_token: Option<String>,
}

/// The session-identifying first message of a write stream.
#[derive(Clone, Debug, PartialEq)]
pub enum FirstMessage {
    /// Start a new object.
    WriteSpec(WriteSpec),
    /// Take over an existing appendable object.
    AppendSpec(AppendSpec),
    /// Continue a previously started resumable session.
    UploadId(String),
}

/// One message on the write stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteRequest {
    /// Present only on the first message of a (sub-)stream.
    pub first_message: Option<FirstMessage>,
    /// The absolute offset of `data` within the object.
    pub write_offset: u64,
    /// The payload, absent on control-only messages.
    pub data: Option<ChecksummedData>,
    /// Ask the service to persist buffered bytes.
    pub flush: bool,
    /// Ask the service to report its persisted size.
    pub state_lookup: bool,
    /// Marks the end of the object; only valid on the last message.
    pub finish_write: bool,
}

impl WriteRequest {
    /// The number of payload bytes carried by this message.
    pub fn data_len(&self) -> u64 {
        self.data.as_ref().map_or(0, |d| d.content.len() as u64)
    }

    /// The offset immediately after this message's payload.
    pub fn end_offset(&self) -> u64 {
        self.write_offset + self.data_len()
    }

    /// True for messages that carry data and no control flags.
    ///
    /// Only such messages can be merged during compaction.
    pub fn is_plain_data(&self) -> bool {
        self.first_message.is_none()
            && self.data.is_some()
            && !self.flush
            && !self.state_lookup
            && !self.finish_write
    }
}

/// The confirmed state reported on the write stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteStatus {
    /// The service has durably persisted this many bytes.
    PersistedSize(u64),
    /// The upload is finalized; this is the resulting resource.
    Resource(Object),
}

/// One message from the service on the write stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteResponse {
    pub status: Option<WriteStatus>,
    pub write_handle: Option<WriteHandle>,
}

/// A byte range tagged with the read-id multiplexing it over the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReadRange {
    pub read_id: i64,
    /// Non-negative for absolute offsets; negative means "this many bytes
    /// from the end of the object".
    pub read_offset: i64,
    /// Zero means "until the end of the object".
    pub read_length: i64,
}

/// Identifies the object (and session) of a read stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadSpec {
    pub bucket: String,
    pub object: String,
    pub generation: i64,
    pub read_handle: Option<ReadHandle>,
    pub routing_token: Option<String>,
}

/// One message on the read stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadRequest {
    /// Present only on the first message of a (sub-)stream.
    pub spec: Option<ReadSpec>,
    /// New or resumed ranges to serve.
    pub ranges: Vec<ReadRange>,
}

/// A content frame for one read-id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RangeData {
    pub read_range: Option<ReadRange>,
    pub data: Option<ChecksummedData>,
    /// Set on the final frame of the range.
    pub range_end: bool,
    /// A per-range error; sibling ranges on the stream are unaffected.
    pub status: Option<crate::error::rpc::Status>,
}

/// One message from the service on the read stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadResponse {
    /// Object metadata, present on the first message of a stream.
    pub metadata: Option<Object>,
    pub ranges: Vec<RangeData>,
    pub read_handle: Option<ReadHandle>,
}
