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

//! Resumable, checksum-verified transfer engine for object storage clients.
//!
//! This crate is the data-plane core underneath an object-storage client:
//! it turns an arbitrary byte stream into a correctly-ordered, gap-free,
//! checksum-verified sequence of wire messages for upload, and turns an
//! incoming, possibly out-of-order, possibly redirected server stream into
//! a correct byte sequence for download.
//!
//! - The write path: [write::Upload] streams a rewindable source and
//!   rewinds to the confirmed offset on retry; [write::Writer] is an
//!   incremental channel over a buffered bidi session that replays its
//!   unconfirmed suffix, including taking over an appendable object started
//!   by another process.
//! - The read path: [read::ReadSession] multiplexes accumulating and
//!   streaming byte-range reads over one stream, re-keying in-flight reads
//!   across retries and server-issued redirects without losing or
//!   duplicating bytes.
//!
//! The concrete RPC transport, object metadata modeling, and access
//! control are out of scope; the engine consumes the abstract capabilities
//! in [transport] and exposes its results through the minimal [model].

pub mod backoff_policy;
pub mod checksum;
pub mod chunk;
pub mod content;
pub mod error;
pub mod model;
pub mod options;
pub mod range_spec;
pub mod read;
pub mod recovery;
pub mod resume_policy;
pub mod retry_policy;
pub mod transport;
pub mod wire;
pub mod write;

pub use error::{Error, Result};
