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

//! The write path of the transfer engine.
//!
//! Two surfaces are exposed:
//! - [Upload]: a source-driven upload that streams a
//!   [RewindableContent][crate::content::RewindableContent] and rewinds to
//!   the confirmed offset on retry.
//! - [Writer]: an incremental channel (`write` / `flush` / `finalize`) over
//!   a buffered bidi session that replays its unconfirmed message suffix on
//!   retry, and supports taking over an existing appendable object.

pub mod context;
pub mod state;

mod channel;
mod upload;

pub use channel::Writer;
pub use upload::Upload;

#[cfg(test)]
pub(crate) mod testing;

use crate::transport::{Connection, WriteTransport};
use crate::wire::WriteRequest;
use crate::{Error, Result};

pub(crate) async fn open_stream<T: WriteTransport>(
    transport: &T,
) -> Result<Connection<WriteRequest, T::Stream>> {
    let (tx, rx) = tokio::sync::mpsc::channel(100);
    match transport.open(rx).await? {
        Ok(stream) => Ok(Connection::new(tx, stream)),
        Err(status) => Err(Error::service(status)),
    }
}
