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

//! Demultiplexes a read stream across its in-flight reads.
//!
//! One worker task owns the registry of [StreamRead]s keyed by read-id. It
//! delivers frames to the matching read, isolates per-read errors from
//! sibling reads on the same stream, and on an interruption reopens the
//! stream via the connector, re-keying every pending read to a fresh id
//! without losing or duplicating bytes.

use super::connector::Connector;
use super::stream_read::StreamRead;
use crate::Error;
use crate::error::ReadError;
use crate::error::rpc::Status;
use crate::transport::{Connection, ReadTransport, ResponseStream};
use crate::wire::{RangeData, ReadRequest, ReadResponse};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};

type LoopResult<T> = std::result::Result<T, Arc<Error>>;

#[derive(Debug)]
pub(crate) struct Worker<T> {
    next_read_id: i64,
    reads: HashMap<i64, StreamRead>,
    connector: Connector<T>,
}

impl<T> Worker<T>
where
    T: ReadTransport,
{
    pub fn new(connector: Connector<T>) -> Self {
        Self {
            next_read_id: 0,
            reads: HashMap::new(),
            connector,
        }
    }

    /// Runs until the request queue closes (a clean shutdown) or the stream
    /// fails unrecoverably.
    pub async fn run(
        mut self,
        connection: Connection<ReadRequest, T::Stream>,
        mut requests: Receiver<StreamRead>,
    ) -> LoopResult<()> {
        let (mut tx, mut rx) = (connection.tx, connection.rx);
        loop {
            tokio::select! {
                m = rx.next_message() => {
                    match self.handle_message(m).await {
                        // Successful end of stream.
                        None => return Ok(()),
                        // Unrecoverable.
                        Some(Err(e)) => return Err(e),
                        // Message handled, continue.
                        Some(Ok(None)) => {}
                        // Reconnected; swap the stream halves.
                        Some(Ok(Some(connection))) => {
                            (tx, rx) = (connection.tx, connection.rx);
                        }
                    }
                },
                r = requests.recv() => {
                    let Some(read) = r else {
                        break;
                    };
                    self.insert_read(tx.clone(), read).await;
                },
            }
        }
        // The request queue closes only when the session and all its
        // readers are gone.
        Ok(())
    }

    async fn handle_message(
        &mut self,
        message: std::result::Result<Option<ReadResponse>, Status>,
    ) -> Option<LoopResult<Option<Connection<ReadRequest, T::Stream>>>> {
        let response = match message.transpose()? {
            Ok(r) => r,
            Err(status) => return self.reconnect(status).await,
        };
        if let Err(e) = self.handle_ranges(response.ranges).await {
            let error = Arc::new(e);
            self.close_readers(error.clone()).await;
            return Some(Err(error));
        }
        Some(Ok(None))
    }

    async fn handle_ranges(&mut self, ranges: Vec<RangeData>) -> crate::Result<()> {
        let mut result = Ok(());
        for data in ranges {
            if let Err(e) = self.handle_range_data(data).await {
                // Capture the first error; protocol-level problems here are
                // rare and indicate an invalid response.
                result = result.and(Err(e));
            }
        }
        result.map_err(Error::io)
    }

    async fn handle_range_data(&mut self, data: RangeData) -> std::result::Result<(), ReadError> {
        let range = data.read_range.ok_or(ReadError::MissingRange)?;
        if let Some(status) = data.status {
            // A per-range error: only this read fails, sibling reads on
            // the stream are unaffected.
            if let Some(mut read) = self.reads.remove(&range.read_id) {
                read.fail(ReadError::UnrecoverableInterrupt(Arc::new(Error::service(
                    status,
                ))))
                .await;
            }
            return Ok(());
        }
        let retired = match self.reads.get(&range.read_id) {
            None => return Err(ReadError::UnknownReadId(range.read_id)),
            Some(read) => read.is_retired(),
        };
        if retired {
            // A frame raced the re-keying; it must never reach the new
            // instance's buffer.
            tracing::debug!("dropping frame for retired read-id {}", range.read_id);
            if data.range_end {
                self.reads.remove(&range.read_id);
            }
            return Ok(());
        }
        if data.range_end {
            let mut read = self.reads.remove(&range.read_id).expect("present above");
            match read.accept(data.data, range, true) {
                Ok(handler) => handler.send().await,
                Err(e) => read.fail(e).await,
            }
        } else {
            let read = self.reads.get_mut(&range.read_id).expect("present above");
            match read.accept(data.data, range, false) {
                Ok(handler) => handler.send().await,
                Err(e) => {
                    // A frame-level failure takes down the affected read
                    // only.
                    let mut read = self.reads.remove(&range.read_id).expect("present above");
                    read.fail(e).await;
                }
            }
        }
        Ok(())
    }

    async fn reconnect(
        &mut self,
        status: Status,
    ) -> Option<LoopResult<Option<Connection<ReadRequest, T::Stream>>>> {
        // Read-ids are only stable within one stream; re-key every pending
        // read before resuming.
        let reads = std::mem::take(&mut self.reads);
        let mut ranges = Vec::new();
        for (_, read) in reads {
            if read.is_retired() {
                continue;
            }
            let id = self.next_read_id;
            self.next_read_id += 1;
            let (read, _tombstone) = read.with_new_read_id(id);
            // Old-id tombstones are moot on a fresh stream; it only ever
            // carries the new ids.
            ranges.push(read.make_read_range());
            self.reads.insert(id, read);
        }
        let (response, connection) = match self.connector.reconnect(status, ranges).await {
            Err(e) => {
                let error = Arc::new(e);
                self.close_readers(error.clone()).await;
                return Some(Err(error));
            }
            Ok(pair) => pair,
        };
        if let Err(e) = self.handle_ranges(response.ranges).await {
            let error = Arc::new(e);
            self.close_readers(error.clone()).await;
            return Some(Err(error));
        }
        Some(Ok(Some(connection)))
    }

    async fn close_readers(&mut self, error: Arc<Error>) {
        use futures::StreamExt;
        let mut reads = std::mem::take(&mut self.reads);
        let closing = futures::stream::FuturesUnordered::new();
        for (_, read) in reads.iter_mut() {
            closing.push(read.interrupted(error.clone()));
        }
        let _ = closing.count().await;
    }

    async fn insert_read(&mut self, tx: Sender<ReadRequest>, read: StreamRead) {
        let id = self.next_read_id;
        self.next_read_id += 1;
        let read = read.assigned(id);
        let request = ReadRequest {
            spec: None,
            ranges: vec![read.make_read_range()],
        };
        self.reads.insert(id, read);
        // If this fails the main loop reconnects and includes the newly
        // inserted range in the resume request.
        if let Err(e) = tx.send(request).await {
            tracing::error!("error sending read range request: {e:?}");
        }
    }
}
