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

//! The read path of the transfer engine.
//!
//! A [ReadSession] multiplexes any number of logical byte-range reads over
//! one transport stream. Each read is either *accumulating* (a future that
//! resolves with the whole range) or *streaming* (a pull-style reader that
//! never blocks the network side). Stream interruptions and server-issued
//! redirects are handled by reopening the stream and re-keying the pending
//! reads, without losing or duplicating bytes.

pub(crate) mod connector;
pub(crate) mod redirect;
pub(crate) mod remaining;
pub(crate) mod stream_read;
pub(crate) mod worker;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::ReadError;
use crate::model::Object;
use crate::options::TransferOptions;
use crate::range_spec::RangeSpec;
use crate::transport::ReadTransport;
use crate::wire::ReadSpec;
use crate::{Error, Result};
use self::connector::Connector;
use self::stream_read::StreamRead;
use self::worker::Worker;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

type ReadResult<T> = std::result::Result<T, ReadError>;

/// An open descriptor for reading ranges of one object.
///
/// # Example
/// ```no_run
/// # use objectstream::{range_spec::RangeSpec, read::ReadSession, wire::ReadSpec};
/// # use objectstream::options::TransferOptions;
/// # use std::sync::Arc;
/// # async fn sample<T: objectstream::transport::ReadTransport>(transport: Arc<T>) -> anyhow::Result<()> {
/// let spec = ReadSpec {
///     bucket: "projects/_/buckets/my-bucket".into(),
///     object: "my-object".into(),
///     ..ReadSpec::default()
/// };
/// let session = ReadSession::open(transport, spec, TransferOptions::default()).await?;
/// println!("metadata: {:?}", session.object());
/// let data = session.read_all(RangeSpec::segment(0, 1024)).await?.await?;
/// assert!(data.len() <= 1024);
/// # Ok(()) }
/// ```
#[derive(Debug)]
pub struct ReadSession {
    object: Arc<Object>,
    requests: mpsc::Sender<StreamRead>,
}

impl ReadSession {
    /// Opens the session and its underlying stream.
    pub async fn open<T: ReadTransport>(
        transport: Arc<T>,
        spec: ReadSpec,
        options: TransferOptions,
    ) -> Result<Self> {
        let mut connector = Connector::new(spec, options, transport);
        let (first, connection) = connector.connect(Vec::new()).await?;
        let object = Arc::new(first.metadata.unwrap_or_default());
        let (requests, rx) = mpsc::channel(16);
        let worker = Worker::new(connector);
        tokio::spawn(async move {
            if let Err(e) = worker.run(connection, rx).await {
                tracing::error!("read session worker terminated: {e}");
            }
        });
        Ok(Self { object, requests })
    }

    /// The object metadata reported when the session opened.
    pub fn object(&self) -> &Object {
        &self.object
    }

    /// Registers a streaming read for `range`.
    ///
    /// The returned reader offers both a non-blocking [read]
    /// [StreamingReader::read] and an async [next][StreamingReader::next].
    pub async fn read_range(&self, range: RangeSpec) -> Result<StreamingReader> {
        let (tx, rx) = mpsc::channel(2);
        let read = StreamRead::streaming(range, tx);
        self.requests
            .send(read)
            .await
            .map_err(|_| Error::io("read session closed"))?;
        Ok(StreamingReader {
            rx,
            leftover: None,
            eof: false,
            failed: None,
            _session: self.requests.clone(),
        })
    }

    /// Registers an accumulating read that resolves with the whole range as
    /// one contiguous buffer.
    ///
    /// Dropping the returned future cancels the read and releases any
    /// fragments buffered on its behalf.
    pub async fn read_all(&self, range: RangeSpec) -> Result<ReadFuture> {
        let (tx, rx) = oneshot::channel();
        let read = StreamRead::accumulating(range, tx);
        self.requests
            .send(read)
            .await
            .map_err(|_| Error::io("read session closed"))?;
        Ok(ReadFuture {
            rx,
            _session: self.requests.clone(),
        })
    }

    /// Registers an accumulating read that resolves with the fragments as
    /// delivered, avoiding the final copy into one buffer.
    pub async fn read_scattered(&self, range: RangeSpec) -> Result<ScatteredReadFuture> {
        let (tx, rx) = oneshot::channel();
        let read = StreamRead::zero_copy(range, tx);
        self.requests
            .send(read)
            .await
            .map_err(|_| Error::io("read session closed"))?;
        Ok(ScatteredReadFuture {
            rx,
            _session: self.requests.clone(),
        })
    }
}

/// Resolves with the whole requested range as one buffer.
#[derive(Debug)]
pub struct ReadFuture {
    rx: oneshot::Receiver<ReadResult<Bytes>>,
    // Keeps the worker task alive while the read is in flight.
    _session: mpsc::Sender<StreamRead>,
}

impl Future for ReadFuture {
    type Output = Result<Bytes>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use std::task::Poll;
        match std::pin::Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(Ok(value)),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(Error::io(e))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::io(
                "read session terminated before the read completed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Resolves with the requested range as the fragments the server streamed.
#[derive(Debug)]
pub struct ScatteredReadFuture {
    rx: oneshot::Receiver<ReadResult<Vec<Bytes>>>,
    _session: mpsc::Sender<StreamRead>,
}

impl Future for ScatteredReadFuture {
    type Output = Result<Vec<Bytes>>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use std::task::Poll;
        match std::pin::Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(Ok(value)),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(Error::io(e))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::io(
                "read session terminated before the read completed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The result of one non-blocking [StreamingReader::read] call.
///
/// This is the channel contract expressed as an exhaustive type: `Pending`
/// plays the role of a zero-byte read (data may still arrive), `Eof` the
/// role of the `-1` end-of-stream marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing buffered yet; not the end of the stream.
    Pending,
    /// This many bytes were copied into the destination.
    Data(usize),
    /// The range is fully delivered and drained.
    Eof,
}

/// A pull-style reader over one streaming range.
///
/// The network side hands fragments over a bounded channel; `read` only
/// copies what has already arrived and never blocks waiting for more.
#[derive(Debug)]
pub struct StreamingReader {
    rx: mpsc::Receiver<ReadResult<Bytes>>,
    leftover: Option<Bytes>,
    eof: bool,
    failed: Option<ReadError>,
    _session: mpsc::Sender<StreamRead>,
}

impl StreamingReader {
    /// Copies buffered bytes into `dst`, without blocking.
    ///
    /// At most one arrived fragment is consumed per call. The fragment's
    /// backing is released only once it is fully drained, which may take
    /// several calls for a small `dst`.
    ///
    /// A failure is sticky: once observed, every subsequent call reports
    /// the recorded cause.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<ReadOutcome> {
        if let Some(e) = &self.failed {
            return Err(Error::io(e.clone()));
        }
        loop {
            if let Some(left) = self.leftover.as_mut() {
                let n = left.len().min(dst.len());
                dst[..n].copy_from_slice(&left[..n]);
                let _ = left.split_to(n);
                if left.is_empty() {
                    self.leftover = None;
                }
                return Ok(ReadOutcome::Data(n));
            }
            if self.eof {
                return Ok(ReadOutcome::Eof);
            }
            match self.rx.try_recv() {
                Ok(Ok(fragment)) if fragment.is_empty() => continue,
                Ok(Ok(fragment)) => {
                    self.leftover = Some(fragment);
                }
                Ok(Err(e)) => {
                    self.failed = Some(e.clone());
                    return Err(Error::io(e));
                }
                Err(TryRecvError::Empty) => return Ok(ReadOutcome::Pending),
                Err(TryRecvError::Disconnected) => {
                    self.eof = true;
                    return Ok(ReadOutcome::Eof);
                }
            }
        }
    }

    /// Waits for and returns the next fragment; `None` is end of stream.
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        if let Some(left) = self.leftover.take() {
            return Some(Ok(left));
        }
        if let Some(e) = &self.failed {
            return Some(Err(Error::io(e.clone())));
        }
        if self.eof {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(fragment)) => Some(Ok(fragment)),
            Some(Err(e)) => {
                self.failed = Some(e.clone());
                Some(Err(Error::io(e)))
            }
            None => {
                self.eof = true;
                None
            }
        }
    }

    /// Stops the read and releases any buffered fragments.
    pub fn close(&mut self) {
        self.rx.close();
        self.leftover = None;
        self.eof = true;
    }
}
