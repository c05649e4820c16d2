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

//! The incremental write channel.
//!
//! [Writer] buffers application writes until a quantum boundary, offers the
//! aligned chunks to the session state machine, and drives the bidi stream.
//! When the stream is interrupted the writer reopens it, replays the
//! unconfirmed message suffix, and continues; server-issued redirects carry
//! a routing token and write handle that the reopened stream presents.

use super::context::WriteCtx;
use super::state::UploadState;
use crate::checksum::Crc32cAccumulator;
use crate::chunk::ChunkSegmenter;
use crate::error::{WriteError, validate_checksums};
use crate::model::Object;
use crate::options::TransferOptions;
use crate::recovery::RecoveryLog;
use crate::resume_policy::{ResumeQuery, ResumeRedirect, ResumeResult, ResumePolicy};
use crate::transport::{Connection, ResponseStream, WriteTransport};
use crate::wire::{
    AppendSpec, ChecksummedData, FirstMessage, WriteHandle, WriteRequest, WriteSpec, WriteStatus,
};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum SessionKind {
    Resumable {
        upload_id: String,
    },
    Append {
        bucket: String,
        object: String,
        generation: i64,
    },
}

/// An incremental, resumable write channel.
///
/// # Example
/// ```no_run
/// # use objectstream::{wire::WriteSpec, write::Writer, options::TransferOptions};
/// # use std::sync::Arc;
/// # async fn sample<T: objectstream::transport::WriteTransport>(transport: Arc<T>) -> anyhow::Result<()> {
/// let spec = WriteSpec {
///     bucket: "projects/_/buckets/my-bucket".into(),
///     object: "my-object".into(),
///     ..WriteSpec::default()
/// };
/// let mut writer = Writer::open(transport, spec, TransferOptions::default()).await?;
/// writer.write("hello ").await?;
/// writer.write("world").await?;
/// let object = writer.finalize().await?;
/// println!("finalized: {object:?}");
/// # Ok(()) }
/// ```
pub struct Writer<T: WriteTransport> {
    transport: Arc<T>,
    options: TransferOptions,
    segmenter: ChunkSegmenter,
    kind: SessionKind,
    state: UploadState,
    ctx: WriteCtx,
    // None for takeover sessions: a writer that did not observe the whole
    // object cannot recompute its checksum.
    crc: Option<Crc32cAccumulator>,
    conn: Option<Connection<WriteRequest, T::Stream>>,
    tail: Vec<Bytes>,
    tail_len: u64,
    recovery: Option<RecoveryLog>,
    routing_token: Option<String>,
    redirect_handle: Option<WriteHandle>,
    resume_attempts: u32,
}

impl<T> Writer<T>
where
    T: WriteTransport,
{
    /// Starts a resumable session and opens the write stream.
    pub async fn open(transport: Arc<T>, spec: WriteSpec, options: TransferOptions) -> Result<Self> {
        let retry = options.retry_policy.clone();
        let backoff = options.backoff_policy.clone();
        let start_transport = transport.clone();
        let start_spec = spec.clone();
        let upload_id = crate::retry_policy::retry_loop(
            async |_| start_transport.start_session(&start_spec).await,
            retry,
            backoff,
        )
        .await?;
        let state = UploadState::resumable(
            upload_id.clone(),
            options.writer_buffer_size,
            options.max_chunk_size,
        );
        let mut writer = Self {
            segmenter: options.segmenter(),
            ctx: WriteCtx::new(options.quantum),
            crc: Some(Crc32cAccumulator::new()),
            conn: None,
            tail: Vec::new(),
            tail_len: 0,
            recovery: None,
            routing_token: None,
            redirect_handle: None,
            resume_attempts: 0,
            kind: SessionKind::Resumable { upload_id },
            state,
            transport,
            options,
        };
        writer.connect().await?;
        Ok(writer)
    }

    /// Like [open][Self::open], also mirroring every written byte into a
    /// recovery journal keyed by the session id.
    pub async fn open_with_recovery<P: AsRef<std::path::Path>>(
        transport: Arc<T>,
        spec: WriteSpec,
        options: TransferOptions,
        dir: P,
    ) -> Result<Self> {
        let mut writer = Self::open(transport, spec, options).await?;
        let session_id = writer
            .session_id()
            .expect("resumable sessions always have an id")
            .to_string();
        writer.recovery = Some(RecoveryLog::create(dir, session_id).await?);
        Ok(writer)
    }

    /// Takes over an existing appendable object.
    ///
    /// The writer accepts no data until the first response reports the
    /// authoritative resource size; writes then continue from that offset.
    pub async fn takeover(
        transport: Arc<T>,
        spec: AppendSpec,
        options: TransferOptions,
    ) -> Result<Self> {
        let kind = SessionKind::Append {
            bucket: spec.bucket.clone(),
            object: spec.object.clone(),
            generation: spec.generation,
        };
        let routing_token = spec.routing_token.clone();
        let redirect_handle = spec.write_handle.clone();
        let state =
            UploadState::takeover(spec, options.writer_buffer_size, options.max_chunk_size);
        let mut writer = Self {
            segmenter: options.segmenter(),
            ctx: WriteCtx::new(options.quantum),
            crc: None,
            conn: None,
            tail: Vec::new(),
            tail_len: 0,
            recovery: None,
            routing_token,
            redirect_handle,
            resume_attempts: 0,
            kind,
            state,
            transport,
            options,
        };
        writer.connect().await?;
        Ok(writer)
    }

    /// The remote session identifier, for resumable sessions.
    pub fn session_id(&self) -> Option<&str> {
        match &self.kind {
            SessionKind::Resumable { upload_id } => Some(upload_id),
            SessionKind::Append { .. } => None,
        }
    }

    /// Bytes the service has confirmed durable.
    pub fn confirmed(&self) -> Option<u64> {
        self.ctx.confirmed()
    }

    /// Accepts `data` into the channel, returning the bytes accepted.
    ///
    /// Bytes below the next quantum boundary are buffered locally; aligned
    /// data is chunked, checksummed and handed to the stream. The call
    /// blocks only when the session buffer is full, i.e. until earlier
    /// writes are confirmed.
    pub async fn write<B: Into<Bytes>>(&mut self, data: B) -> Result<usize> {
        let data: Bytes = data.into();
        if data.is_empty() {
            return Ok(0);
        }
        if let Some(log) = self.recovery.as_mut() {
            log.append(&data).await?;
        }
        self.tail_len += data.len() as u64;
        self.tail.push(data.clone());
        if self.tail_len >= self.segmenter.quantum() as u64 {
            self.dispatch_aligned().await?;
        }
        Ok(data.len())
    }

    /// Forces buffered aligned data onto the wire and waits until the
    /// service confirms everything offered so far.
    ///
    /// Bytes below the quantum boundary cannot be flushed; the protocol
    /// only acknowledges at quantum multiples.
    pub async fn flush(&mut self) -> Result<()> {
        self.dispatch_aligned().await?;
        let target = self.state.next_offer_offset();
        self.pump_reliably().await?;
        while self.ctx.confirmed().unwrap_or(0) < target {
            let _ = self.response_reliably().await?;
            self.pump_reliably().await?;
        }
        if let Some(log) = self.recovery.as_mut() {
            log.sync().await?;
        }
        Ok(())
    }

    /// Sends the remaining bytes and the finish marker, and waits for the
    /// finalized resource.
    pub async fn finalize(mut self) -> Result<Object> {
        let base = self.state.next_offer_offset();
        let buffers = std::mem::take(&mut self.tail);
        self.tail_len = 0;
        let chunks = self
            .segmenter
            .segment_final(base, buffers, self.options.checksums_enabled);
        for chunk in chunks {
            if let Some(crc) = self.crc.as_mut() {
                crc.update(chunk.offset, &chunk.data);
            }
            let request = WriteRequest {
                write_offset: chunk.offset,
                flush: !chunk.last,
                state_lookup: !chunk.last,
                finish_write: chunk.last,
                data: Some(ChecksummedData {
                    crc32c: chunk.crc32c.and_then(|v| v.value()),
                    content: chunk.data,
                }),
                ..WriteRequest::default()
            };
            self.offer_reliably(request).await?;
        }
        self.pump_reliably().await?;
        loop {
            if let Some(object) = self.response_reliably().await? {
                self.ctx
                    .check_finalized(object.size as u64)
                    .map_err(Error::ser)?;
                if let Some(crc) = &self.crc {
                    let computed = crc.finalize();
                    if computed.len() == object.size as u64 {
                        validate_checksums(&computed.finalize(), &object.checksums)
                            .map_err(|mismatch| {
                                Error::ser(WriteError::ChecksumMismatch { mismatch })
                            })?;
                    }
                }
                if let Some(log) = self.recovery.take() {
                    let _ = log.remove().await;
                }
                return Ok(object);
            }
            self.pump_reliably().await?;
        }
    }

    async fn dispatch_aligned(&mut self) -> Result<()> {
        let base = self.state.next_offer_offset();
        let buffers = std::mem::take(&mut self.tail);
        let segments = self
            .segmenter
            .segment(base, buffers, self.options.checksums_enabled);
        self.tail = segments.remainder;
        self.tail_len = self.tail.iter().map(|b| b.len() as u64).sum();
        for chunk in segments.chunks {
            if let Some(crc) = self.crc.as_mut() {
                crc.update(chunk.offset, &chunk.data);
            }
            let request = WriteRequest {
                write_offset: chunk.offset,
                flush: true,
                state_lookup: true,
                data: Some(ChecksummedData {
                    crc32c: chunk.crc32c.and_then(|v| v.value()),
                    content: chunk.data,
                }),
                ..WriteRequest::default()
            };
            self.offer_reliably(request).await?;
        }
        self.pump_reliably().await
    }

    async fn offer_reliably(&mut self, request: WriteRequest) -> Result<()> {
        loop {
            match self.state.offer(request.clone()) {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    // Buffer full or mid-reconciliation; progress the
                    // stream until the session accepts data again.
                    self.pump_reliably().await?;
                    match self.state.offer(request.clone()) {
                        Ok(true) => return Ok(()),
                        // A reconnect inside the pump may already have
                        // reconciled the session; only wait for an ack when
                        // the offer is still rejected.
                        Ok(false) => {
                            let _ = self.response_reliably().await?;
                        }
                        Err(e) => return Err(Error::ser(e)),
                    }
                }
                Err(e) => return Err(Error::ser(e)),
            }
        }
    }

    async fn pump_reliably(&mut self) -> Result<()> {
        loop {
            if self.conn.is_none() {
                self.connect().await?;
            }
            match self.pump().await {
                Ok(()) => return Ok(()),
                Err(e) => self.handle_interrupt(e).await?,
            }
        }
    }

    async fn response_reliably(&mut self) -> Result<Option<Object>> {
        loop {
            if self.conn.is_none() {
                self.connect().await?;
            }
            match self.process_response().await {
                Ok(value) => return Ok(value),
                Err(e) => self.handle_interrupt(e).await?,
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        loop {
            match self.establish().await {
                Ok(()) => return Ok(()),
                Err(e) => self.handle_interrupt(e).await?,
            }
        }
    }

    async fn establish(&mut self) -> Result<()> {
        let conn = super::open_stream(self.transport.as_ref()).await?;
        self.conn = Some(conn);
        self.pump().await?;
        // The session opener carries a state lookup; waiting for the
        // answer reconciles offsets before data flows.
        let _ = self.process_response().await?;
        Ok(())
    }

    /// Drains unsent messages from the session to the stream.
    async fn pump(&mut self) -> Result<()> {
        let requests = self.state.take_unsent().map_err(Error::ser)?;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::io("write stream not connected"))?;
        for request in requests {
            let end = request.end_offset();
            let has_data = request.data.is_some();
            conn.tx
                .send(request)
                .await
                .map_err(|_| Error::io("write stream closed while sending"))?;
            if has_data {
                self.ctx.record_sent_to(end);
            }
        }
        Ok(())
    }

    async fn process_response(&mut self) -> Result<Option<Object>> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::io("write stream not connected"))?;
        match conn.rx.next_message().await {
            Ok(Some(response)) => {
                let was_fixed = self.state.begin_offset_fixed();
                let object = self.state.on_response(&response).map_err(Error::ser)?;
                if let Some(WriteStatus::PersistedSize(n)) = response.status {
                    if !was_fixed && self.state.begin_offset_fixed() {
                        // Takeover reconciliation: the authoritative size
                        // becomes the sent/confirmed baseline.
                        self.ctx.record_sent_to(n);
                    }
                    self.ctx.record_confirmed(n).map_err(Error::ser)?;
                }
                Ok(object)
            }
            Ok(None) => Err(Error::io("write stream closed unexpectedly")),
            Err(status) => Err(Error::service(status)),
        }
    }

    /// Classifies a stream interruption and prepares the resend if the
    /// stream should be resumed.
    async fn handle_interrupt(&mut self, error: Error) -> Result<()> {
        if let Some(redirect) = error.redirect() {
            self.routing_token = redirect.routing_token.clone();
            if let Some(handle) = &redirect.handle {
                self.redirect_handle = Some(WriteHandle {
                    handle: handle.clone(),
                });
            }
        }
        let policy = ResumeRedirect::new(
            self.options.resume_policy.clone(),
            self.options.redirect_attempt_limit,
        );
        self.resume_attempts += 1;
        let query = ResumeQuery::new(self.resume_attempts);
        match policy.on_error(&query, error) {
            ResumeResult::Continue(e) => {
                tracing::debug!("resuming write stream after: {e}");
                self.conn = None;
                self.state.mark_retrying(self.opener()).map_err(Error::ser)?;
                Ok(())
            }
            ResumeResult::Exhausted(e) => Err(Error::exhausted(e)),
            ResumeResult::Permanent(e) => Err(e),
        }
    }

    fn opener(&self) -> WriteRequest {
        let first = match &self.kind {
            SessionKind::Resumable { upload_id } => FirstMessage::UploadId(upload_id.clone()),
            SessionKind::Append {
                bucket,
                object,
                generation,
            } => FirstMessage::AppendSpec(AppendSpec {
                bucket: bucket.clone(),
                object: object.clone(),
                generation: *generation,
                write_handle: self
                    .state
                    .write_handle()
                    .cloned()
                    .or_else(|| self.redirect_handle.clone()),
                routing_token: self.routing_token.clone(),
            }),
        };
        WriteRequest {
            first_message: Some(first),
            state_lookup: true,
            ..WriteRequest::default()
        }
    }
}

impl<T: WriteTransport> std::fmt::Debug for Writer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("kind", &self.kind)
            .field("state", &self.state.state())
            .field("confirmed", &self.ctx.confirmed())
            .field("tail_len", &self.tail_len)
            .field("resume_attempts", &self.resume_attempts)
            .finish()
    }
}
