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

//! Source-driven uploads.
//!
//! [Upload] streams a [RewindableContent] to the service one acknowledged
//! chunk at a time. Each attempt queries the persisted size, rewinds the
//! content to it, and resends from there; the retry loop around attempts is
//! governed by the configured policies.

use super::context::WriteCtx;
use crate::checksum::Crc32cAccumulator;
use crate::chunk::{Chunk, ChunkSegmenter};
use crate::content::RewindableContent;
use crate::error::{WriteError, validate_checksums};
use crate::model::Object;
use crate::options::TransferOptions;
use crate::recovery::RecoveryLog;
use crate::transport::{Connection, ResponseStream, WriteTransport};
use crate::wire::{ChecksummedData, FirstMessage, WriteRequest, WriteResponse, WriteSpec, WriteStatus};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;

/// An upload of a complete, rewindable byte source.
///
/// # Example
/// ```no_run
/// # use objectstream::{content::RewindableContent, wire::WriteSpec, write::Upload};
/// # use std::sync::Arc;
/// # async fn sample<T: objectstream::transport::WriteTransport>(transport: Arc<T>) -> anyhow::Result<()> {
/// let content = RewindableContent::from_bytes("hello world".into());
/// let spec = WriteSpec {
///     bucket: "projects/_/buckets/my-bucket".into(),
///     object: "my-object".into(),
///     ..WriteSpec::default()
/// };
/// let object = Upload::new(transport, spec, content).send().await?;
/// println!("finalized: {object:?}");
/// # Ok(()) }
/// ```
pub struct Upload<T> {
    transport: Arc<T>,
    spec: WriteSpec,
    content: RewindableContent,
    upload_id: Option<String>,
    options: TransferOptions,
}

impl<T> Upload<T>
where
    T: WriteTransport,
{
    pub fn new(transport: Arc<T>, spec: WriteSpec, content: RewindableContent) -> Self {
        Self {
            transport,
            spec,
            content,
            upload_id: None,
            options: TransferOptions::default(),
        }
    }

    /// Resumes an interrupted upload from its local recovery journal.
    ///
    /// The journal mirrors every byte handed to the original upload, so the
    /// resumed attempt can replay unacknowledged bytes from disk even if
    /// the original source is gone.
    pub async fn from_recovery<P, S>(transport: Arc<T>, dir: P, upload_id: S) -> Result<Self>
    where
        P: AsRef<std::path::Path>,
        S: Into<String>,
    {
        let upload_id = upload_id.into();
        let mut log = RecoveryLog::open(dir, upload_id.clone()).await?;
        let content = log.content().await?;
        Ok(Self {
            transport,
            spec: WriteSpec::default(),
            content,
            upload_id: Some(upload_id),
            options: TransferOptions::default(),
        })
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs the upload to completion, returning the finalized resource.
    pub async fn send(mut self) -> Result<Object> {
        let retry = self.options.retry_policy.clone();
        let backoff = self.options.backoff_policy.clone();
        let upload_id = match self.upload_id.take() {
            Some(id) => id,
            None => {
                let transport = self.transport.clone();
                let spec = self.spec.clone();
                crate::retry_policy::retry_loop(
                    async |_| transport.start_session(&spec).await,
                    retry.clone(),
                    backoff.clone(),
                )
                .await?
            }
        };

        let options = self.options.clone();
        let segmenter = options.segmenter();
        let ctx = WriteCtx::new(options.quantum);
        let mut crc = Crc32cAccumulator::new();
        let mut content = self.content;
        let transport = self.transport.clone();
        crate::retry_policy::retry_loop(
            async |_attempt| {
                self::attempt(
                    transport.as_ref(),
                    &upload_id,
                    &options,
                    &segmenter,
                    &ctx,
                    &mut content,
                    &mut crc,
                )
                .await
            },
            retry,
            backoff,
        )
        .await
    }
}

async fn attempt<T: WriteTransport>(
    transport: &T,
    upload_id: &str,
    options: &TransferOptions,
    segmenter: &ChunkSegmenter,
    ctx: &WriteCtx,
    content: &mut RewindableContent,
    crc: &mut Crc32cAccumulator,
) -> Result<Object> {
    let mut conn = super::open_stream(transport).await?;
    let opener = WriteRequest {
        first_message: Some(FirstMessage::UploadId(upload_id.to_string())),
        state_lookup: true,
        ..WriteRequest::default()
    };
    send(&mut conn, opener).await?;
    let persisted = match next_status(&mut conn).await? {
        WriteStatus::PersistedSize(n) => n,
        // The session finalized in an earlier attempt whose response was
        // lost.
        WriteStatus::Resource(object) => return finished(crc, object),
    };
    ctx.record_confirmed(persisted).map_err(Error::ser)?;
    content.rewind_to(persisted)?;

    let mut offset = persisted;
    let mut pending: Vec<Bytes> = Vec::new();
    let mut pending_len = 0_u64;
    while let Some(buffer) = content.next(segmenter.max_chunk_size()).await? {
        pending_len += buffer.len() as u64;
        pending.push(buffer);
        if pending_len < segmenter.max_chunk_size() as u64 {
            continue;
        }
        let segments = segmenter.segment(offset, pending.drain(..), options.checksums_enabled);
        for chunk in segments.chunks {
            offset = send_chunk(&mut conn, ctx, crc, chunk).await?;
            let ack = match next_status(&mut conn).await? {
                WriteStatus::PersistedSize(n) => n,
                WriteStatus::Resource(_) => {
                    return Err(Error::deser("unexpected finalized resource mid-upload"));
                }
            };
            ctx.record_confirmed(ack).map_err(Error::ser)?;
        }
        pending = segments.remainder;
        pending_len = pending.iter().map(|b| b.len() as u64).sum();
    }

    for chunk in segmenter.segment_final(offset, pending.drain(..), options.checksums_enabled) {
        offset = send_chunk(&mut conn, ctx, crc, chunk).await?;
    }
    loop {
        match next_status(&mut conn).await? {
            WriteStatus::PersistedSize(n) => ctx.record_confirmed(n).map_err(Error::ser)?,
            WriteStatus::Resource(object) => {
                ctx.check_finalized(object.size as u64).map_err(Error::ser)?;
                return finished(crc, object);
            }
        }
    }
}

async fn send_chunk<S>(
    conn: &mut Connection<WriteRequest, S>,
    ctx: &WriteCtx,
    crc: &mut Crc32cAccumulator,
    chunk: Chunk,
) -> Result<u64>
where
    S: ResponseStream<WriteResponse>,
{
    crc.update(chunk.offset, &chunk.data);
    let end = chunk.end_offset();
    let request = WriteRequest {
        write_offset: chunk.offset,
        data: Some(ChecksummedData {
            crc32c: chunk.crc32c.and_then(|v| v.value()),
            content: chunk.data,
        }),
        flush: !chunk.last,
        state_lookup: !chunk.last,
        finish_write: chunk.last,
        ..WriteRequest::default()
    };
    send(conn, request).await?;
    ctx.record_sent_to(end);
    Ok(end)
}

async fn send<S>(conn: &mut Connection<WriteRequest, S>, request: WriteRequest) -> Result<()> {
    conn.tx
        .send(request)
        .await
        .map_err(|_| Error::io("write stream closed while sending"))
}

async fn next_status<S>(conn: &mut Connection<WriteRequest, S>) -> Result<WriteStatus>
where
    S: ResponseStream<WriteResponse>,
{
    loop {
        match conn.rx.next_message().await {
            Ok(Some(WriteResponse {
                status: Some(status),
                ..
            })) => return Ok(status),
            Ok(Some(_)) => continue,
            Ok(None) => return Err(Error::io("write stream closed before the upload completed")),
            Err(status) => return Err(Error::service(status)),
        }
    }
}

/// Validates the finalized resource against the observed bytes.
///
/// The checksum comparison only applies when this process observed every
/// byte of the object; an upload resumed mid-object cannot recompute the
/// full-object value.
fn finished(crc: &Crc32cAccumulator, object: Object) -> Result<Object> {
    let computed = crc.finalize();
    if computed.len() == object.size as u64 {
        validate_checksums(&computed.finalize(), &object.checksums)
            .map_err(|mismatch| Error::ser(WriteError::ChecksumMismatch { mismatch }))?;
    }
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FailPoint, FakeWriteTransport};
    use super::*;
    use crate::error::rpc::{Code, Status};
    use crate::retry_policy::{RetryPolicyExt, TransientErrors};
    use std::error::Error as _;

    fn quick_options() -> TransferOptions {
        TransferOptions::default()
            .with_quantum(64)
            .with_max_chunk_size(128)
            .with_retry_policy(TransientErrors.with_attempt_limit(5))
            .with_backoff_policy(crate::backoff_policy::ExponentialBackoff::new(
                std::time::Duration::from_millis(1),
                std::time::Duration::from_millis(1),
                1.0,
            ))
    }

    fn spec() -> WriteSpec {
        WriteSpec {
            bucket: "projects/_/buckets/test-bucket".into(),
            object: "test-object".into(),
            ..WriteSpec::default()
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn simple_upload() -> anyhow::Result<()> {
        let data = payload(300);
        let transport = Arc::new(FakeWriteTransport::new());
        let object = Upload::new(
            transport.clone(),
            spec(),
            RewindableContent::from_bytes(Bytes::from_owner(data.clone())),
        )
        .with_options(quick_options())
        .send()
        .await?;
        assert_eq!(object.size, 300);
        assert_eq!(transport.content(), data);
        assert_eq!(
            object.checksums.and_then(|c| c.crc32c),
            Some(crc32c::crc32c(&data))
        );
        Ok(())
    }

    #[tokio::test]
    async fn zero_byte_upload() -> anyhow::Result<()> {
        let transport = Arc::new(FakeWriteTransport::new());
        let object = Upload::new(transport.clone(), spec(), RewindableContent::empty())
            .with_options(quick_options())
            .send()
            .await?;
        assert_eq!(object.size, 0);
        // Finalizing a zero-byte object still sends exactly one terminal
        // message.
        let requests = transport.log.lock().unwrap().requests.clone();
        let finish: Vec<_> = requests.iter().filter(|r| r.finish_write).collect();
        assert_eq!(finish.len(), 1, "{requests:?}");
        assert_eq!(finish[0].data_len(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn retry_rewinds_to_confirmed() -> anyhow::Result<()> {
        let data = payload(256 + 32);
        // The second data message dies with the stream; the retry must
        // resend only from the confirmed offset.
        let transport = Arc::new(FakeWriteTransport::with_plan([
            FailPoint::AfterDataMessages(2, Status::new(Code::Unavailable, "broken pipe")),
        ]));
        let object = Upload::new(
            transport.clone(),
            spec(),
            RewindableContent::from_bytes(Bytes::from_owner(data.clone())),
        )
        .with_options(quick_options())
        .send()
        .await?;
        assert_eq!(object.size, data.len() as i64);
        assert_eq!(transport.content(), data);
        assert_eq!(transport.connections(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn multi_buffer_retry() -> anyhow::Result<()> {
        let data = payload(400);
        let buffers = vec![
            Bytes::from_owner(data[..100].to_vec()),
            Bytes::from_owner(data[100..250].to_vec()),
            Bytes::from_owner(data[250..].to_vec()),
        ];
        let transport = Arc::new(FakeWriteTransport::with_plan([
            FailPoint::AfterDataMessages(1, Status::new(Code::Unavailable, "reset")),
        ]));
        let object = Upload::new(
            transport.clone(),
            spec(),
            RewindableContent::from_buffers(buffers),
        )
        .with_options(quick_options())
        .send()
        .await?;
        assert_eq!(object.size, 400);
        assert_eq!(transport.content(), data);
        Ok(())
    }

    #[tokio::test]
    async fn short_ack_is_data_loss() -> anyhow::Result<()> {
        let data = payload(256);
        // The first chunk ack confirms 128 bytes; the second ack claims
        // only 0 are persisted, uncommitting durable bytes.
        let transport = Arc::new(FakeWriteTransport::with_plan([
            FailPoint::MisreportPersisted {
                after_data_messages: 2,
                value: 0,
            },
        ]));
        let err = Upload::new(
            transport,
            spec(),
            RewindableContent::from_bytes(Bytes::from_owner(data)),
        )
        .with_options(quick_options())
        .send()
        .await
        .unwrap_err();
        assert!(err.is_serialization(), "{err:?}");
        let source = err.source().and_then(|e| e.downcast_ref::<WriteError>());
        assert!(
            matches!(source, Some(WriteError::UnexpectedRewind { .. })),
            "{err:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn over_ack_is_data_loss() -> anyhow::Result<()> {
        // The service claims more bytes persisted than the client ever
        // sent.
        let transport = Arc::new(FakeWriteTransport::with_plan([
            FailPoint::MisreportPersisted {
                after_data_messages: 1,
                value: 1000,
            },
        ]));
        let err = Upload::new(
            transport,
            spec(),
            RewindableContent::from_bytes(Bytes::from_owner(payload(192))),
        )
        .with_options(quick_options())
        .send()
        .await
        .unwrap_err();
        assert!(err.is_serialization(), "{err:?}");
        let source = err.source().and_then(|e| e.downcast_ref::<WriteError>());
        assert!(
            matches!(source, Some(WriteError::TooMuchProgress { .. })),
            "{err:?}"
        );
        Ok(())
    }
}
