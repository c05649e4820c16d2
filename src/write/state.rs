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

//! The per-session state machine for bidi write streams.
//!
//! The session buffers outgoing messages until the service confirms them
//! durable, compacts redundant messages, and replays the unconfirmed suffix
//! after a retry. It is a pure state machine: it never touches the
//! transport. The driver feeds it with [offer][UploadState::offer], drains
//! it with [take_unsent][UploadState::take_unsent], and reconciles it with
//! [on_response][UploadState::on_response], so every transition is
//! unit-testable without a live stream.
//!
//! The buffer is owned by a single driver; `offer`, `take_unsent` and
//! `on_response` must be externally serialized. Responses arriving
//! asynchronously are handed through that same serialization point.

use crate::error::WriteError;
use crate::model::Object;
use crate::wire::{
    AppendSpec, ChecksummedData, FirstMessage, WriteHandle, WriteRequest, WriteResponse,
    WriteSpec, WriteStatus,
};
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;

type WriteResult<T> = std::result::Result<T, WriteError>;

/// The lifecycle of a write session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// A takeover session awaiting the authoritative size from the server.
    ///
    /// No application data is accepted until the first response fixes the
    /// begin offset.
    AwaitingTakeover,
    /// Accepting offers.
    Open,
    /// A finish marker is buffered; no further data is accepted.
    Finalizing,
    /// The transport failed; offers are rejected until the peer's offset is
    /// reconciled from a response.
    Retrying,
    /// The session completed or was abandoned.
    Closed,
}

/// Buffered, not-yet-confirmed outgoing messages for one write session.
#[derive(Debug)]
pub struct UploadState {
    state: SessionState,
    /// The write offset believed by the peer before anything buffered here
    /// was sent.
    begin_offset: u64,
    pending: VecDeque<WriteRequest>,
    /// Index into `pending` of the last message handed to the transport.
    last_sent: Option<usize>,
    /// The offset the next offered message must carry.
    next_offer_offset: u64,
    enqueued_bytes: u64,
    max_buffered_bytes: u64,
    max_message_size: usize,
    write_handle: Option<WriteHandle>,
    finish_offered: bool,
    /// False for takeover sessions until the first response reports the
    /// authoritative resource size.
    begin_fixed: bool,
}

impl UploadState {
    /// A session opening a brand-new object.
    pub fn new(spec: WriteSpec, max_buffered_bytes: usize, max_message_size: usize) -> Self {
        Self::with_first_message(
            FirstMessage::WriteSpec(spec),
            SessionState::Open,
            max_buffered_bytes,
            max_message_size,
            true,
        )
    }

    /// A session continuing a previously started resumable upload.
    pub fn resumable<S: Into<String>>(
        upload_id: S,
        max_buffered_bytes: usize,
        max_message_size: usize,
    ) -> Self {
        Self::with_first_message(
            FirstMessage::UploadId(upload_id.into()),
            SessionState::Open,
            max_buffered_bytes,
            max_message_size,
            true,
        )
    }

    /// A session taking over an existing appendable object.
    ///
    /// The session stays in [SessionState::AwaitingTakeover] until the first
    /// response reports the authoritative resource size.
    pub fn takeover(spec: AppendSpec, max_buffered_bytes: usize, max_message_size: usize) -> Self {
        let mut state = Self::with_first_message(
            FirstMessage::AppendSpec(spec),
            SessionState::AwaitingTakeover,
            max_buffered_bytes,
            max_message_size,
            false,
        );
        // The opener doubles as the reconciliation round-trip.
        state.pending[0].state_lookup = true;
        state
    }

    fn with_first_message(
        first: FirstMessage,
        state: SessionState,
        max_buffered_bytes: usize,
        max_message_size: usize,
        begin_fixed: bool,
    ) -> Self {
        let opener = WriteRequest {
            first_message: Some(first),
            ..WriteRequest::default()
        };
        Self {
            state,
            begin_offset: 0,
            pending: VecDeque::from([opener]),
            last_sent: None,
            next_offer_offset: 0,
            enqueued_bytes: 0,
            max_buffered_bytes: max_buffered_bytes as u64,
            max_message_size,
            write_handle: None,
            finish_offered: false,
            begin_fixed,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn begin_offset(&self) -> u64 {
        self.begin_offset
    }

    /// The offset the next offered message must carry.
    pub fn next_offer_offset(&self) -> u64 {
        self.next_offer_offset
    }

    pub fn write_handle(&self) -> Option<&WriteHandle> {
        self.write_handle.as_ref()
    }

    pub fn is_finalizing(&self) -> bool {
        self.finish_offered
    }

    /// False for a takeover session until the authoritative size arrives.
    pub fn begin_offset_fixed(&self) -> bool {
        self.begin_fixed
    }

    /// Bytes that can still be buffered before offers are rejected.
    pub fn available_capacity(&self) -> u64 {
        self.max_buffered_bytes.saturating_sub(self.enqueued_bytes)
    }

    /// Appends a message to the buffered sequence.
    ///
    /// Returns `Ok(false)` when the session cannot accept the message right
    /// now (buffer full, or mid-retry/takeover reconciliation). Offsets that
    /// break contiguity and offers after finalization are errors, not
    /// backpressure.
    pub fn offer(&mut self, request: WriteRequest) -> WriteResult<bool> {
        if self.state == SessionState::Closed || self.finish_offered {
            return Err(WriteError::SessionFinalized);
        }
        if request.first_message.is_some() {
            return Err(WriteError::InvariantViolation(
                "session-open messages are enqueued by the session itself".into(),
            ));
        }
        if matches!(
            self.state,
            SessionState::AwaitingTakeover | SessionState::Retrying
        ) {
            return Ok(false);
        }
        if request.write_offset != self.next_offer_offset {
            return Err(WriteError::NonContiguousOffer {
                expected: self.next_offer_offset,
                got: request.write_offset,
            });
        }
        let len = request.data_len();
        if len > 0 && self.enqueued_bytes > 0 && self.enqueued_bytes + len > self.max_buffered_bytes
        {
            return Ok(false);
        }

        self.next_offer_offset = request.end_offset();
        self.enqueued_bytes += len;
        if request.finish_write {
            self.finish_offered = true;
            self.state = SessionState::Finalizing;
        }

        if let Some(merged) = self.try_compact(&request) {
            let back = self.pending.back_mut().expect("compaction requires a tail");
            *back = merged;
        } else {
            self.pending.push_back(request);
        }
        Ok(true)
    }

    /// Merges `request` into the buffered tail message when allowed.
    ///
    /// Only unsent messages can change, and a merged message must stay
    /// within the wire size limit. Two shapes merge: plain data followed by
    /// plain data, and plain data followed by a data-less finish marker
    /// (finish implies flush and state-lookup, so those flags are dropped).
    fn try_compact(&self, request: &WriteRequest) -> Option<WriteRequest> {
        let back_index = self.pending.len().checked_sub(1)?;
        if self.last_sent.is_some_and(|sent| sent >= back_index) {
            return None;
        }
        let back = self.pending.back()?;
        if !back.is_plain_data() || back.end_offset() != request.write_offset {
            return None;
        }
        if request.is_plain_data() {
            let merged_len = (back.data_len() + request.data_len()) as usize;
            if merged_len > self.max_message_size {
                return None;
            }
            let a = back.data.as_ref().expect("plain data");
            let b = request.data.as_ref().expect("plain data");
            return Some(WriteRequest {
                write_offset: back.write_offset,
                data: Some(self::concat_data(a, b)),
                ..WriteRequest::default()
            });
        }
        if request.finish_write && request.data.is_none() {
            let mut merged = back.clone();
            merged.finish_write = true;
            merged.flush = false;
            merged.state_lookup = false;
            return Some(merged);
        }
        None
    }

    /// Drains the messages not yet handed to the transport, in order.
    ///
    /// Enforced on every drain: the emitted sequence is offset-contiguous,
    /// only the last emitted message may carry a finish marker, and a
    /// session-open message can only be emitted when nothing was sent
    /// before it.
    pub fn take_unsent(&mut self) -> WriteResult<Vec<WriteRequest>> {
        if self.state == SessionState::Closed {
            return Err(WriteError::SessionFinalized);
        }
        let start = self.last_sent.map_or(0, |i| i + 1);
        if start >= self.pending.len() {
            return Ok(Vec::new());
        }
        let drained: Vec<WriteRequest> =
            self.pending.iter().skip(start).cloned().collect();
        if drained[0].first_message.is_some() && self.last_sent.is_some() {
            return Err(WriteError::InvariantViolation(
                "session-open message after data was already sent".into(),
            ));
        }
        for pair in drained.windows(2) {
            if pair[0].finish_write {
                return Err(WriteError::InvariantViolation(
                    "finish marker on a non-final message".into(),
                ));
            }
            if pair[0].first_message.is_none()
                && pair[1].first_message.is_none()
                && pair[0].end_offset() != pair[1].write_offset
            {
                return Err(WriteError::InvariantViolation(format!(
                    "non-contiguous buffered sequence: {} then {}",
                    pair[0].end_offset(),
                    pair[1].write_offset
                )));
            }
        }
        self.last_sent = Some(self.pending.len() - 1);
        Ok(drained)
    }

    /// Reconciles the session with a response from the service.
    ///
    /// Trims the prefix of the buffer the response confirms as durable.
    /// Returns the finalized resource once the response signals completion,
    /// otherwise `None` and the session stays open for more data.
    pub fn on_response(&mut self, response: &WriteResponse) -> WriteResult<Option<Object>> {
        if let Some(handle) = &response.write_handle {
            self.write_handle = Some(handle.clone());
        }
        match &response.status {
            None => Ok(None),
            Some(WriteStatus::PersistedSize(n)) => {
                if !self.begin_fixed {
                    self.begin_offset = *n;
                    self.next_offer_offset = *n;
                    self.begin_fixed = true;
                }
                self.trim_confirmed(*n)?;
                self.state = match self.state {
                    SessionState::AwaitingTakeover | SessionState::Retrying
                        if self.finish_offered =>
                    {
                        SessionState::Finalizing
                    }
                    SessionState::AwaitingTakeover | SessionState::Retrying => SessionState::Open,
                    s => s,
                };
                Ok(None)
            }
            Some(WriteStatus::Resource(object)) => {
                self.pending.clear();
                self.last_sent = None;
                self.enqueued_bytes = 0;
                self.state = SessionState::Closed;
                Ok(Some(object.clone()))
            }
        }
    }

    /// Enters the retry sub-state after a transport failure.
    ///
    /// Any stale session-open message is discarded, `opener` (which must be
    /// a session-open message, typically carrying the latest write handle
    /// and routing token) is queued first, and the whole unconfirmed suffix
    /// becomes eligible to resend. No new data is accepted until a response
    /// reconciles the peer's offset.
    pub fn mark_retrying(&mut self, opener: WriteRequest) -> WriteResult<()> {
        if self.state == SessionState::Closed {
            return Err(WriteError::SessionFinalized);
        }
        if opener.first_message.is_none() {
            return Err(WriteError::InvariantViolation(
                "retry opener must be a session-open message".into(),
            ));
        }
        self.pending.retain(|m| m.first_message.is_none());
        self.pending.push_front(opener);
        self.last_sent = None;
        self.state = SessionState::Retrying;
        Ok(())
    }

    /// The write offset of the next drain.
    ///
    /// Walks the buffered sequence from the tail backward over the unsent
    /// suffix. A session-open message resets the expected offset to the
    /// session's begin offset; otherwise it is the first unsent message's
    /// stamped offset.
    pub fn expected_begin_offset(&self) -> u64 {
        let start = self.last_sent.map_or(0, |i| i + 1);
        let mut expected = self.next_offer_offset;
        for m in self
            .pending
            .iter()
            .skip(start)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
        {
            if m.first_message.is_some() {
                return self.begin_offset;
            }
            expected = m.write_offset;
        }
        expected
    }

    fn trim_confirmed(&mut self, persisted: u64) -> WriteResult<()> {
        loop {
            let sent = self.last_sent.map_or(0, |i| i + 1);
            let Some(front) = self.pending.front_mut() else {
                return Ok(());
            };
            if front.first_message.is_some() {
                // Any response implies the (sub-)session is open; the
                // opener is done once it was actually sent.
                if sent == 0 {
                    return Ok(());
                }
                self.pending.pop_front();
                self.shift_last_sent(1);
                continue;
            }
            if front.data_len() > 0 && front.end_offset() <= persisted {
                self.enqueued_bytes -= front.data_len();
                let finished = front.finish_write;
                self.pending.pop_front();
                self.shift_last_sent(1);
                if finished {
                    return Ok(());
                }
                continue;
            }
            if front.data_len() > 0
                && front.write_offset < persisted
                && persisted < front.end_offset()
            {
                // The confirmation lands inside this message; keep only the
                // unconfirmed remainder.
                let cut = (persisted - front.write_offset) as usize;
                let data = front.data.as_mut().expect("data_len() > 0");
                let _ = data.content.split_to(cut);
                data.crc32c = data.crc32c.map(|_| crc32c::crc32c(&data.content));
                front.write_offset = persisted;
                self.enqueued_bytes -= cut as u64;
                return Ok(());
            }
            if front.data.is_none()
                && !front.finish_write
                && front.write_offset <= persisted
                && sent > 0
            {
                // A sent flush/state-lookup message is answered by this
                // response.
                self.pending.pop_front();
                self.shift_last_sent(1);
                continue;
            }
            // Data past the confirmation stays as the replay suffix.
            return Ok(());
        }
    }

    fn shift_last_sent(&mut self, removed: usize) {
        self.last_sent = match self.last_sent {
            Some(i) if i >= removed => Some(i - removed),
            _ => None,
        };
    }

    #[cfg(test)]
    pub(crate) fn peek_first(&self) -> Option<&WriteRequest> {
        self.pending.front()
    }

    #[cfg(test)]
    pub(crate) fn peek_last(&self) -> Option<&WriteRequest> {
        self.pending.back()
    }

    #[cfg(test)]
    pub(crate) fn last_sent_index(&self) -> Option<usize> {
        self.last_sent
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn concat_data(a: &ChecksummedData, b: &ChecksummedData) -> ChecksummedData {
    let mut content = BytesMut::with_capacity(a.content.len() + b.content.len());
    content.put(a.content.clone());
    content.put(b.content.clone());
    let crc32c = match (a.crc32c, b.crc32c) {
        (Some(x), Some(y)) => Some(crc32c::crc32c_combine(x, y, b.content.len())),
        _ => None,
    };
    ChecksummedData {
        content: content.freeze(),
        crc32c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const MAX_BUFFERED: usize = 1024;
    const MAX_MESSAGE: usize = 256;

    fn plain(offset: u64, data: &'static [u8]) -> WriteRequest {
        WriteRequest {
            write_offset: offset,
            data: Some(ChecksummedData {
                content: Bytes::from_static(data),
                crc32c: Some(crc32c::crc32c(data)),
            }),
            ..WriteRequest::default()
        }
    }

    fn appendable_frame(offset: u64, data: &'static [u8]) -> WriteRequest {
        WriteRequest {
            flush: true,
            state_lookup: true,
            ..plain(offset, data)
        }
    }

    fn finish(offset: u64) -> WriteRequest {
        WriteRequest {
            write_offset: offset,
            finish_write: true,
            ..WriteRequest::default()
        }
    }

    fn spec() -> WriteSpec {
        WriteSpec {
            bucket: "test-bucket".into(),
            object: "test-object".into(),
            appendable: true,
            ..WriteSpec::default()
        }
    }

    fn persisted(n: u64) -> WriteResponse {
        WriteResponse {
            status: Some(WriteStatus::PersistedSize(n)),
            ..WriteResponse::default()
        }
    }

    fn opened(state: &mut UploadState) {
        // Send the session opener and acknowledge zero persisted bytes so
        // the opener is trimmed, as happens on a live stream.
        let drained = state.take_unsent().unwrap();
        assert_eq!(drained.len(), 1, "{drained:?}");
        assert!(drained[0].first_message.is_some(), "{drained:?}");
        state.on_response(&persisted(0)).unwrap();
        assert_eq!(state.pending_len(), 0);
        assert_eq!(state.last_sent_index(), None);
    }

    #[test]
    fn four_messages_in_order() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);

        assert!(state.offer(appendable_frame(0, b"a")).unwrap());
        assert!(state.offer(appendable_frame(1, b"b")).unwrap());
        assert!(state.offer(appendable_frame(2, b"c")).unwrap());
        assert!(state.offer(finish(3)).unwrap());

        let drained = state.take_unsent().unwrap();
        assert_eq!(drained.len(), 4, "{drained:?}");
        let offsets: Vec<u64> = drained.iter().map(|m| m.write_offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
        assert!(drained[3].finish_write);
        assert!(drained[..3].iter().all(|m| !m.finish_write));
        assert_eq!(state.last_sent_index(), Some(3));
        assert_eq!(state.state(), SessionState::Finalizing);
    }

    #[test]
    fn compaction_merges_plain_data() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);

        assert!(state.offer(plain(0, b"hello ")).unwrap());
        assert!(state.offer(plain(6, b"world")).unwrap());
        assert_eq!(state.pending_len(), 1, "{state:?}");
        let merged = state.peek_last().unwrap();
        assert_eq!(merged.write_offset, 0);
        assert_eq!(
            merged.data.as_ref().unwrap().content,
            Bytes::from_static(b"hello world")
        );
        assert_eq!(
            merged.data.as_ref().unwrap().crc32c,
            Some(crc32c::crc32c(b"hello world"))
        );
    }

    #[test]
    fn compaction_skips_sent_messages() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);

        assert!(state.offer(plain(0, b"hello ")).unwrap());
        let _ = state.take_unsent().unwrap();
        assert!(state.offer(plain(6, b"world")).unwrap());
        // The first message was already handed to the transport; merging
        // into it would change sent bytes.
        assert_eq!(state.pending_len(), 2, "{state:?}");
    }

    #[test]
    fn compaction_respects_message_size() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, 8);
        opened(&mut state);
        assert!(state.offer(plain(0, b"12345")).unwrap());
        assert!(state.offer(plain(5, b"6789a")).unwrap());
        assert_eq!(state.pending_len(), 2, "{state:?}");
    }

    #[test]
    fn finish_merges_into_tail_data() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);
        assert!(state.offer(plain(0, b"abc")).unwrap());
        assert!(state.offer(finish(3)).unwrap());
        assert_eq!(state.pending_len(), 1, "{state:?}");
        let merged = state.peek_last().unwrap();
        assert!(merged.finish_write);
        assert!(!merged.flush && !merged.state_lookup);
        assert_eq!(merged.data_len(), 3);
        assert_eq!(state.state(), SessionState::Finalizing);
    }

    #[test]
    fn offer_after_finalize_rejected() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);
        assert!(state.offer(finish(0)).unwrap());
        let err = state.offer(plain(0, b"abc")).unwrap_err();
        assert!(matches!(err, WriteError::SessionFinalized), "{err:?}");
    }

    #[test]
    fn non_contiguous_offer_fails_fast() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);
        assert!(state.offer(plain(0, b"abc")).unwrap());
        let err = state.offer(plain(5, b"def")).unwrap_err();
        assert!(
            matches!(err, WriteError::NonContiguousOffer { expected: 3, got: 5 }),
            "{err:?}"
        );
    }

    #[test]
    fn capacity_backpressure() {
        let mut state = UploadState::resumable("upload-1", 4, MAX_MESSAGE);
        opened(&mut state);
        assert!(state.offer(appendable_frame(0, b"1234")).unwrap());
        assert_eq!(state.available_capacity(), 0);
        assert!(!state.offer(appendable_frame(4, b"5")).unwrap());
        // Confirming the buffered bytes frees capacity.
        let _ = state.take_unsent().unwrap();
        state.on_response(&persisted(4)).unwrap();
        assert!(state.offer(appendable_frame(4, b"5")).unwrap());
    }

    #[test]
    fn first_message_only_at_index_zero() {
        let mut state = UploadState::new(spec(), MAX_BUFFERED, MAX_MESSAGE);
        let drained = state.take_unsent().unwrap();
        assert!(drained[0].first_message.is_some());
        assert_eq!(state.last_sent_index(), Some(0));

        // A stale opener after data was sent is an internal bug.
        let err = state
            .offer(WriteRequest {
                first_message: Some(FirstMessage::UploadId("other".into())),
                ..WriteRequest::default()
            })
            .unwrap_err();
        assert!(matches!(err, WriteError::InvariantViolation(_)), "{err:?}");
    }

    #[test]
    fn response_trims_confirmed_prefix() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);
        assert!(state.offer(appendable_frame(0, b"aaaa")).unwrap());
        assert!(state.offer(appendable_frame(4, b"bbbb")).unwrap());
        let _ = state.take_unsent().unwrap();

        state.on_response(&persisted(4)).unwrap();
        assert_eq!(state.pending_len(), 1, "{state:?}");
        assert_eq!(state.peek_first().unwrap().write_offset, 4);
        assert_eq!(state.last_sent_index(), Some(0));
        // Nothing new to send.
        assert!(state.take_unsent().unwrap().is_empty());
    }

    #[test]
    fn response_splits_partially_confirmed_message() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);
        assert!(state.offer(appendable_frame(0, b"abcdef")).unwrap());
        let _ = state.take_unsent().unwrap();

        state.on_response(&persisted(4)).unwrap();
        let front = state.peek_first().unwrap();
        assert_eq!(front.write_offset, 4);
        assert_eq!(front.data.as_ref().unwrap().content, Bytes::from_static(b"ef"));
        assert_eq!(
            front.data.as_ref().unwrap().crc32c,
            Some(crc32c::crc32c(b"ef"))
        );
    }

    #[test]
    fn resource_closes_session() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);
        assert!(state.offer(plain(0, b"abc")).unwrap());
        assert!(state.offer(finish(3)).unwrap());
        let _ = state.take_unsent().unwrap();

        let object = Object::new().set_name("o").set_size(3_i64);
        let got = state
            .on_response(&WriteResponse {
                status: Some(WriteStatus::Resource(object.clone())),
                ..WriteResponse::default()
            })
            .unwrap();
        assert_eq!(got, Some(object));
        assert_eq!(state.state(), SessionState::Closed);
        let err = state.offer(plain(3, b"d")).unwrap_err();
        assert!(matches!(err, WriteError::SessionFinalized), "{err:?}");
    }

    #[test]
    fn takeover_reconciles_before_accepting_data() {
        let spec = AppendSpec {
            bucket: "test-bucket".into(),
            object: "test-object".into(),
            generation: 123,
            ..AppendSpec::default()
        };
        let mut state = UploadState::takeover(spec, MAX_BUFFERED, MAX_MESSAGE);
        assert_eq!(state.state(), SessionState::AwaitingTakeover);

        // Data is not accepted until the server reports its size.
        assert!(!state.offer(plain(0, b"abc")).unwrap());

        let drained = state.take_unsent().unwrap();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].state_lookup, "{drained:?}");
        assert!(
            matches!(drained[0].first_message, Some(FirstMessage::AppendSpec(_))),
            "{drained:?}"
        );

        state.on_response(&persisted(100)).unwrap();
        assert_eq!(state.state(), SessionState::Open);
        assert_eq!(state.begin_offset(), 100);
        assert_eq!(state.next_offer_offset(), 100);

        let err = state.offer(plain(0, b"abc")).unwrap_err();
        assert!(matches!(err, WriteError::NonContiguousOffer { .. }), "{err:?}");
        assert!(state.offer(plain(100, b"abc")).unwrap());
    }

    #[test]
    fn retry_replays_unconfirmed_suffix() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);
        assert!(state.offer(appendable_frame(0, b"aaaa")).unwrap());
        assert!(state.offer(appendable_frame(4, b"bbbb")).unwrap());
        let _ = state.take_unsent().unwrap();
        state.on_response(&persisted(4)).unwrap();

        let opener = WriteRequest {
            first_message: Some(FirstMessage::UploadId("upload-1".into())),
            state_lookup: true,
            ..WriteRequest::default()
        };
        state.mark_retrying(opener).unwrap();
        assert_eq!(state.state(), SessionState::Retrying);
        // No data accepted mid-retry.
        assert!(!state.offer(appendable_frame(8, b"cccc")).unwrap());
        assert_eq!(state.expected_begin_offset(), state.begin_offset());

        let drained = state.take_unsent().unwrap();
        assert_eq!(drained.len(), 2, "{drained:?}");
        assert!(drained[0].first_message.is_some());
        assert_eq!(drained[1].write_offset, 4);

        // The peer reports everything persisted; the session reopens.
        state.on_response(&persisted(8)).unwrap();
        assert_eq!(state.state(), SessionState::Open);
        assert!(state.offer(appendable_frame(8, b"cccc")).unwrap());
    }

    #[test]
    fn expected_begin_offset_without_opener() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);
        assert!(state.offer(appendable_frame(0, b"aaaa")).unwrap());
        let _ = state.take_unsent().unwrap();
        assert!(state.offer(appendable_frame(4, b"bbbb")).unwrap());
        assert_eq!(state.expected_begin_offset(), 4);
        let _ = state.take_unsent().unwrap();
        assert_eq!(state.expected_begin_offset(), 8);
    }

    #[test]
    fn drain_is_idempotent_until_new_offers() {
        let mut state = UploadState::resumable("upload-1", MAX_BUFFERED, MAX_MESSAGE);
        opened(&mut state);
        assert!(state.offer(plain(0, b"abc")).unwrap());
        let first = state.take_unsent().unwrap();
        assert_eq!(first.len(), 1);
        assert!(state.take_unsent().unwrap().is_empty());
    }
}
