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

//! Error types for the transfer engine.
//!
//! The engine reports errors from multiple sources: the service may reject a
//! request, the transport may fail mid-stream, a checksum may not match, or
//! the application may misuse a channel. Most applications just return or log
//! the error. Applications that need to interrogate the failure can use the
//! predicates on [Error], or downcast [source][std::error::Error::source] to
//! one of the domain error types ([ReadError], [WriteError]) defined here.

use crate::model::ObjectChecksums;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The core error type returned by the transfer engine.
///
/// # Example
/// ```
/// use objectstream::error::Error;
/// fn classify(e: &Error) {
///     if e.is_timeout() {
///         println!("not enough time: {e}");
///     } else if let Some(status) = e.status() {
///         println!("service error: {status:?}");
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<BoxError>,
}

#[derive(Debug)]
enum ErrorKind {
    Io,
    Timeout,
    Exhausted,
    Serialization,
    Deserialization,
    InvalidArgument,
    Service(rpc::Status),
}

impl Error {
    /// Creates an error representing an I/O problem in the transport.
    pub fn io<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Io,
            source: Some(source.into()),
        }
    }

    /// The request (or stream) failed with an I/O problem.
    ///
    /// These errors are typically transient: the connection was reset, the
    /// stream was interrupted, or a local file could not be read.
    pub fn is_io(&self) -> bool {
        matches!(self.kind, ErrorKind::Io)
    }

    /// Creates an error representing a timeout.
    pub fn timeout<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            source: Some(source.into()),
        }
    }

    /// The operation could not complete before its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Creates an error representing an exhausted retry or resume policy.
    pub fn exhausted<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Exhausted,
            source: Some(source.into()),
        }
    }

    /// The operation could not complete before the retry policy expired.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.kind, ErrorKind::Exhausted)
    }

    /// Creates an error representing a problem preparing data to send.
    pub fn ser<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Serialization,
            source: Some(source.into()),
        }
    }

    /// The payload could not be prepared for sending.
    ///
    /// This includes failures in the upload data source and protocol faults
    /// detected on the send path, such as a persisted-size mismatch. These
    /// errors are never transient: retrying with the same input fails again.
    pub fn is_serialization(&self) -> bool {
        matches!(self.kind, ErrorKind::Serialization)
    }

    /// Creates an error representing a malformed or unexpected response.
    pub fn deser<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Deserialization,
            source: Some(source.into()),
        }
    }

    /// The response could not be interpreted.
    ///
    /// Note that a failure to observe success is not a failure of the
    /// underlying operation: callers may treat these as retryable by default,
    /// with this error attached as the cause for diagnostics.
    pub fn is_deserialization(&self) -> bool {
        matches!(self.kind, ErrorKind::Deserialization)
    }

    /// Creates an error representing invalid usage of the engine.
    pub fn invalid<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            source: Some(source.into()),
        }
    }

    /// The application misused the engine.
    ///
    /// For example, rewinding content outside its valid byte range, or
    /// writing to a finalized channel. Never retryable.
    pub fn is_invalid(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidArgument)
    }

    /// Creates an error with the status reported by the service.
    pub fn service(status: rpc::Status) -> Self {
        Self {
            kind: ErrorKind::Service(status),
            source: None,
        }
    }

    /// Returns the status for errors reported by the service.
    pub fn status(&self) -> Option<&rpc::Status> {
        match &self.kind {
            ErrorKind::Service(status) => Some(status),
            _ => None,
        }
    }

    /// Returns the redirect details, if this error is a stream redirect.
    pub fn redirect(&self) -> Option<&rpc::Redirect> {
        self.status().and_then(rpc::Status::redirect)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ErrorKind::Io => write!(f, "i/o error in the transfer"),
            ErrorKind::Timeout => write!(f, "the operation exceeded its deadline"),
            ErrorKind::Exhausted => write!(f, "the retry policy was exhausted"),
            ErrorKind::Serialization => write!(f, "cannot prepare the data to send"),
            ErrorKind::Deserialization => write!(f, "cannot interpret the response"),
            ErrorKind::InvalidArgument => write!(f, "invalid use of the transfer engine"),
            ErrorKind::Service(status) => {
                write!(f, "the service reported an error: {status:?}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// A small model of RPC status codes and details.
///
/// The engine does not define the transport, but it must understand the
/// status codes the transport reports, and the redirect detail the service
/// attaches to some of them.
pub mod rpc {
    /// Canonical status codes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Code {
        Cancelled,
        InvalidArgument,
        DeadlineExceeded,
        NotFound,
        PermissionDenied,
        ResourceExhausted,
        FailedPrecondition,
        Aborted,
        Internal,
        Unavailable,
        DataLoss,
    }

    /// The status reported by the service on a failed request or stream.
    #[derive(Clone, Debug, PartialEq)]
    pub struct Status {
        pub code: Code,
        pub message: String,
        pub details: Vec<StatusDetails>,
    }

    impl Status {
        pub fn new<M: Into<String>>(code: Code, message: M) -> Self {
            Self {
                code,
                message: message.into(),
                details: Vec::new(),
            }
        }

        pub fn with_redirect(mut self, redirect: Redirect) -> Self {
            self.details.push(StatusDetails::Redirected(redirect));
            self
        }

        /// Returns the redirect detail, if any.
        pub fn redirect(&self) -> Option<&Redirect> {
            self.details.iter().find_map(|d| match d {
                StatusDetails::Redirected(r) => Some(r),
            })
        }
    }

    /// Typed details attached to a [Status].
    #[derive(Clone, Debug, PartialEq)]
    pub enum StatusDetails {
        Redirected(Redirect),
    }

    /// A server-issued stream redirect.
    ///
    /// The service interrupts a stream with this detail to move the session
    /// to a different backend. The client reopens the stream carrying the
    /// routing token and the opaque resumption handle.
    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct Redirect {
        pub routing_token: Option<String>,
        pub handle: Option<bytes::Bytes>,
    }
}

/// Indicates that a checksum mismatch was detected while reading or writing
/// object data.
///
/// The engine computes the CRC32C checksum of the data as it moves, and
/// compares it against the values reported by the service. If the values do
/// not match, the operation completes with an error that includes this type.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ChecksumMismatch {
    /// The CRC32C checksum does not match the computed (or expected) value.
    Crc32c { got: u32, want: u32 },
}

impl std::fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crc32c { got, want } => write!(
                f,
                "the CRC32C checksums do not match: got=0x{got:08x}, want=0x{want:08x}"
            ),
        }
    }
}

/// Represents an error that can occur while consuming a read stream.
#[derive(thiserror::Error, Clone, Debug)]
#[non_exhaustive]
pub enum ReadError {
    /// The calculated crc32c did not match the value carried by the frame.
    #[error("checksum mismatch {0}")]
    ChecksumMismatch(ChecksumMismatch),

    /// The read was interrupted before all the expected bytes arrived.
    #[error("missing {0} bytes at the end of the stream")]
    ShortRead(u64),

    /// The read received more bytes than expected.
    #[error("too many bytes received: expected {expected}, stopped read at {got}")]
    LongRead { got: u64, expected: u64 },

    /// A read was interrupted with an unrecoverable error.
    #[error("cannot recover from an underlying read error: {0}")]
    UnrecoverableInterrupt(#[source] std::sync::Arc<Error>),

    /// A frame carried an invalid offset.
    ///
    /// # Troubleshooting
    ///
    /// This indicates a bug in the service or a corrupted message in
    /// transit.
    #[error("invalid offset in read frame: {0}")]
    BadOffset(i64),

    /// A frame carried an invalid length.
    #[error("invalid length in read frame: {0}")]
    BadLength(i64),

    /// A frame arrived without a range descriptor.
    #[error("missing range in read frame")]
    MissingRange,

    /// An out-of-order frame.
    ///
    /// # Troubleshooting
    ///
    /// The engine received an out-of-sequence range of data for a single
    /// read-id. Fragments for one read-id must arrive in stream order; this
    /// indicates a bug in the service or the engine.
    #[error("out of order read frame, expected offset={expected}, got={got}")]
    OutOfOrder { got: i64, expected: i64 },

    /// The service used a read-id the engine never issued.
    ///
    /// # Troubleshooting
    ///
    /// Several logical reads are multiplexed over one stream, each tagged
    /// with an id assigned by the engine. A frame for an id that was never
    /// assigned indicates a bug in the service or the engine.
    #[error("unknown read-id in frame: {0}")]
    UnknownReadId(i64),

    /// A frame was delivered for a read that is already closed or failed.
    ///
    /// Frames are never silently dropped: delivery to a terminal read is a
    /// definite error so that byte-accounting bugs surface immediately.
    #[error("frame delivered to closed read-id: {0}")]
    ReadClosed(i64),
}

/// An unrecoverable problem in the upload protocol.
///
/// # Example
/// ```no_run
/// # use objectstream::error::{Error, WriteError};
/// use std::error::Error as _;
/// fn inspect(error: &Error) {
///     if let Some(m) = error.source().and_then(|e| e.downcast_ref::<WriteError>()) {
///         println!("upload protocol fault: {m}");
///     }
/// }
/// ```
#[derive(thiserror::Error, Clone, Debug)]
#[non_exhaustive]
pub enum WriteError {
    /// The service has "uncommitted" previously persisted bytes.
    ///
    /// # Troubleshooting
    ///
    /// The service reports how many bytes are persisted as the upload makes
    /// progress. This error indicates that the latest report covers fewer
    /// bytes than an earlier one, i.e. the service forgot data the client
    /// believes is durable. This is a data-loss condition; it is never
    /// retried at the same offset.
    #[error(
        "the service previously persisted {offset} bytes, but now reports only {persisted} as persisted"
    )]
    UnexpectedRewind { offset: u64, persisted: u64 },

    /// The service reports more bytes persisted than sent.
    ///
    /// # Troubleshooting
    ///
    /// Most likely this indicates that two concurrent uploads are using the
    /// same session, or that the offset accounting is corrupted. Equally a
    /// data-loss condition; never retried at the same offset.
    #[error("the service reports {persisted} bytes as persisted, but we only sent {sent} bytes")]
    TooMuchProgress { sent: u64, persisted: u64 },

    /// The checksum reported by the service on finalize does not match the
    /// checksum of the data sent.
    #[error("checksum mismatch {mismatch} finalizing the upload")]
    ChecksumMismatch { mismatch: ChecksumMismatch },

    /// A message was offered whose offset is not contiguous with the
    /// buffered sequence.
    ///
    /// This is a programmer error in the layer driving the session, not a
    /// service problem. Fail fast, never retry.
    #[error("non-contiguous offer, expected offset={expected}, got={got}")]
    NonContiguousOffer { expected: u64, got: u64 },

    /// Data was offered after the session was finalized.
    #[error("the session is finalized and accepts no more data")]
    SessionFinalized,

    /// The buffered message sequence violated an internal invariant.
    ///
    /// For example a finish marker on a non-final message. Fail fast, never
    /// retry.
    #[error("internal invariant violation: {0}")]
    InvariantViolation(String),
}

/// Validate received checksums against the expected value.
///
/// A `None` on either side does not participate in the comparison; this
/// accounts for disabled checksums in the client and for responses that omit
/// them.
pub(crate) fn validate_checksums(
    expected: &ObjectChecksums,
    received: &Option<ObjectChecksums>,
) -> std::result::Result<(), ChecksumMismatch> {
    let Some(recv) = received else {
        return Ok(());
    };
    match (expected.crc32c, recv.crc32c) {
        (Some(want), Some(got)) if want != got => Err(ChecksumMismatch::Crc32c { got, want }),
        _ => Ok(()),
    }
}
