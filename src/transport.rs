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

//! The abstract transport consumed by the transfer engine.
//!
//! The engine never talks to the network directly. It consumes three
//! capabilities from a transport collaborator: send a message on a stream,
//! receive the next message from a stream, and open a new stream. The traits
//! here are the dependency-injection seam for those capabilities; tests
//! implement them with in-memory channels.

use crate::Result;
use crate::error::rpc::Status;
use crate::wire::{ReadRequest, ReadResponse, WriteRequest, WriteResponse, WriteSpec};
use tokio::sync::mpsc::{Receiver, Sender};

/// The outcome of opening a stream: established, or rejected with a status
/// that may carry redirect details.
pub type StartResult<S> = std::result::Result<S, Status>;

/// An established bidi stream: a sender for requests and the response side.
#[derive(Debug)]
pub struct Connection<Req, S> {
    pub tx: Sender<Req>,
    pub rx: S,
}

impl<Req, S> Connection<Req, S> {
    pub fn new(tx: Sender<Req>, rx: S) -> Self {
        Self { tx, rx }
    }
}

/// The receive half of a bidi stream.
///
/// `Ok(None)` is a successful end of stream. An `Err` status ends the stream
/// and may carry a [Redirect][crate::error::rpc::Redirect] detail.
pub trait ResponseStream<T>: std::fmt::Debug + Send + 'static {
    fn next_message(
        &mut self,
    ) -> impl Future<Output = std::result::Result<Option<T>, Status>> + Send;
}

/// Opens write streams and starts resumable sessions.
pub trait WriteTransport: std::fmt::Debug + Send + Sync + 'static {
    type Stream: ResponseStream<WriteResponse>;

    /// Starts a resumable session, returning its opaque upload id.
    fn start_session(&self, spec: &WriteSpec) -> impl Future<Output = Result<String>> + Send;

    /// Opens a bidi write stream. The transport drains `rx` to the wire.
    fn open(
        &self,
        rx: Receiver<WriteRequest>,
    ) -> impl Future<Output = Result<StartResult<Self::Stream>>> + Send;
}

/// Opens read streams.
pub trait ReadTransport: std::fmt::Debug + Send + Sync + 'static {
    type Stream: ResponseStream<ReadResponse>;

    /// Opens a bidi read stream. The transport drains `rx` to the wire.
    fn open(
        &self,
        rx: Receiver<ReadRequest>,
    ) -> impl Future<Output = Result<StartResult<Self::Stream>>> + Send;
}

/// A [ResponseStream] backed by an in-memory channel.
///
/// Concrete transports with channel-shaped receive sides can use this
/// directly; it is also the stream type used by the engine's tests.
#[derive(Debug)]
pub struct ChannelStream<T> {
    rx: Receiver<std::result::Result<T, Status>>,
}

impl<T> ChannelStream<T> {
    pub fn new(rx: Receiver<std::result::Result<T, Status>>) -> Self {
        Self { rx }
    }
}

impl<T> ResponseStream<T> for ChannelStream<T>
where
    T: std::fmt::Debug + Send + 'static,
{
    async fn next_message(&mut self) -> std::result::Result<Option<T>, Status> {
        self.rx.recv().await.transpose()
    }
}
