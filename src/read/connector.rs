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

//! Establishes and re-establishes read streams.

use super::redirect::{RetryRedirect, handle_redirect};
use crate::options::TransferOptions;
use crate::resume_policy::{ResumePolicy, ResumeQuery, ResumeRedirect, ResumeResult};
use crate::retry_policy::RetryPolicy;
use crate::transport::{Connection, ReadTransport, ResponseStream};
use crate::wire::{ReadRange, ReadRequest, ReadResponse, ReadSpec};
use crate::{Error, Result};
use std::sync::{Arc, Mutex};

/// Opens read streams, carrying the redirect state across attempts.
#[derive(Debug)]
pub(crate) struct Connector<T> {
    spec: Arc<Mutex<ReadSpec>>,
    options: TransferOptions,
    transport: Arc<T>,
    reconnect_attempts: u32,
}

impl<T> Connector<T>
where
    T: ReadTransport,
{
    pub fn new(spec: ReadSpec, options: TransferOptions, transport: Arc<T>) -> Self {
        Self {
            spec: Arc::new(Mutex::new(spec)),
            options,
            transport,
            reconnect_attempts: 0,
        }
    }

    /// Opens a stream serving `ranges`, retrying per the configured
    /// policies. The first response (carrying object metadata) is returned
    /// with the connection.
    pub async fn connect(
        &mut self,
        ranges: Vec<ReadRange>,
    ) -> Result<(ReadResponse, Connection<ReadRequest, T::Stream>)> {
        let retry: Arc<dyn RetryPolicy> =
            Arc::new(RetryRedirect::new(self.options.retry_policy.clone()));
        let backoff = self.options.backoff_policy.clone();
        let transport = self.transport.clone();
        let spec = self.spec.clone();
        // Move owned clones into each attempt's future so it borrows nothing
        // from the closure environment. A future that borrows the closure
        // captures is only `Send` for the specific call lifetime, which makes
        // the spawned worker task fail the `Send` check ("not general
        // enough"); a self-contained `'static` future is unconditionally
        // `Send` (rust-lang/rust#110338).
        crate::retry_policy::retry_loop(
            async move |_| {
                let transport = transport.clone();
                let spec = spec.clone();
                let ranges = ranges.clone();
                Self::connect_attempt(transport.as_ref(), &spec, &ranges).await
            },
            retry,
            backoff,
        )
        .await
    }

    /// Handles a stream interruption: captures any redirect details, asks
    /// the resume policy, and reopens the stream with the pending ranges.
    pub async fn reconnect(
        &mut self,
        status: crate::error::rpc::Status,
        ranges: Vec<ReadRange>,
    ) -> Result<(ReadResponse, Connection<ReadRequest, T::Stream>)> {
        let error = handle_redirect(&self.spec, status);
        self.reconnect_attempts += 1;
        let policy = ResumeRedirect::new(
            self.options.resume_policy.clone(),
            self.options.redirect_attempt_limit,
        );
        match policy.on_error(&ResumeQuery::new(self.reconnect_attempts), error) {
            ResumeResult::Continue(e) => {
                tracing::debug!("resuming read stream after: {e}");
                self.connect(ranges).await
            }
            ResumeResult::Exhausted(e) => Err(Error::exhausted(e)),
            ResumeResult::Permanent(e) => Err(e),
        }
    }

    async fn connect_attempt(
        transport: &T,
        spec: &Arc<Mutex<ReadSpec>>,
        ranges: &[ReadRange],
    ) -> Result<(ReadResponse, Connection<ReadRequest, T::Stream>)> {
        let request = ReadRequest {
            spec: Some(spec.lock().expect("never poisoned").clone()),
            ranges: ranges.to_vec(),
        };
        let (tx, rx) = tokio::sync::mpsc::channel(100);
        tx.send(request)
            .await
            .map_err(|_| Error::io("read stream closed before start"))?;
        let mut stream = match transport.open(rx).await? {
            Ok(stream) => stream,
            Err(status) => return Err(handle_redirect(spec, status)),
        };
        match stream.next_message().await {
            Ok(Some(first)) => {
                {
                    let mut guard = spec.lock().expect("never poisoned");
                    if let Some(metadata) = &first.metadata {
                        guard.generation = metadata.generation;
                    }
                    if first.read_handle.is_some() {
                        guard.read_handle = first.read_handle.clone();
                    }
                }
                Ok((first, Connection::new(tx, stream)))
            }
            Ok(None) => Err(Error::io("read stream closed before start")),
            Err(status) => Err(handle_redirect(spec, status)),
        }
    }
}
