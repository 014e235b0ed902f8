// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The cache's consumer contract for synchronous HTTP fetches. The
//! transport (TLS, sockets, redirects) is supplied by the host; the cache
//! only sees header lines, body chunks and one completion call.

use adk_alloc::SharedHeap;

/// Terminal transport outcome, separate from the HTTP status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportResult {
    Ok,
    TimedOut,
    Error,
}

/// Callbacks driven by [FetchTransport::fetch].
///
/// `on_header` is invoked once per response header line (status line
/// first); `on_body` zero or more times with body chunks; `on_complete`
/// exactly once after everything else. Returning `false` from the header
/// or body callback cancels the remaining callbacks except completion.
pub trait FetchHandler {
    fn on_header(&mut self, line: &[u8]) -> bool;
    fn on_body(&mut self, chunk: &[u8]) -> bool;
    fn on_complete(&mut self, result: TransportResult, http_status: u16);
}

/// Synchronous fetch collaborator. `heap` is the calling cache's scratch
/// heap; implementations allocate their transfer buffers from it so cache
/// memory stays within the cache's region budget.
pub trait FetchTransport {
    fn fetch(
        &self,
        heap: &SharedHeap,
        url: &str,
        request_headers: &[String],
        handler: &mut dyn FetchHandler,
    );
}
