// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The reporter's consumer contract for HTTP uploads. The transport is a
//! host collaborator; the reporter only needs "POST these headers and
//! this body, give me the status and response headers back".

use http::HeaderMap;

/// Terminal state of one upload.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
}

/// Synchronous POST collaborator. Implementations map their own failure
/// modes (connect, TLS, timeout) into the error; HTTP-level failures are
/// a [Response] with the status code set.
pub trait HttpClient: Send + Sync {
    fn post(&self, url: &str, headers: &HeaderMap, body: &[u8]) -> anyhow::Result<Response>;
}
