// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Content cache keyed by opaque identifiers, backed by a header-prefixed
//! on-disk format and refreshed over HTTP with ETag conditional requests.
//!
//! Storage is root-contained: every path is validated against a
//! [fs::DirectoryRoot] base, and keys live under a per-cache
//! subdirectory with `p/` holding in-flight writes and `f/` holding
//! finalized files. The HTTP transport itself is a host collaborator
//! behind [transport::FetchTransport].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod cache;
pub mod fs;
pub mod transport;

pub use cache::{Cache, CacheContent, FetchError, FetchOutcome, GetError, UpdateMode};
pub use fs::{DirectoryRoot, Filesystem, FsError};
pub use transport::{FetchHandler, FetchTransport, TransportResult};
