// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash/error reporting pipeline. Events are built as JSON trees, held
//! in a bounded send queue, and shipped on [Reporter::tick] as one HTTP
//! POST per event to a DSN-derived endpoint. Rate limiting (HTTP 429 with
//! `Retry-After`) re-queues the event and pauses the queue; other
//! failures drop the event with a log line.
//!
//! The HTTP client itself is a host collaborator behind
//! [client::HttpClient]; tests and embedders can also intercept fully
//! built requests through the reporter's override-send hook.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod event;
pub mod reporter;
pub mod send_queue;

pub use client::{HttpClient, Response};
pub use event::EventLevel;
pub use reporter::{EventOrigin, Reporter, ReporterError, ReporterOptions};
pub use send_queue::{FlushMode, SendQueue};

/// Captures the call site for an event's `transaction` field.
#[macro_export]
macro_rules! origin {
    () => {
        $crate::EventOrigin {
            file: file!(),
            function: module_path!(),
            line: line!(),
        }
    };
}
