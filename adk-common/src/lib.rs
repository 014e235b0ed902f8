// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared leaf utilities for the ADK core: checksums, crypto helpers, URL
//! decomposition, HTTP header-line parsing and host system metrics. This
//! crate sits at the bottom of the workspace and depends on no other
//! member.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod crc;
pub mod crypto;
pub mod http;
pub mod metrics;
pub mod url;
