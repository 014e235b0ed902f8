// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime services that sit on top of the substrate crates: the main
//! loop watchdog and persona-file resolution for hosts that run several
//! applications on one core.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod persona;
pub mod watchdog;

pub use persona::{lookup_persona, PersonaError, PersonaMapping};
pub use watchdog::{Watchdog, WatchdogConfig};
