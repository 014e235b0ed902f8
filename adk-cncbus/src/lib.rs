// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The command-and-control bus (cncbus): an address-routed, subnet-masked,
//! asynchronous in-process message passing system.
//!
//! Receivers own a 32-bit address written as four octets. A message
//! carries a destination address and a subnet mask; it is delivered to
//! every connected receiver whose address matches under
//! `(receiver & mask) == (destination & mask)`.
//!
//! Any number of producer threads build and send messages; any number of
//! dispatcher threads pump [Bus::dispatch]. A dispatcher pulls one queued
//! message and invokes each matching receiver in turn; dispatch into one
//! receiver is serialized, so no receiver ever observes two concurrent
//! deliveries. Message bodies live in a bus-private heap, and producers
//! under memory pressure use the `try_` builders, which fail instead of
//! blocking.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod bus;

pub use bus::{Bus, BusError, DispatchMode, DispatchResult, MsgBuilder, Signal, MAX_RECEIVERS};

use core::fmt;

/// A 32-bit bus address, written as four octets like an IPv4 address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(u32);

impl Address {
    /// `0.0.0.0`, never owned by a receiver.
    pub const INVALID: Address = Address(0);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Address(((a as u32) << 24) | ((b as u32) << 16) | ((c as u32) << 8) | (d as u32))
    }

    pub const fn from_bits(bits: u32) -> Self {
        Address(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether a message addressed to `dest` under `mask` reaches this
    /// address.
    pub const fn matches(self, dest: Address, mask: SubnetMask) -> bool {
        (self.0 & mask.0) == (dest.0 & mask.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0.to_be_bytes();
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A 32-bit subnet mask applied to both the receiver address and the
/// message destination before comparison.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubnetMask(u32);

impl SubnetMask {
    /// Every bit significant: exact-address delivery.
    pub const EXACT: SubnetMask = SubnetMask(u32::MAX);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        SubnetMask(Address::new(a, b, c, d).bits())
    }

    pub const fn from_bits(bits: u32) -> Self {
        SubnetMask(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SubnetMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0.to_be_bytes();
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl fmt::Debug for SubnetMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Routing metadata delivered alongside every message body.
#[derive(Clone, Copy, Debug)]
pub struct MsgHeader {
    pub source: Address,
    pub dest: Address,
    pub mask: SubnetMask,
    pub reply_address: Address,
    /// Milliseconds since the epoch at send time.
    pub time: u64,
    pub size: u32,
}

/// A bus endpoint. Implementations must tolerate delivery from any
/// dispatcher thread; the bus guarantees deliveries to one receiver never
/// overlap.
pub trait Receiver: Send + Sync {
    fn on_msg_recv(&self, header: &MsgHeader, body: &[u8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_octet_round_trip() {
        let addr = Address::new(10, 10, 1, 7);
        assert_eq!(addr.bits(), 0x0A0A_0107);
        assert_eq!(addr.to_string(), "10.10.1.7");
        assert_eq!(Address::INVALID.to_string(), "0.0.0.0");
    }

    #[test]
    fn subnet_matching() {
        let receiver = Address::new(10, 10, 1, 42);
        let mask = SubnetMask::new(255, 255, 255, 0);

        assert!(receiver.matches(Address::new(10, 10, 1, 1), mask));
        assert!(!receiver.matches(Address::new(10, 10, 2, 1), mask));
        assert!(receiver.matches(receiver, SubnetMask::EXACT));
        assert!(!receiver.matches(Address::new(10, 10, 1, 41), SubnetMask::EXACT));

        // A zero mask matches everything.
        let any = SubnetMask::from_bits(0);
        assert!(receiver.matches(Address::INVALID, any));
    }
}
