// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! An accessory-side implementation of the HomeKit Accessory Protocol (HAP).
//!
//! The crate provides the protocol core of a HAP accessory: the attribute
//! database (accessories, services, characteristics), the Pair-Setup and
//! Pair-Verify state machines, per-session transport encryption, the TLV8
//! wire codec, the IP attribute endpoints with their streaming JSON
//! serializer, the BLE GATT procedure engine, and event notification
//! delivery for both transports.
//!
//! Everything that touches the outside world — sockets, the GATT
//! peripheral, mDNS, persistent storage, clocks, and randomness — enters
//! through the capability traits in [`platform`]. The core itself is
//! single-threaded and callback-driven: it never blocks and never spawns.
//! An external run loop feeds it stream events, GATT upcalls, and timer
//! ticks.

use thiserror::Error;

pub mod access;
pub mod accessory;
pub mod ble;
pub mod characteristic;
pub mod crypto;
pub mod event;
pub mod hapuuid;
pub mod ip;
pub mod pairing;
pub mod platform;
pub mod server;
pub mod session;
pub mod tlv8;

pub use accessory::{Accessory, Service};
pub use characteristic::{Characteristic, Format, HapValue};
pub use server::{AccessoryServer, ServerState};

/// The errors that may be raised by the protocol core.
///
/// The set is deliberately small: transports map each kind onto their own
/// status representation (HTTP status plus JSON code on IP, a single status
/// byte on BLE), and platform failures are normalized into it at the
/// boundary.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Non-recoverable internal or platform failure. The caller typically
    /// tears down the session in progress.
    #[error("Unknown error")]
    Unknown,
    /// The operation is not legal in the current state machine position.
    #[error("Invalid state")]
    InvalidState,
    /// Received bytes do not parse or violate framing rules.
    #[error("Invalid data")]
    InvalidData,
    /// A sizing budget is exhausted (buffer, session slot, pairing slot).
    #[error("Out of resources")]
    OutOfResources,
    /// A policy gate rejected the request.
    #[error("Not authorized")]
    NotAuthorized,
    /// Transient failure; the controller should retry.
    #[error("Busy")]
    Busy,
}

pub type Result<T> = std::result::Result<T, Error>;
