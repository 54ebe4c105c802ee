// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The BLE transport: HAP-PDU framing over GATT, the procedure engine,
//! and the advertising controller.

pub mod adv;
pub mod pdu;
pub mod procedure;

pub use pdu::{BleStatus, OpCode, PduRequest, RequestAssembler};
pub use procedure::BleTransport;
