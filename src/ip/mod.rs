// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The IP transport: HTTP-like framing, the pairing and attribute
//! endpoints, session-encrypted streams, long-polled event delivery, and
//! the streaming JSON serializer behind `GET /accessories`.

pub mod http;
pub mod json;
pub mod serializer;
pub mod server;

pub use serializer::AccessorySerializer;
pub use server::IpTransport;
