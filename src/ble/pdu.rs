// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! HAP-PDU framing for the BLE transport: request assembly across ATT
//! fragments and response fragmentation down to the negotiated MTU.
//!
//! A PDU is `[control, opcode, tid, iid:u16 LE, body_len:u16 LE, body]`
//! for requests and `[control, tid, status, body_len:u16 LE, body]` for
//! responses; continuations carry `[control|0x80, tid, body...]`.

use bytes::{BufMut, BytesMut};

use crate::{Error, Result};

/// Default ATT MTU before an exchange happens.
pub const DEFAULT_MTU: usize = 23;

/// ATT write/notify payloads lose a 3-byte ATT header relative to the
/// MTU.
pub const ATT_HEADER_BYTES: usize = 3;

const CONTROL_RESPONSE: u8 = 1 << 1;
const CONTROL_CONTINUATION: u8 = 1 << 7;
const CONTROL_IID_64: u8 = 1 << 4;
const CONTROL_RESERVED: u8 = 0b0000_1100;

/// HAP opcodes carried in request PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    CharacteristicSignatureRead = 0x01,
    CharacteristicWrite = 0x02,
    CharacteristicRead = 0x03,
    CharacteristicTimedWrite = 0x04,
    CharacteristicExecuteWrite = 0x05,
    ServiceSignatureRead = 0x06,
    CharacteristicConfiguration = 0x07,
    ProtocolConfiguration = 0x08,
    AccessorySignatureRead = 0x09,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(OpCode::CharacteristicSignatureRead),
            0x02 => Ok(OpCode::CharacteristicWrite),
            0x03 => Ok(OpCode::CharacteristicRead),
            0x04 => Ok(OpCode::CharacteristicTimedWrite),
            0x05 => Ok(OpCode::CharacteristicExecuteWrite),
            0x06 => Ok(OpCode::ServiceSignatureRead),
            0x07 => Ok(OpCode::CharacteristicConfiguration),
            0x08 => Ok(OpCode::ProtocolConfiguration),
            0x09 => Ok(OpCode::AccessorySignatureRead),
            _ => Err(Error::InvalidData),
        }
    }
}

/// Status byte of a response PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BleStatus {
    Success = 0x00,
    UnsupportedPdu = 0x01,
    MaxProcedures = 0x02,
    InsufficientAuthorization = 0x03,
    InvalidInstanceId = 0x04,
    InsufficientAuthentication = 0x05,
    InvalidRequest = 0x06,
}

/// TLV types inside HAP-PDU bodies.
pub mod body_types {
    pub const VALUE: u8 = 0x01;
    pub const AUTHORIZATION_DATA: u8 = 0x02;
    pub const ORIGIN: u8 = 0x03;
    pub const CHARACTERISTIC_TYPE: u8 = 0x04;
    pub const CHARACTERISTIC_IID: u8 = 0x05;
    pub const SERVICE_TYPE: u8 = 0x06;
    pub const SERVICE_IID: u8 = 0x07;
    pub const TTL: u8 = 0x08;
    pub const RETURN_RESPONSE: u8 = 0x09;
    pub const PROPERTIES: u8 = 0x0a;
    pub const USER_DESCRIPTION: u8 = 0x0b;
    pub const PRESENTATION_FORMAT: u8 = 0x0c;
    pub const VALID_RANGE: u8 = 0x0d;
    pub const STEP_VALUE: u8 = 0x0e;
    pub const SERVICE_PROPERTIES: u8 = 0x0f;
    pub const LINKED_SERVICES: u8 = 0x10;
    pub const VALID_VALUES: u8 = 0x11;
    pub const VALID_VALUES_RANGE: u8 = 0x12;
}

/// One fully assembled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduRequest {
    pub opcode: OpCode,
    pub tid: u8,
    pub iid: u16,
    pub body: Vec<u8>,
}

struct PartialRequest {
    opcode: OpCode,
    tid: u8,
    iid: u16,
    expected_body_len: usize,
    body: Vec<u8>,
}

/// Reassembles request PDUs from ATT write fragments.
#[derive(Default)]
pub struct RequestAssembler {
    partial: Option<PartialRequest>,
}

impl RequestAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feeds one ATT write payload. Returns the request once the body is
    /// complete.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Option<PduRequest>> {
        if fragment.is_empty() {
            return Err(Error::InvalidData);
        }
        let control = fragment[0];
        if control & CONTROL_CONTINUATION != 0 {
            let partial = self.partial.as_mut().ok_or(Error::InvalidState)?;
            if fragment.len() < 2 || fragment[1] != partial.tid {
                self.partial = None;
                return Err(Error::InvalidData);
            }
            partial.body.extend_from_slice(&fragment[2..]);
            if partial.body.len() > partial.expected_body_len {
                self.partial = None;
                return Err(Error::InvalidData);
            }
            return Ok(self.take_if_complete());
        }

        if control & (CONTROL_RESPONSE | CONTROL_RESERVED) != 0 {
            return Err(Error::InvalidData);
        }
        if control & CONTROL_IID_64 != 0 {
            // 64-bit instance ids are not used by this accessory.
            return Err(Error::InvalidData);
        }
        if fragment.len() < 5 {
            return Err(Error::InvalidData);
        }
        let opcode = OpCode::try_from(fragment[1])?;
        let tid = fragment[2];
        let iid = u16::from_le_bytes([fragment[3], fragment[4]]);

        let (expected_body_len, body) = if fragment.len() >= 7 {
            let len = u16::from_le_bytes([fragment[5], fragment[6]]) as usize;
            let body = fragment[7..].to_vec();
            if body.len() > len {
                return Err(Error::InvalidData);
            }
            (len, body)
        } else if fragment.len() == 5 {
            (0, Vec::new())
        } else {
            return Err(Error::InvalidData);
        };

        self.partial = Some(PartialRequest {
            opcode,
            tid,
            iid,
            expected_body_len,
            body,
        });
        Ok(self.take_if_complete())
    }

    fn take_if_complete(&mut self) -> Option<PduRequest> {
        let complete = self
            .partial
            .as_ref()
            .map(|p| p.body.len() == p.expected_body_len)
            .unwrap_or(false);
        if !complete {
            return None;
        }
        let partial = self.partial.take().unwrap();
        Some(PduRequest {
            opcode: partial.opcode,
            tid: partial.tid,
            iid: partial.iid,
            body: partial.body,
        })
    }
}

/// Builds a response and splits it into ATT-MTU-sized fragments. The
/// first fragment carries the full body length; continuations repeat the
/// TID with the continuation bit set.
pub fn build_response(tid: u8, status: BleStatus, body: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let payload_limit = mtu.saturating_sub(ATT_HEADER_BYTES).max(5);

    let mut first = BytesMut::with_capacity(payload_limit);
    first.put_u8(CONTROL_RESPONSE);
    first.put_u8(tid);
    first.put_u8(status as u8);
    if !body.is_empty() {
        first.put_u16_le(body.len() as u16);
    }

    let mut fragments = Vec::new();
    let first_room = payload_limit - first.len();
    let first_take = body.len().min(first_room);
    first.put_slice(&body[..first_take]);
    fragments.push(first.to_vec());

    let mut offset = first_take;
    while offset < body.len() {
        let room = payload_limit - 2;
        let take = (body.len() - offset).min(room);
        let mut fragment = BytesMut::with_capacity(2 + take);
        fragment.put_u8(CONTROL_RESPONSE | CONTROL_CONTINUATION);
        fragment.put_u8(tid);
        fragment.put_slice(&body[offset..offset + take]);
        fragments.push(fragment.to_vec());
        offset += take;
    }
    fragments
}

/// Splits a request the same way; used by the test controller side.
pub fn build_request(request: &PduRequest, mtu: usize) -> Vec<Vec<u8>> {
    let payload_limit = mtu.saturating_sub(ATT_HEADER_BYTES).max(7);

    let mut first = BytesMut::with_capacity(payload_limit);
    first.put_u8(0);
    first.put_u8(request.opcode as u8);
    first.put_u8(request.tid);
    first.put_u16_le(request.iid);
    if !request.body.is_empty() {
        first.put_u16_le(request.body.len() as u16);
    }

    let mut fragments = Vec::new();
    let first_room = payload_limit - first.len();
    let first_take = request.body.len().min(first_room);
    first.put_slice(&request.body[..first_take]);
    fragments.push(first.to_vec());

    let mut offset = first_take;
    while offset < request.body.len() {
        let room = payload_limit - 2;
        let take = (request.body.len() - offset).min(room);
        let mut fragment = BytesMut::with_capacity(2 + take);
        fragment.put_u8(CONTROL_CONTINUATION);
        fragment.put_u8(request.tid);
        fragment.put_slice(&request.body[offset..offset + take]);
        fragments.push(fragment.to_vec());
        offset += take;
    }
    fragments
}

/// Parses a (possibly fragmented) response; the inverse of
/// [`build_response`], used by tests.
pub fn parse_response(fragments: &[Vec<u8>]) -> Result<(u8, u8, Vec<u8>)> {
    let first = fragments.first().ok_or(Error::InvalidData)?;
    if first.len() < 3 || first[0] & CONTROL_RESPONSE == 0 {
        return Err(Error::InvalidData);
    }
    let tid = first[1];
    let status = first[2];
    let (expected, mut body) = if first.len() >= 5 {
        (
            u16::from_le_bytes([first[3], first[4]]) as usize,
            first[5..].to_vec(),
        )
    } else {
        (0, Vec::new())
    };
    for fragment in &fragments[1..] {
        if fragment.len() < 2
            || fragment[0] & CONTROL_CONTINUATION == 0
            || fragment[1] != tid
        {
            return Err(Error::InvalidData);
        }
        body.extend_from_slice(&fragment[2..]);
    }
    if body.len() != expected {
        return Err(Error::InvalidData);
    }
    Ok((tid, status, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unfragmented_request() {
        let raw = [0x00, 0x06, 0x2a, 0x10, 0x00];
        let mut assembler = RequestAssembler::new();
        let request = assembler.push(&raw).unwrap().unwrap();
        assert_eq!(request.opcode, OpCode::ServiceSignatureRead);
        assert_eq!(request.tid, 0x2a);
        assert_eq!(request.iid, 0x10);
        assert!(request.body.is_empty());
    }

    #[test]
    fn rejects_short_and_reserved_pdus() {
        let mut assembler = RequestAssembler::new();
        assert!(assembler.push(&[0x00; 4]).is_err());
        assert!(assembler.push(&[0x04, 0x03, 0x01, 0x10, 0x00]).is_err());
        assert!(assembler.push(&[0x02, 0x03, 0x01, 0x10, 0x00]).is_err());
        assert!(assembler.push(&[]).is_err());
    }

    #[test]
    fn continuation_without_start_is_invalid_state() {
        let mut assembler = RequestAssembler::new();
        assert_eq!(
            assembler.push(&[0x80, 0x01, 0xaa]).unwrap_err(),
            Error::InvalidState
        );
    }

    #[test]
    fn request_round_trip_across_fragments() {
        let body: Vec<u8> = (0..140u32).map(|i| i as u8).collect();
        let request = PduRequest {
            opcode: OpCode::CharacteristicWrite,
            tid: 0x77,
            iid: 0x33,
            body,
        };
        let mtu = 23;
        let fragments = build_request(&request, mtu);
        // First fragment carries 20 - 7 = 13 body bytes, continuations
        // 18 each: 1 + ceil((140 - 13) / 18) = 9 fragments.
        assert_eq!(fragments.len(), 9);
        for fragment in &fragments {
            assert!(fragment.len() <= mtu - ATT_HEADER_BYTES);
        }

        let mut assembler = RequestAssembler::new();
        let mut result = None;
        for fragment in &fragments {
            result = assembler.push(fragment).unwrap();
        }
        assert_eq!(result.unwrap(), request);
    }

    #[test]
    fn response_round_trip_preserves_tid() {
        let body = vec![0x5a; 140];
        let mtu = 23;
        let fragments = build_response(0x42, BleStatus::Success, &body, mtu);
        // 20-byte payloads: 5-byte header + 15 body, then 18 per
        // continuation: 1 + ceil((140 - 15) / 18) = 8 fragments.
        assert_eq!(fragments.len(), 8);
        for fragment in &fragments[1..] {
            assert_eq!(fragment[1], 0x42);
        }
        let (tid, status, parsed) = parse_response(&fragments).unwrap();
        assert_eq!(tid, 0x42);
        assert_eq!(status, BleStatus::Success as u8);
        assert_eq!(parsed, body);
    }

    #[test]
    fn interrupted_fragment_run_is_rejected() {
        let request = PduRequest {
            opcode: OpCode::CharacteristicWrite,
            tid: 0x01,
            iid: 0x33,
            body: vec![0; 100],
        };
        let fragments = build_request(&request, 23);
        let mut assembler = RequestAssembler::new();
        assembler.push(&fragments[0]).unwrap();
        // A continuation with the wrong TID aborts the assembly.
        let mut bad = fragments[1].clone();
        bad[1] ^= 0xff;
        assert!(assembler.push(&bad).is_err());
        assert!(matches!(
            assembler.push(&fragments[2]),
            Err(Error::InvalidState)
        ));
    }

    #[test]
    fn status_free_response_has_no_length() {
        let fragments = build_response(0x09, BleStatus::InvalidInstanceId, &[], 23);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0], vec![0x02, 0x09, 0x04]);
    }
}
