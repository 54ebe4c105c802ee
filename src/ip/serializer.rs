// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The resumable JSON serializer for `GET /accessories`. The whole
//! attribute graph is emitted into caller-provided buffers across any
//! number of calls; concatenating the chunks is byte-identical to a
//! one-shot serialization.
//!
//! State is the `(accessory, service, characteristic, linked)` index
//! tuple, a position label, and a cursor into the currently staged token,
//! so a call can stop in the middle of any token and resume exactly
//! there.

use base64::Engine;

use crate::access::{self, ReadKind};
use crate::accessory::{Accessory, Database, Service};
use crate::characteristic::{Characteristic, Constraints, Format, HapValue, Properties, Unit};
use crate::hapuuid::HapUuid;
use crate::ip::json;
use crate::session::{Session, TransportType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Begin,
    AccessoryBegin,
    ServiceBegin,
    LinkedId,
    CharacteristicsBegin,
    CharacteristicBegin,
    CharacteristicValue,
    CharacteristicPerms,
    CharacteristicEv,
    CharacteristicMeta,
    CharacteristicEnd,
    ServiceEnd,
    AccessoryEnd,
    End,
    Done,
}

/// Streams the accessories array as JSON, resuming across calls.
pub struct AccessorySerializer {
    position: Position,
    accessory_index: usize,
    service_index: usize,
    characteristic_index: usize,
    linked_index: usize,
    pending: Vec<u8>,
    cursor: usize,
}

impl Default for AccessorySerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessorySerializer {
    pub fn new() -> Self {
        AccessorySerializer {
            position: Position::Begin,
            accessory_index: 0,
            service_index: 0,
            characteristic_index: 0,
            linked_index: 0,
            pending: Vec::new(),
            cursor: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.position == Position::Done && self.cursor == self.pending.len()
    }

    /// Fills `out` with the next chunk, returning the number of bytes
    /// written. The chunk is maximal: a short write only happens on the
    /// final call.
    pub fn write_chunk(&mut self, db: Database<'_>, session: &Session, out: &mut [u8]) -> usize {
        let mut written = 0;
        loop {
            if self.cursor < self.pending.len() {
                let n = (self.pending.len() - self.cursor).min(out.len() - written);
                out[written..written + n]
                    .copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
                self.cursor += n;
                written += n;
                if written == out.len() {
                    return written;
                }
            }
            if self.position == Position::Done {
                return written;
            }
            self.pending.clear();
            self.cursor = 0;
            self.stage_next(db, session);
        }
    }

    /// Convenience one-shot serialization, used by `/accessories` when the
    /// response fits and by tests as the chunked-output reference.
    pub fn serialize_all(db: Database<'_>, session: &Session) -> Vec<u8> {
        let mut serializer = AccessorySerializer::new();
        let mut out = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = serializer.write_chunk(db, session, &mut chunk);
            out.extend_from_slice(&chunk[..n]);
            if serializer.is_complete() {
                return out;
            }
        }
    }

    fn accessory<'a>(&self, db: Database<'a>) -> &'a Accessory {
        &db.accessories[self.accessory_index]
    }

    fn service<'a>(&self, db: Database<'a>) -> &'a Service {
        &self.accessory(db).services[self.service_index]
    }

    fn characteristic<'a>(&self, db: Database<'a>) -> &'a Characteristic {
        &self.service(db).characteristics[self.characteristic_index]
    }

    fn next_supported_service(&self, db: Database<'_>, from: usize) -> Option<usize> {
        self.accessory(db)
            .services
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, s)| s.supported_on(TransportType::Ip))
            .map(|(i, _)| i)
    }

    fn next_supported_characteristic(&self, db: Database<'_>, from: usize) -> Option<usize> {
        self.service(db)
            .characteristics
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, c)| c.char_type != crate::characteristic::types::SERVICE_SIGNATURE)
            .map(|(i, _)| i)
    }

    /// Stages the token at the current position and advances it.
    fn stage_next(&mut self, db: Database<'_>, session: &Session) {
        match self.position {
            Position::Begin => {
                self.pending.extend_from_slice(b"{\"accessories\":[");
                self.accessory_index = 0;
                self.position = if db.accessories.is_empty() {
                    Position::End
                } else {
                    Position::AccessoryBegin
                };
            }
            Position::AccessoryBegin => {
                let accessory = self.accessory(db);
                self.pending.extend_from_slice(b"{\"aid\":");
                self.pending
                    .extend_from_slice(accessory.aid.to_string().as_bytes());
                self.pending.extend_from_slice(b",\"services\":[");
                match self.next_supported_service(db, 0) {
                    Some(index) => {
                        self.service_index = index;
                        self.position = Position::ServiceBegin;
                    }
                    None => self.position = Position::AccessoryEnd,
                }
            }
            Position::ServiceBegin => {
                let service = self.service(db);
                self.pending.extend_from_slice(b"{\"iid\":");
                self.pending
                    .extend_from_slice(service.iid.to_string().as_bytes());
                self.pending.extend_from_slice(b",\"type\":");
                json::push_string(&mut self.pending, &service.service_type.to_hap_string());
                if service.primary {
                    self.pending.extend_from_slice(b",\"primary\":true");
                }
                if service.hidden {
                    self.pending.extend_from_slice(b",\"hidden\":true");
                }
                if !service.linked_services.is_empty() {
                    self.pending.extend_from_slice(b",\"linked\":[");
                    self.linked_index = 0;
                    self.position = Position::LinkedId;
                } else {
                    self.position = Position::CharacteristicsBegin;
                }
            }
            Position::LinkedId => {
                let service = self.service(db);
                if self.linked_index > 0 {
                    self.pending.push(b',');
                }
                self.pending.extend_from_slice(
                    service.linked_services[self.linked_index].to_string().as_bytes(),
                );
                self.linked_index += 1;
                if self.linked_index == service.linked_services.len() {
                    self.pending.push(b']');
                    self.position = Position::CharacteristicsBegin;
                }
            }
            Position::CharacteristicsBegin => {
                self.pending.extend_from_slice(b",\"characteristics\":[");
                match self.next_supported_characteristic(db, 0) {
                    Some(index) => {
                        self.characteristic_index = index;
                        self.position = Position::CharacteristicBegin;
                    }
                    None => self.position = Position::ServiceEnd,
                }
            }
            Position::CharacteristicBegin => {
                let characteristic = self.characteristic(db);
                self.pending.extend_from_slice(b"{\"iid\":");
                self.pending
                    .extend_from_slice(characteristic.iid.to_string().as_bytes());
                self.pending.extend_from_slice(b",\"type\":");
                json::push_string(&mut self.pending, &characteristic.char_type.to_hap_string());
                self.pending.extend_from_slice(b",\"format\":");
                json::push_string(&mut self.pending, characteristic.format.as_str());
                self.position = if characteristic.properties.contains(Properties::READABLE) {
                    Position::CharacteristicValue
                } else {
                    Position::CharacteristicPerms
                };
            }
            Position::CharacteristicValue => {
                let accessory = self.accessory(db);
                let characteristic = self.characteristic(db);
                self.pending.extend_from_slice(b",\"value\":");
                let value = access::read(
                    db,
                    session,
                    accessory.aid,
                    characteristic.iid,
                    ReadKind::Enumeration,
                );
                stage_value(&mut self.pending, characteristic.format, value.ok());
                self.position = Position::CharacteristicPerms;
            }
            Position::CharacteristicPerms => {
                let characteristic = self.characteristic(db);
                let props = characteristic.properties;
                self.pending.extend_from_slice(b",\"perms\":[");
                let mut first = true;
                let mut push = |pending: &mut Vec<u8>, perm: &str| {
                    if !first {
                        pending.push(b',');
                    }
                    first = false;
                    json::push_string(pending, perm);
                };
                if props.contains(Properties::READABLE) {
                    push(&mut self.pending, "pr");
                }
                if props.contains(Properties::WRITABLE) {
                    push(&mut self.pending, "pw");
                }
                if props.contains(Properties::SUPPORTS_EVENTS) {
                    push(&mut self.pending, "ev");
                }
                if props.contains(Properties::SUPPORTS_AUTHORIZATION_DATA) {
                    push(&mut self.pending, "aa");
                }
                if props.contains(Properties::REQUIRES_TIMED_WRITE) {
                    push(&mut self.pending, "tw");
                }
                if props.contains(Properties::HIDDEN) {
                    push(&mut self.pending, "hd");
                }
                if props.contains(Properties::IP_SUPPORTS_WRITE_RESPONSE) {
                    push(&mut self.pending, "wr");
                }
                self.pending.push(b']');
                self.position = Position::CharacteristicEv;
            }
            Position::CharacteristicEv => {
                let accessory = self.accessory(db);
                let characteristic = self.characteristic(db);
                if characteristic.properties.contains(Properties::SUPPORTS_EVENTS) {
                    let enabled = session
                        .subscriptions
                        .contains(&(accessory.aid, characteristic.iid));
                    self.pending.extend_from_slice(if enabled {
                        b",\"ev\":true"
                    } else {
                        b",\"ev\":false"
                    });
                }
                self.position = Position::CharacteristicMeta;
            }
            Position::CharacteristicMeta => {
                let characteristic = self.characteristic(db);
                stage_metadata(&mut self.pending, characteristic);
                self.position = Position::CharacteristicEnd;
            }
            Position::CharacteristicEnd => {
                self.pending.push(b'}');
                match self.next_supported_characteristic(db, self.characteristic_index + 1) {
                    Some(index) => {
                        self.characteristic_index = index;
                        self.pending.push(b',');
                        self.position = Position::CharacteristicBegin;
                    }
                    None => self.position = Position::ServiceEnd,
                }
            }
            Position::ServiceEnd => {
                self.pending.extend_from_slice(b"]}");
                match self.next_supported_service(db, self.service_index + 1) {
                    Some(index) => {
                        self.service_index = index;
                        self.pending.push(b',');
                        self.position = Position::ServiceBegin;
                    }
                    None => self.position = Position::AccessoryEnd,
                }
            }
            Position::AccessoryEnd => {
                self.pending.extend_from_slice(b"]}");
                self.accessory_index += 1;
                if self.accessory_index < db.accessories.len() {
                    self.pending.push(b',');
                    self.position = Position::AccessoryBegin;
                } else {
                    self.position = Position::End;
                }
            }
            Position::End => {
                self.pending.extend_from_slice(b"]}");
                self.position = Position::Done;
            }
            Position::Done => {}
        }
    }
}

/// Renders one characteristic value. A suppressed or failed read renders
/// as an empty string for TLV characteristics and null for every other
/// format. The batch read responses and EVENT frames in `ip::server` use
/// the same rendering, so the rule has exactly one definition.
pub(crate) fn stage_value(pending: &mut Vec<u8>, format: Format, value: Option<HapValue>) {
    let value = match value {
        Some(HapValue::Null) | None => {
            if format == Format::Tlv8 {
                pending.extend_from_slice(b"\"\"");
            } else {
                pending.extend_from_slice(b"null");
            }
            return;
        }
        Some(value) => value,
    };
    match value {
        HapValue::Bool(v) => pending.extend_from_slice(if v { b"1" } else { b"0" }),
        HapValue::UInt8(v) => pending.extend_from_slice(v.to_string().as_bytes()),
        HapValue::UInt16(v) => pending.extend_from_slice(v.to_string().as_bytes()),
        HapValue::UInt32(v) => pending.extend_from_slice(v.to_string().as_bytes()),
        HapValue::UInt64(v) => pending.extend_from_slice(v.to_string().as_bytes()),
        HapValue::Int32(v) => pending.extend_from_slice(v.to_string().as_bytes()),
        HapValue::Float32(v) => json::push_float(pending, v),
        HapValue::String(s) => json::push_string(pending, &s),
        HapValue::Data(bytes) | HapValue::Tlv8(bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            json::push_string(pending, &encoded);
        }
        HapValue::Null => unreachable!("handled above"),
    }
}

fn stage_metadata(pending: &mut Vec<u8>, characteristic: &Characteristic) {
    if let Some(description) = &characteristic.manufacturer_description {
        pending.extend_from_slice(b",\"description\":");
        json::push_string(pending, description);
    }
    if characteristic.unit != Unit::None {
        if let Some(unit) = characteristic.unit.as_str() {
            pending.extend_from_slice(b",\"unit\":");
            json::push_string(pending, unit);
        }
    }
    let apple_defined = characteristic.char_type.is_apple_defined();
    match &characteristic.constraints {
        Constraints::None => {}
        Constraints::UInt {
            min,
            max,
            step,
            valid_values,
            valid_value_ranges,
        } => {
            pending.extend_from_slice(b",\"minValue\":");
            pending.extend_from_slice(min.to_string().as_bytes());
            pending.extend_from_slice(b",\"maxValue\":");
            pending.extend_from_slice(max.to_string().as_bytes());
            if *step > 0 {
                pending.extend_from_slice(b",\"minStep\":");
                pending.extend_from_slice(step.to_string().as_bytes());
            }
            if apple_defined {
                if let Some(values) = valid_values {
                    pending.extend_from_slice(b",\"valid-values\":[");
                    for (i, value) in values.iter().enumerate() {
                        if i > 0 {
                            pending.push(b',');
                        }
                        pending.extend_from_slice(value.to_string().as_bytes());
                    }
                    pending.push(b']');
                }
                if let Some(ranges) = valid_value_ranges {
                    pending.extend_from_slice(b",\"valid-values-range\":[");
                    for (i, (start, end)) in ranges.iter().enumerate() {
                        if i > 0 {
                            pending.push(b',');
                        }
                        pending.push(b'[');
                        pending.extend_from_slice(start.to_string().as_bytes());
                        pending.push(b',');
                        pending.extend_from_slice(end.to_string().as_bytes());
                        pending.push(b']');
                    }
                    pending.push(b']');
                }
            }
        }
        Constraints::Int {
            min,
            max,
            step,
            valid_values,
            valid_value_ranges,
        } => {
            pending.extend_from_slice(b",\"minValue\":");
            pending.extend_from_slice(min.to_string().as_bytes());
            pending.extend_from_slice(b",\"maxValue\":");
            pending.extend_from_slice(max.to_string().as_bytes());
            if *step > 0 {
                pending.extend_from_slice(b",\"minStep\":");
                pending.extend_from_slice(step.to_string().as_bytes());
            }
            if apple_defined {
                if let Some(values) = valid_values {
                    pending.extend_from_slice(b",\"valid-values\":[");
                    for (i, value) in values.iter().enumerate() {
                        if i > 0 {
                            pending.push(b',');
                        }
                        pending.extend_from_slice(value.to_string().as_bytes());
                    }
                    pending.push(b']');
                }
                if let Some(ranges) = valid_value_ranges {
                    pending.extend_from_slice(b",\"valid-values-range\":[");
                    for (i, (start, end)) in ranges.iter().enumerate() {
                        if i > 0 {
                            pending.push(b',');
                        }
                        pending.push(b'[');
                        pending.extend_from_slice(start.to_string().as_bytes());
                        pending.push(b',');
                        pending.extend_from_slice(end.to_string().as_bytes());
                        pending.push(b']');
                    }
                    pending.push(b']');
                }
            }
        }
        Constraints::Float { min, max, step } => {
            if min.is_finite() {
                pending.extend_from_slice(b",\"minValue\":");
                json::push_float(pending, *min);
            }
            if max.is_finite() {
                pending.extend_from_slice(b",\"maxValue\":");
                json::push_float(pending, *max);
            }
            if *step > 0.0 {
                pending.extend_from_slice(b",\"minStep\":");
                json::push_float(pending, *step);
            }
        }
        Constraints::String { max_length } => {
            if *max_length != 64 {
                pending.extend_from_slice(b",\"maxLen\":");
                pending.extend_from_slice(max_length.to_string().as_bytes());
            }
        }
        Constraints::Data { max_length } => {
            if *max_length != 2_097_152 {
                pending.extend_from_slice(b",\"maxDataLen\":");
                pending.extend_from_slice(max_length.to_string().as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::{
        accessory_information_service, pairing_service, protocol_information_service, Category,
        Service,
    };
    use crate::accessory::service_types;
    use crate::characteristic::{types, Callbacks};
    use crate::session::SessionPool;

    fn light_accessory(aid: u64, on: bool) -> Accessory {
        let mut service = Service::new(0x30, service_types::LIGHT_BULB, "light-bulb");
        service.primary = true;
        let mut on_char = Characteristic::new(0x31, types::ON, Format::Bool, "on");
        on_char.properties =
            Properties::READABLE | Properties::WRITABLE | Properties::SUPPORTS_EVENTS;
        on_char.callbacks = Callbacks {
            read: Some(Box::new(move |_| Ok(HapValue::Bool(on)))),
            write: Some(Box::new(|_, _| Ok(()))),
            ..Callbacks::default()
        };
        service.characteristics.push(on_char);

        let mut brightness =
            Characteristic::new(0x32, types::BRIGHTNESS, Format::Int32, "brightness");
        brightness.properties = Properties::READABLE | Properties::WRITABLE;
        brightness.unit = Unit::Percentage;
        brightness.constraints = Constraints::Int {
            min: 0,
            max: 100,
            step: 1,
            valid_values: None,
            valid_value_ranges: None,
        };
        brightness.callbacks = Callbacks {
            read: Some(Box::new(|_| Ok(HapValue::Int32(55)))),
            write: Some(Box::new(|_, _| Ok(()))),
            ..Callbacks::default()
        };
        service.characteristics.push(brightness);

        Accessory {
            aid,
            category: Category::Lighting,
            name: format!("Light {}", aid),
            manufacturer: "Acme".into(),
            model: "L1".into(),
            serial_number: "0001".into(),
            firmware_version: "1".into(),
            hardware_version: None,
            services: vec![
                accessory_information_service(1),
                protocol_information_service(0x10),
                pairing_service(0x20),
                service,
            ],
            identify: Some(Box::new(|| Ok(()))),
        }
    }

    fn session() -> (SessionPool, crate::session::SessionHandle) {
        let mut pool = SessionPool::new(1);
        let handle = pool.allocate(TransportType::Ip, 0).unwrap();
        (pool, handle)
    }

    #[test]
    fn output_is_valid_json_with_expected_shape() {
        let accessories = [light_accessory(1, true)];
        let db = Database::new(&accessories);
        let (pool, handle) = session();
        let bytes = AccessorySerializer::serialize_all(db, pool.get(handle).unwrap());

        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let accessories_json = parsed["accessories"].as_array().unwrap();
        assert_eq!(accessories_json.len(), 1);
        assert_eq!(accessories_json[0]["aid"], 1);

        let services = accessories_json[0]["services"].as_array().unwrap();
        // The pairing service is not exposed over IP.
        let types: Vec<&str> = services
            .iter()
            .map(|s| s["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["3E", "A2", "43"]);

        let light = &services[2];
        assert_eq!(light["primary"], true);
        let characteristics = light["characteristics"].as_array().unwrap();
        assert_eq!(characteristics.len(), 2);

        let on = &characteristics[0];
        assert_eq!(on["type"], "25");
        assert_eq!(on["format"], "bool");
        // Booleans render as 0/1.
        assert_eq!(on["value"], 1);
        assert_eq!(on["ev"], false);
        let perms: Vec<&str> = on["perms"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p.as_str().unwrap())
            .collect();
        assert_eq!(perms, vec!["pr", "pw", "ev"]);

        let brightness = &characteristics[1];
        assert_eq!(brightness["unit"], "percentage");
        assert_eq!(brightness["minValue"], 0);
        assert_eq!(brightness["maxValue"], 100);
        assert_eq!(brightness["value"], 55);
    }

    #[test]
    fn service_signature_is_skipped_on_ip() {
        let accessories = [light_accessory(1, false)];
        let db = Database::new(&accessories);
        let (pool, handle) = session();
        let bytes = AccessorySerializer::serialize_all(db, pool.get(handle).unwrap());
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let services = parsed["accessories"][0]["services"].as_array().unwrap();
        // Protocol information keeps only its version characteristic.
        let protocol = &services[1];
        let characteristics = protocol["characteristics"].as_array().unwrap();
        assert_eq!(characteristics.len(), 1);
        assert_eq!(characteristics[0]["format"], "string");
    }

    #[test]
    fn chunked_output_matches_one_shot() {
        let accessories = [light_accessory(1, true), light_accessory(2, false)];
        let db = Database::new(&accessories);
        let (pool, handle) = session();
        let session = pool.get(handle).unwrap();

        let reference = AccessorySerializer::serialize_all(db, session);

        for chunk_size in [1usize, 7, 64, 1024] {
            let mut serializer = AccessorySerializer::new();
            let mut assembled = Vec::new();
            let mut chunk = vec![0u8; chunk_size];
            let mut calls = 0;
            while !serializer.is_complete() {
                let n = serializer.write_chunk(db, session, &mut chunk);
                assembled.extend_from_slice(&chunk[..n]);
                calls += 1;
                assert!(calls < 1_000_000, "serializer failed to make progress");
            }
            assert_eq!(assembled, reference, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn chunk_count_is_exactly_ceiling() {
        let accessories = [light_accessory(1, true), light_accessory(2, false)];
        let db = Database::new(&accessories);
        let (pool, handle) = session();
        let session = pool.get(handle).unwrap();
        let reference = AccessorySerializer::serialize_all(db, session);

        let chunk_size = 256;
        let mut serializer = AccessorySerializer::new();
        let mut chunk = vec![0u8; chunk_size];
        let mut calls = 0;
        while !serializer.is_complete() {
            serializer.write_chunk(db, session, &mut chunk);
            calls += 1;
        }
        assert_eq!(calls, reference.len().div_ceil(chunk_size));
    }

    #[test]
    fn bridged_accessories_serialize_in_order() {
        let accessories = [light_accessory(1, true), light_accessory(5, false)];
        let db = Database::new(&accessories);
        let (pool, handle) = session();
        let bytes = AccessorySerializer::serialize_all(db, pool.get(handle).unwrap());
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let aids: Vec<u64> = parsed["accessories"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["aid"].as_u64().unwrap())
            .collect();
        assert_eq!(aids, vec![1, 5]);
    }
}
