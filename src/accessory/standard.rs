// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Builders for the three services every accessory carries: Accessory
//! Information, HAP Protocol Information, and Pairing.

use crate::accessory::{service_types, Service};
use crate::characteristic::{
    types, Callbacks, Characteristic, Constraints, Format, HapValue, Properties,
};
use crate::Error;

/// The protocol version reported by the Version characteristic.
const PROTOCOL_VERSION: &str = "1.1.0";

fn string_characteristic(
    iid: u64,
    char_type: uuid::Uuid,
    debug_description: &'static str,
    read: crate::characteristic::ReadCallback,
) -> Characteristic {
    let mut c = Characteristic::new(iid, char_type, Format::String, debug_description);
    c.properties = Properties::READABLE;
    c.callbacks = Callbacks {
        read: Some(read),
        ..Callbacks::default()
    };
    c
}

/// The Accessory Information service. Consumes `iid..iid+8`: the service,
/// identify, manufacturer, model, name, serial number, firmware revision,
/// and hardware revision.
pub fn accessory_information_service(iid: u64) -> Service {
    let mut service = Service::new(iid, service_types::ACCESSORY_INFORMATION, "accessory-information");

    let mut identify = Characteristic::new(iid + 1, types::IDENTIFY, Format::Bool, "identify");
    identify.properties = Properties::WRITABLE;
    identify.callbacks.write = Some(Box::new(|ctx, value| {
        if *value != HapValue::Bool(true) {
            return Err(Error::InvalidData);
        }
        match &ctx.accessory.identify {
            Some(identify) => identify(),
            None => Ok(()),
        }
    }));
    service.characteristics.push(identify);

    service.characteristics.push(string_characteristic(
        iid + 2,
        types::MANUFACTURER,
        "manufacturer",
        Box::new(|ctx| Ok(HapValue::String(ctx.accessory.manufacturer.clone()))),
    ));
    service.characteristics.push(string_characteristic(
        iid + 3,
        types::MODEL,
        "model",
        Box::new(|ctx| Ok(HapValue::String(ctx.accessory.model.clone()))),
    ));
    service.characteristics.push(string_characteristic(
        iid + 4,
        types::NAME,
        "name",
        Box::new(|ctx| Ok(HapValue::String(ctx.accessory.name.clone()))),
    ));
    service.characteristics.push(string_characteristic(
        iid + 5,
        types::SERIAL_NUMBER,
        "serial-number",
        Box::new(|ctx| Ok(HapValue::String(ctx.accessory.serial_number.clone()))),
    ));
    service.characteristics.push(string_characteristic(
        iid + 6,
        types::FIRMWARE_REVISION,
        "firmware-revision",
        Box::new(|ctx| Ok(HapValue::String(ctx.accessory.firmware_version.clone()))),
    ));
    service.characteristics.push(string_characteristic(
        iid + 7,
        types::HARDWARE_REVISION,
        "hardware-revision",
        Box::new(|ctx| {
            Ok(HapValue::String(
                ctx.accessory.hardware_version.clone().unwrap_or_default(),
            ))
        }),
    ));

    service
}

/// The HAP Protocol Information service. Consumes `iid..iid+3`: the
/// service, its signature characteristic, and the Version characteristic.
pub fn protocol_information_service(iid: u64) -> Service {
    let mut service = Service::new(iid, service_types::PROTOCOL_INFORMATION, "protocol-information");
    service.supports_configuration = true;

    service
        .characteristics
        .push(service_signature_characteristic(iid + 1));

    let mut version = Characteristic::new(iid + 2, types::VERSION, Format::String, "version");
    version.properties = Properties::READABLE;
    version.callbacks.read = Some(Box::new(|_| {
        Ok(HapValue::String(PROTOCOL_VERSION.to_string()))
    }));
    service.characteristics.push(version);

    service
}

/// The Pairing service. Consumes `iid..iid+5`. Its TLV characteristics are
/// routed to the pairing state machines by the transports; the callbacks
/// installed here only answer if a request reaches them outside a pairing
/// procedure, which is illegal.
pub fn pairing_service(iid: u64) -> Service {
    let mut service = Service::new(iid, service_types::PAIRING, "pairing");

    let mut pair_setup =
        Characteristic::new(iid + 1, types::PAIR_SETUP, Format::Tlv8, "pair-setup");
    pair_setup.properties = Properties::READABLE
        | Properties::WRITABLE
        | Properties::BLE_READABLE_WITHOUT_SECURITY
        | Properties::BLE_WRITABLE_WITHOUT_SECURITY;
    pair_setup.callbacks.read = Some(Box::new(|_| Err(Error::InvalidState)));
    pair_setup.callbacks.write = Some(Box::new(|_, _| Err(Error::InvalidState)));
    service.characteristics.push(pair_setup);

    let mut pair_verify =
        Characteristic::new(iid + 2, types::PAIR_VERIFY, Format::Tlv8, "pair-verify");
    pair_verify.properties = Properties::READABLE
        | Properties::WRITABLE
        | Properties::BLE_READABLE_WITHOUT_SECURITY
        | Properties::BLE_WRITABLE_WITHOUT_SECURITY;
    pair_verify.callbacks.read = Some(Box::new(|_| Err(Error::InvalidState)));
    pair_verify.callbacks.write = Some(Box::new(|_, _| Err(Error::InvalidState)));
    service.characteristics.push(pair_verify);

    let mut features = Characteristic::new(
        iid + 3,
        types::PAIRING_FEATURES,
        Format::UInt8,
        "pairing-features",
    );
    features.properties = Properties::READABLE | Properties::BLE_READABLE_WITHOUT_SECURITY;
    features.constraints = Constraints::unsigned(0, 0xff);
    // No MFi hardware and no software token authentication.
    features.callbacks.read = Some(Box::new(|_| Ok(HapValue::UInt8(0))));
    service.characteristics.push(features);

    let mut pairings = Characteristic::new(
        iid + 4,
        types::PAIRING_PAIRINGS,
        Format::Tlv8,
        "pairing-pairings",
    );
    pairings.properties = Properties::READABLE | Properties::WRITABLE | Properties::REQUIRES_ADMIN;
    pairings.callbacks.read = Some(Box::new(|_| Err(Error::InvalidState)));
    pairings.callbacks.write = Some(Box::new(|_, _| Err(Error::InvalidState)));
    service.characteristics.push(pairings);

    service
}

/// The Service Signature characteristic carried by configurable services.
/// BLE answers it through the signature-read opcode; IP skips it during
/// enumeration.
pub fn service_signature_characteristic(iid: u64) -> Characteristic {
    let mut c = Characteristic::new(
        iid,
        types::SERVICE_SIGNATURE,
        Format::Data,
        "service-signature",
    );
    c.properties = Properties::READABLE | Properties::IP_CONTROL_POINT;
    c.constraints = Constraints::Data { max_length: 2097152 };
    c.callbacks.read = Some(Box::new(|_| Ok(HapValue::Data(Vec::new()))));
    c
}
