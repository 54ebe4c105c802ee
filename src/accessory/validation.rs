// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Start-time validation of the attribute database. Runs exactly once when
//! the server starts; any violation keeps the server in the idle state.

use log::error;

use crate::accessory::{service_types, Accessory, Service};
use crate::characteristic::{Characteristic, Constraints, Format, Properties};
use crate::hapuuid::HapUuid;
use crate::{Error, Result};

/// Validates the complete accessory list. The first entry is the primary
/// accessory; the rest are bridged.
pub fn validate(accessories: &[Accessory], ble_enabled: bool) -> Result<()> {
    if accessories.is_empty() {
        error!("Attribute database contains no accessories.");
        return Err(Error::InvalidData);
    }
    if accessories[0].aid != 1 {
        error!(
            "Primary accessory must have aid 1, has {}.",
            accessories[0].aid
        );
        return Err(Error::InvalidData);
    }
    for (i, accessory) in accessories.iter().enumerate() {
        if i > 0 && accessory.aid == 1 {
            error!("Bridged accessory must not have aid 1.");
            return Err(Error::InvalidData);
        }
        if accessories[..i].iter().any(|a| a.aid == accessory.aid) {
            error!("Duplicate accessory id {}.", accessory.aid);
            return Err(Error::InvalidData);
        }
        validate_accessory(accessory, ble_enabled)?;
    }
    Ok(())
}

fn validate_accessory(accessory: &Accessory, ble_enabled: bool) -> Result<()> {
    let aid = accessory.aid;
    if accessory.name.len() > 64 {
        error!("Accessory {} name has invalid length ({}) - expected: max 64.", aid, accessory.name.len());
        return Err(Error::InvalidData);
    }
    if accessory.manufacturer.len() > 64 {
        error!("Accessory {} manufacturer has invalid length ({}) - expected: max 64.", aid, accessory.manufacturer.len());
        return Err(Error::InvalidData);
    }
    if accessory.model.is_empty() || accessory.model.len() > 64 {
        error!("Accessory {} model has invalid length ({}) - expected: min 1, max 64.", aid, accessory.model.len());
        return Err(Error::InvalidData);
    }
    if accessory.serial_number.len() < 2 || accessory.serial_number.len() > 64 {
        error!("Accessory {} serial number has invalid length ({}) - expected: min 2, max 64.", aid, accessory.serial_number.len());
        return Err(Error::InvalidData);
    }
    if accessory.firmware_version.is_empty() {
        error!("Accessory {} firmware version is not set.", aid);
        return Err(Error::InvalidData);
    }
    if accessory.services.is_empty() {
        error!("Accessory {} must at least contain the Accessory Information service.", aid);
        return Err(Error::InvalidData);
    }

    // Instance id uniqueness spans services and characteristics.
    let mut iids: Vec<u64> = Vec::new();
    for service in &accessory.services {
        iids.push(service.iid);
        for characteristic in &service.characteristics {
            iids.push(characteristic.iid);
        }
    }
    let mut sorted = iids.clone();
    sorted.sort_unstable();
    if sorted.windows(2).any(|w| w[0] == w[1]) {
        error!("Accessory {} has duplicate instance ids.", aid);
        return Err(Error::InvalidData);
    }

    let mut num_primary = 0;
    for service in &accessory.services {
        if service.primary {
            num_primary += 1;
        }
        validate_service(accessory, service, ble_enabled)?;
    }
    if num_primary > 1 {
        error!("Accessory {} has more than one primary service.", aid);
        return Err(Error::InvalidData);
    }
    Ok(())
}

fn validate_service(accessory: &Accessory, service: &Service, ble_enabled: bool) -> Result<()> {
    let aid = accessory.aid;
    if service.iid == 0 {
        error!("Accessory {} service instance id must not be 0.", aid);
        return Err(Error::InvalidData);
    }
    if ble_enabled && service.iid > u16::MAX as u64 {
        error!(
            "Accessory {} service {} instance id exceeds 16 bits while BLE is enabled.",
            aid, service.iid
        );
        return Err(Error::InvalidData);
    }
    if service.supports_configuration
        && service.service_type != service_types::PROTOCOL_INFORMATION
    {
        error!(
            "Accessory {} service {} may not support configuration.",
            aid, service.iid
        );
        return Err(Error::InvalidData);
    }

    if !service.characteristics.is_empty() {
        let all_hidden = service
            .characteristics
            .iter()
            .all(|c| c.properties.contains(Properties::HIDDEN));
        if service.hidden != all_hidden {
            error!(
                "Accessory {} service {} hidden flag does not match its characteristics.",
                aid, service.iid
            );
            return Err(Error::InvalidData);
        }
    }

    for (i, linked) in service.linked_services.iter().enumerate() {
        if *linked == service.iid {
            error!(
                "Accessory {} service {} links to itself.",
                aid, service.iid
            );
            return Err(Error::InvalidData);
        }
        if service.linked_services[..i].contains(linked) {
            error!(
                "Accessory {} service {} has duplicate linked service {}.",
                aid, service.iid, linked
            );
            return Err(Error::InvalidData);
        }
        if accessory.service(*linked).is_none() {
            error!(
                "Accessory {} service {} links to unknown service {}.",
                aid, service.iid, linked
            );
            return Err(Error::InvalidData);
        }
    }

    for characteristic in &service.characteristics {
        validate_characteristic(accessory, service, characteristic, ble_enabled)?;
    }
    Ok(())
}

fn validate_characteristic(
    accessory: &Accessory,
    service: &Service,
    characteristic: &Characteristic,
    ble_enabled: bool,
) -> Result<()> {
    let aid = accessory.aid;
    let iid = characteristic.iid;
    let props = characteristic.properties;
    let callbacks = &characteristic.callbacks;

    if iid == 0 {
        error!("Accessory {} characteristic instance id must not be 0.", aid);
        return Err(Error::InvalidData);
    }
    if ble_enabled && iid > u16::MAX as u64 {
        error!(
            "Accessory {} characteristic {} instance id exceeds 16 bits while BLE is enabled.",
            aid, iid
        );
        return Err(Error::InvalidData);
    }

    let rule = |ok: bool, what: &str| -> Result<()> {
        if !ok {
            error!(
                "Accessory {} service {} characteristic {}: {}.",
                aid, service.iid, iid, what
            );
            return Err(Error::InvalidData);
        }
        Ok(())
    };

    rule(
        !props.contains(Properties::READABLE) || callbacks.read.is_some(),
        "readable requires a read callback",
    )?;
    rule(
        !props.contains(Properties::WRITABLE) || callbacks.write.is_some(),
        "writable requires a write callback",
    )?;
    rule(
        !props.contains(Properties::SUPPORTS_EVENTS) || callbacks.read.is_some(),
        "event notification support requires a read callback",
    )?;
    rule(
        !props.read_requires_admin() || props.contains(Properties::READABLE),
        "admin-gated reads require the readable property",
    )?;
    rule(
        !props.write_requires_admin() || props.contains(Properties::WRITABLE),
        "admin-gated writes require the writable property",
    )?;
    rule(
        !(props.read_requires_admin() && props.contains(Properties::WRITABLE))
            || props.write_requires_admin(),
        "admin-gated readable and writable requires admin-gated writes",
    )?;
    rule(
        !props.contains(Properties::REQUIRES_TIMED_WRITE) || props.contains(Properties::WRITABLE),
        "timed writes require the writable property",
    )?;
    rule(
        !props.contains(Properties::SUPPORTS_AUTHORIZATION_DATA)
            || props.contains(Properties::WRITABLE),
        "authorization data requires the writable property",
    )?;
    rule(
        !props.contains(Properties::IP_SUPPORTS_WRITE_RESPONSE)
            || (props.contains(Properties::WRITABLE)
                && callbacks.read.is_some()
                && callbacks.write.is_some()),
        "write response requires writable plus read and write callbacks",
    )?;
    rule(
        !props.contains(Properties::BLE_SUPPORTS_BROADCAST_NOTIFICATION)
            || callbacks.read.is_some(),
        "broadcast notifications require a read callback",
    )?;
    rule(
        !props.contains(Properties::BLE_SUPPORTS_DISCONNECTED_NOTIFICATION)
            || (props.contains(Properties::READABLE)
                && props.contains(Properties::SUPPORTS_EVENTS)
                && props.contains(Properties::BLE_SUPPORTS_BROADCAST_NOTIFICATION)
                && callbacks.read.is_some()),
        "disconnected notifications require readable, events, and broadcasts",
    )?;

    validate_constraints(accessory, characteristic)
}

fn validate_constraints(accessory: &Accessory, characteristic: &Characteristic) -> Result<()> {
    let aid = accessory.aid;
    let iid = characteristic.iid;
    let format = characteristic.format;

    let matches_format = match (&characteristic.constraints, format) {
        (Constraints::None, Format::Bool | Format::Tlv8) => true,
        (
            Constraints::UInt { .. },
            Format::UInt8 | Format::UInt16 | Format::UInt32 | Format::UInt64,
        ) => true,
        (Constraints::Int { .. }, Format::Int32) => true,
        (Constraints::Float { .. }, Format::Float32) => true,
        (Constraints::String { .. }, Format::String) => true,
        (Constraints::Data { .. }, Format::Data) => true,
        _ => false,
    };
    if !matches_format {
        error!(
            "Accessory {} characteristic {}: constraints do not match format {:?}.",
            aid, iid, format
        );
        return Err(Error::InvalidData);
    }

    let mut has_value_lists = false;
    let ok = match &characteristic.constraints {
        Constraints::None | Constraints::String { .. } | Constraints::Data { .. } => true,
        Constraints::UInt {
            min,
            max,
            valid_values,
            valid_value_ranges,
            ..
        } => {
            has_value_lists = valid_values.is_some() || valid_value_ranges.is_some();
            min <= max
                && valid_values
                    .as_ref()
                    .map_or(true, |v| v.windows(2).all(|w| w[0] < w[1]))
                && valid_value_ranges.as_ref().map_or(true, |r| {
                    r.iter().all(|(s, e)| s <= e)
                        && r.windows(2).all(|w| w[0].0 < w[1].0)
                })
        }
        Constraints::Int {
            min,
            max,
            step,
            valid_values,
            valid_value_ranges,
        } => {
            has_value_lists = valid_values.is_some() || valid_value_ranges.is_some();
            min <= max
                && *step >= 0
                && valid_values
                    .as_ref()
                    .map_or(true, |v| v.windows(2).all(|w| w[0] < w[1]))
                && valid_value_ranges.as_ref().map_or(true, |r| {
                    r.iter().all(|(s, e)| s <= e)
                        && r.windows(2).all(|w| w[0].0 < w[1].0)
                })
        }
        Constraints::Float { min, max, step } => {
            !min.is_nan() && !max.is_nan() && !step.is_nan() && min <= max && *step >= 0.0
        }
    };
    if !ok {
        error!(
            "Accessory {} characteristic {}: invalid value constraints.",
            aid, iid
        );
        return Err(Error::InvalidData);
    }

    // Valid-value lists are reserved for Apple-defined characteristics.
    if has_value_lists && !characteristic.char_type.is_apple_defined() {
        error!(
            "Accessory {} characteristic {}: valid value lists require an Apple-defined type.",
            aid, iid
        );
        return Err(Error::InvalidData);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::{
        accessory_information_service, pairing_service, protocol_information_service, Category,
    };
    use crate::characteristic::types;
    use crate::characteristic::{Callbacks, HapValue};
    use uuid::Uuid;

    fn light_bulb_service(iid: u64) -> Service {
        let mut service = Service::new(iid, service_types::LIGHT_BULB, "light-bulb");
        service.primary = true;
        let mut on = Characteristic::new(iid + 1, types::ON, Format::Bool, "on");
        on.properties =
            Properties::READABLE | Properties::WRITABLE | Properties::SUPPORTS_EVENTS;
        on.callbacks = Callbacks {
            read: Some(Box::new(|_| Ok(HapValue::Bool(false)))),
            write: Some(Box::new(|_, _| Ok(()))),
            ..Callbacks::default()
        };
        service.characteristics.push(on);
        service
    }

    fn test_accessory() -> Accessory {
        Accessory {
            aid: 1,
            category: Category::Lighting,
            name: "Acme Test".into(),
            manufacturer: "Acme".into(),
            model: "Test1,1".into(),
            serial_number: "099DB48E9E28".into(),
            firmware_version: "1".into(),
            hardware_version: Some("1".into()),
            services: vec![
                accessory_information_service(1),
                protocol_information_service(0x10),
                pairing_service(0x20),
                light_bulb_service(0x30),
            ],
            identify: Some(Box::new(|| Ok(()))),
        }
    }

    #[test]
    fn standard_database_is_valid() {
        let accessories = [test_accessory()];
        assert!(validate(&accessories, true).is_ok());
    }

    #[test]
    fn primary_accessory_id_must_be_one() {
        let mut accessory = test_accessory();
        accessory.aid = 2;
        assert_eq!(validate(&[accessory], true), Err(Error::InvalidData));
    }

    #[test]
    fn duplicate_instance_ids_are_rejected() {
        let mut accessory = test_accessory();
        accessory.services[3].characteristics[0].iid = 0x30;
        assert_eq!(validate(&[accessory], true), Err(Error::InvalidData));
    }

    #[test]
    fn wide_instance_ids_require_ip_only() {
        let mut accessory = test_accessory();
        accessory.services[3].iid = 0x1_0000;
        accessory.services[3].characteristics[0].iid = 0x1_0001;
        assert_eq!(
            validate(std::slice::from_ref(&accessory), true),
            Err(Error::InvalidData)
        );
        assert!(validate(&[accessory], false).is_ok());
    }

    #[test]
    fn readable_requires_read_callback() {
        let mut accessory = test_accessory();
        accessory.services[3].characteristics[0].callbacks.read = None;
        assert_eq!(validate(&[accessory], true), Err(Error::InvalidData));
    }

    #[test]
    fn hidden_flag_must_match_characteristics() {
        let mut accessory = test_accessory();
        accessory.services[3].hidden = true;
        assert_eq!(validate(&[accessory], true), Err(Error::InvalidData));
    }

    #[test]
    fn linked_services_must_resolve() {
        let mut accessory = test_accessory();
        accessory.services[3].linked_services = vec![0x999];
        assert_eq!(validate(&[accessory], true), Err(Error::InvalidData));
    }

    #[test]
    fn self_link_is_rejected() {
        let mut accessory = test_accessory();
        accessory.services[3].linked_services = vec![0x30];
        assert_eq!(validate(&[accessory], true), Err(Error::InvalidData));
    }

    #[test]
    fn valid_values_must_ascend() {
        let mut accessory = test_accessory();
        let mut modes = Characteristic::new(0x32, types::PROGRAMMABLE_SWITCH_EVENT, Format::UInt8, "event");
        modes.properties = Properties::READABLE | Properties::SUPPORTS_EVENTS;
        modes.callbacks.read = Some(Box::new(|_| Ok(HapValue::Null)));
        modes.constraints = Constraints::UInt {
            min: 0,
            max: 2,
            step: 1,
            valid_values: Some(vec![2, 0]),
            valid_value_ranges: None,
        };
        accessory.services[3].characteristics.push(modes);
        assert_eq!(validate(&[accessory], true), Err(Error::InvalidData));
    }

    #[test]
    fn vendor_types_may_not_carry_valid_values() {
        let mut accessory = test_accessory();
        let vendor_type = Uuid::parse_str("34ab8811-ac7f-4340-bac3-fd6a85f9943b").unwrap();
        let mut custom = Characteristic::new(0x33, vendor_type, Format::UInt8, "custom");
        custom.properties = Properties::READABLE;
        custom.callbacks.read = Some(Box::new(|_| Ok(HapValue::UInt8(0))));
        custom.constraints = Constraints::UInt {
            min: 0,
            max: 10,
            step: 1,
            valid_values: Some(vec![0, 1]),
            valid_value_ranges: None,
        };
        accessory.services[3].characteristics.push(custom);
        assert_eq!(validate(&[accessory], true), Err(Error::InvalidData));
    }

    #[test]
    fn configuration_flag_is_protocol_information_only() {
        let mut accessory = test_accessory();
        accessory.services[3].supports_configuration = true;
        assert_eq!(validate(&[accessory], true), Err(Error::InvalidData));
    }
}
