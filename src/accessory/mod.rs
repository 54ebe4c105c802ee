// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The attribute database: accessories grouping services grouping
//! characteristics. The database is immutable once the server starts;
//! validation runs exactly once at start and is fatal on failure.

mod standard;
mod validation;

pub use standard::{
    accessory_information_service, pairing_service, protocol_information_service,
    service_signature_characteristic,
};
pub use validation::validate;

use uuid::Uuid;

use crate::characteristic::Characteristic;
use crate::session::TransportType;
use crate::Result;

/// The accessory category advertised to controllers. The value is carried
/// in the `ci` TXT record and the BLE advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Category {
    Other = 1,
    Bridges = 2,
    Fans = 3,
    GarageDoorOpeners = 4,
    Lighting = 5,
    Locks = 6,
    Outlets = 7,
    Switches = 8,
    Thermostats = 9,
    Sensors = 10,
    SecuritySystems = 11,
    Doors = 12,
    Windows = 13,
    WindowCoverings = 14,
    ProgrammableSwitches = 15,
    RangeExtenders = 16,
    IpCameras = 17,
}

pub type IdentifyCallback = Box<dyn Fn() -> Result<()>>;

/// A service: an ordered group of characteristics under a type tag.
pub struct Service {
    /// Instance id; non-zero, unique among all service and characteristic
    /// ids of the owning accessory, and at most `u16::MAX` when the BLE
    /// transport is enabled.
    pub iid: u64,
    pub service_type: Uuid,
    pub debug_description: &'static str,
    pub name: Option<String>,
    pub primary: bool,
    pub hidden: bool,
    /// Only permitted on the protocol information service.
    pub supports_configuration: bool,
    pub linked_services: Vec<u64>,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(iid: u64, service_type: Uuid, debug_description: &'static str) -> Self {
        Service {
            iid,
            service_type,
            debug_description,
            name: None,
            primary: false,
            hidden: false,
            supports_configuration: false,
            linked_services: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    /// Whether the service is exposed on the given transport. Pairing over
    /// IP happens on dedicated endpoints, so the pairing service only
    /// appears on BLE.
    pub fn supported_on(&self, transport: TransportType) -> bool {
        match transport {
            TransportType::Ip => self.service_type != service_types::PAIRING,
            TransportType::Ble => true,
        }
    }
}

/// A physical or bridged accessory with its service list and identify
/// routine.
pub struct Accessory {
    /// 1 for the primary accessory; anything unique and stable except 1
    /// for bridged accessories.
    pub aid: u64,
    pub category: Category,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub hardware_version: Option<String>,
    pub services: Vec<Service>,
    pub identify: Option<IdentifyCallback>,
}

impl Accessory {
    pub fn service(&self, iid: u64) -> Option<&Service> {
        self.services.iter().find(|s| s.iid == iid)
    }

    pub fn service_of_type(&self, service_type: Uuid) -> Option<&Service> {
        self.services.iter().find(|s| s.service_type == service_type)
    }
}

/// A borrowed view over the accessory list with identity lookups. The
/// server pins one of these for its whole lifetime.
#[derive(Clone, Copy)]
pub struct Database<'a> {
    pub accessories: &'a [Accessory],
}

impl<'a> Database<'a> {
    pub fn new(accessories: &'a [Accessory]) -> Self {
        Database { accessories }
    }

    pub fn primary(&self) -> &'a Accessory {
        // Validation guarantees the primary accessory leads the list.
        &self.accessories[0]
    }

    pub fn accessory(&self, aid: u64) -> Option<&'a Accessory> {
        self.accessories.iter().find(|a| a.aid == aid)
    }

    /// Looks up a characteristic by `(aid, iid)` together with its owning
    /// service and accessory.
    pub fn characteristic(
        &self,
        aid: u64,
        iid: u64,
    ) -> Option<(&'a Accessory, &'a Service, &'a Characteristic)> {
        let accessory = self.accessory(aid)?;
        for service in &accessory.services {
            if let Some(characteristic) = service.characteristics.iter().find(|c| c.iid == iid) {
                return Some((accessory, service, characteristic));
            }
        }
        None
    }

    /// Looks up a service by `(aid, iid)`.
    pub fn service(&self, aid: u64, iid: u64) -> Option<(&'a Accessory, &'a Service)> {
        let accessory = self.accessory(aid)?;
        accessory.service(iid).map(|s| (accessory, s))
    }

    /// Iterates every characteristic in database order.
    pub fn iter_characteristics(
        &self,
    ) -> impl Iterator<Item = (&'a Accessory, &'a Service, &'a Characteristic)> + '_ {
        self.accessories.iter().flat_map(|accessory| {
            accessory.services.iter().flat_map(move |service| {
                service
                    .characteristics
                    .iter()
                    .map(move |characteristic| (accessory, service, characteristic))
            })
        })
    }
}

/// Apple-defined service types.
pub mod service_types {
    use crate::hapuuid::uuid_from_u16;
    use uuid::Uuid;

    pub const ACCESSORY_INFORMATION: Uuid = uuid_from_u16(0x3e);
    pub const GARAGE_DOOR_OPENER: Uuid = uuid_from_u16(0x41);
    pub const LIGHT_BULB: Uuid = uuid_from_u16(0x43);
    pub const LOCK_MECHANISM: Uuid = uuid_from_u16(0x45);
    pub const OUTLET: Uuid = uuid_from_u16(0x47);
    pub const SWITCH: Uuid = uuid_from_u16(0x49);
    pub const THERMOSTAT: Uuid = uuid_from_u16(0x4a);
    pub const PAIRING: Uuid = uuid_from_u16(0x55);
    pub const STATELESS_PROGRAMMABLE_SWITCH: Uuid = uuid_from_u16(0x89);
    pub const PROTOCOL_INFORMATION: Uuid = uuid_from_u16(0xa2);
}
