// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Characteristics: a single typed, addressable value with property flags,
//! per-format constraints, and user callbacks.

use std::fmt::{self, Debug, Formatter};

use bitflags::bitflags;
use uuid::Uuid;

use crate::session::TransportType;
use crate::{Error, Result};

/// The value format of a characteristic. Every consumer of a characteristic
/// (permission gates, the JSON serializer, the BLE signature reader)
/// branches on this tag explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Data,
    Bool,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int32,
    Float32,
    String,
    Tlv8,
}

impl Format {
    /// The format name used in IP JSON bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Data => "data",
            Format::Bool => "bool",
            Format::UInt8 => "uint8",
            Format::UInt16 => "uint16",
            Format::UInt32 => "uint32",
            Format::UInt64 => "uint64",
            Format::Int32 => "int",
            Format::Float32 => "float",
            Format::String => "string",
            Format::Tlv8 => "tlv8",
        }
    }

    /// The Bluetooth SIG format code used in BLE signature reads. Data and
    /// TLV8 share the opaque-structure code.
    pub fn ble_code(&self) -> u8 {
        match self {
            Format::Bool => 0x01,
            Format::UInt8 => 0x04,
            Format::UInt16 => 0x06,
            Format::UInt32 => 0x08,
            Format::UInt64 => 0x0a,
            Format::Int32 => 0x10,
            Format::Float32 => 0x14,
            Format::String => 0x19,
            Format::Data | Format::Tlv8 => 0x1b,
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            Format::UInt8 | Format::UInt16 | Format::UInt32 | Format::UInt64 | Format::Int32
        )
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integral() || *self == Format::Float32
    }
}

/// The unit of a numeric characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unit {
    #[default]
    None,
    Celsius,
    ArcDegrees,
    Percentage,
    Lux,
    Seconds,
}

impl Unit {
    /// The unit name used in IP JSON bodies, `None` for unitless.
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Unit::None => None,
            Unit::Celsius => Some("celsius"),
            Unit::ArcDegrees => Some("arcdegrees"),
            Unit::Percentage => Some("percentage"),
            Unit::Lux => Some("lux"),
            Unit::Seconds => Some("seconds"),
        }
    }

    /// The Bluetooth SIG unit code used in BLE signature reads.
    pub fn ble_code(&self) -> u16 {
        match self {
            Unit::None => 0x2700,
            Unit::Celsius => 0x272f,
            Unit::ArcDegrees => 0x2763,
            Unit::Percentage => 0x27ad,
            Unit::Lux => 0x2731,
            Unit::Seconds => 0x2703,
        }
    }
}

bitflags! {
    /// A set of properties that indicate what operations a characteristic
    /// supports and which policy gates apply to them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Properties: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const SUPPORTS_EVENTS = 1 << 2;
        const HIDDEN = 1 << 3;
        const READ_REQUIRES_ADMIN = 1 << 4;
        const WRITE_REQUIRES_ADMIN = 1 << 5;
        /// Deprecated combined admin flag; honored as the union of the two
        /// split flags above.
        const REQUIRES_ADMIN = 1 << 6;
        const REQUIRES_TIMED_WRITE = 1 << 7;
        const SUPPORTS_AUTHORIZATION_DATA = 1 << 8;
        /// IP: reads during whole-graph enumeration return null without
        /// invoking the handler.
        const IP_CONTROL_POINT = 1 << 9;
        /// IP: a successful write is immediately followed by a read whose
        /// value is carried in the write response.
        const IP_SUPPORTS_WRITE_RESPONSE = 1 << 10;
        const BLE_SUPPORTS_BROADCAST_NOTIFICATION = 1 << 11;
        const BLE_SUPPORTS_DISCONNECTED_NOTIFICATION = 1 << 12;
        const BLE_READABLE_WITHOUT_SECURITY = 1 << 13;
        const BLE_WRITABLE_WITHOUT_SECURITY = 1 << 14;
    }
}

impl Default for Properties {
    fn default() -> Self {
        Properties::empty()
    }
}

impl Properties {
    pub fn read_requires_admin(&self) -> bool {
        self.intersects(Properties::READ_REQUIRES_ADMIN | Properties::REQUIRES_ADMIN)
    }

    pub fn write_requires_admin(&self) -> bool {
        self.intersects(Properties::WRITE_REQUIRES_ADMIN | Properties::REQUIRES_ADMIN)
    }
}

/// Per-format value constraints.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraints {
    /// Bool and TLV8 carry no constraints.
    None,
    /// Unsigned integral formats.
    UInt {
        min: u64,
        max: u64,
        step: u64,
        valid_values: Option<Vec<u64>>,
        valid_value_ranges: Option<Vec<(u64, u64)>>,
    },
    /// Signed 32-bit integers.
    Int {
        min: i32,
        max: i32,
        step: i32,
        valid_values: Option<Vec<i32>>,
        valid_value_ranges: Option<Vec<(i32, i32)>>,
    },
    Float {
        min: f32,
        max: f32,
        step: f32,
    },
    String {
        max_length: u16,
    },
    Data {
        max_length: u32,
    },
}

impl Constraints {
    /// The loosest constraints for a format, used when a characteristic
    /// has nothing tighter to declare.
    pub fn default_for(format: Format) -> Constraints {
        match format {
            Format::Bool | Format::Tlv8 => Constraints::None,
            Format::UInt8 => Constraints::unsigned(0, u8::MAX as u64),
            Format::UInt16 => Constraints::unsigned(0, u16::MAX as u64),
            Format::UInt32 => Constraints::unsigned(0, u32::MAX as u64),
            Format::UInt64 => Constraints::unsigned(0, u64::MAX),
            Format::Int32 => Constraints::Int {
                min: i32::MIN,
                max: i32::MAX,
                step: 1,
                valid_values: None,
                valid_value_ranges: None,
            },
            Format::Float32 => Constraints::Float {
                min: f32::NEG_INFINITY,
                max: f32::INFINITY,
                step: 0.0,
            },
            Format::String => Constraints::String { max_length: 64 },
            Format::Data => Constraints::Data {
                max_length: 2_097_152,
            },
        }
    }

    pub fn unsigned(min: u64, max: u64) -> Constraints {
        Constraints::UInt {
            min,
            max,
            step: 1,
            valid_values: None,
            valid_value_ranges: None,
        }
    }
}

/// A typed characteristic value.
#[derive(Debug, Clone, PartialEq)]
pub enum HapValue {
    /// Emitted for suppressed reads (control points, event-only
    /// characteristics); never a stored value.
    Null,
    Bool(bool),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Float32(f32),
    String(String),
    Data(Vec<u8>),
    Tlv8(Vec<u8>),
}

impl HapValue {
    pub fn format(&self) -> Option<Format> {
        match self {
            HapValue::Null => None,
            HapValue::Bool(_) => Some(Format::Bool),
            HapValue::UInt8(_) => Some(Format::UInt8),
            HapValue::UInt16(_) => Some(Format::UInt16),
            HapValue::UInt32(_) => Some(Format::UInt32),
            HapValue::UInt64(_) => Some(Format::UInt64),
            HapValue::Int32(_) => Some(Format::Int32),
            HapValue::Float32(_) => Some(Format::Float32),
            HapValue::String(_) => Some(Format::String),
            HapValue::Data(_) => Some(Format::Data),
            HapValue::Tlv8(_) => Some(Format::Tlv8),
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match *self {
            HapValue::UInt8(v) => Some(v as u64),
            HapValue::UInt16(v) => Some(v as u64),
            HapValue::UInt32(v) => Some(v as u64),
            HapValue::UInt64(v) => Some(v),
            _ => None,
        }
    }
}

/// Context passed to read callbacks.
pub struct ReadContext<'a> {
    pub accessory: &'a crate::accessory::Accessory,
    pub iid: u64,
    pub transport: TransportType,
}

/// Context passed to write callbacks.
pub struct WriteContext<'a> {
    pub accessory: &'a crate::accessory::Accessory,
    pub iid: u64,
    pub transport: TransportType,
    /// Authorization blob supplied by the controller; the callback is
    /// responsible for validating it when the characteristic requires it.
    pub authorization_data: Option<&'a [u8]>,
    /// Whether the write arrived through a completed timed-write window.
    pub timed: bool,
}

/// Context passed to subscribe/unsubscribe callbacks.
pub struct SubscriptionContext {
    pub aid: u64,
    pub iid: u64,
    pub transport: TransportType,
}

pub type ReadCallback = Box<dyn Fn(&ReadContext<'_>) -> Result<HapValue>>;
pub type WriteCallback = Box<dyn Fn(&WriteContext<'_>, &HapValue) -> Result<()>>;
pub type SubscriptionCallback = Box<dyn Fn(&SubscriptionContext)>;

/// The user callback set of a characteristic. Presence is constrained by
/// the property flags and checked at server start. Callbacks run on the
/// server thread and must not block.
#[derive(Default)]
pub struct Callbacks {
    pub read: Option<ReadCallback>,
    pub write: Option<WriteCallback>,
    pub subscribe: Option<SubscriptionCallback>,
    pub unsubscribe: Option<SubscriptionCallback>,
}

impl Debug for Callbacks {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("subscribe", &self.subscribe.is_some())
            .field("unsubscribe", &self.unsubscribe.is_some())
            .finish()
    }
}

/// A single typed, addressable value exposed by a service.
#[derive(Debug)]
pub struct Characteristic {
    /// Instance id; unique among all service and characteristic ids of the
    /// owning accessory and stable across firmware updates.
    pub iid: u64,
    pub char_type: Uuid,
    pub debug_description: &'static str,
    pub manufacturer_description: Option<String>,
    pub properties: Properties,
    pub unit: Unit,
    pub format: Format,
    pub constraints: Constraints,
    pub callbacks: Callbacks,
}

impl Characteristic {
    pub fn new(iid: u64, char_type: Uuid, format: Format, debug_description: &'static str) -> Self {
        Characteristic {
            iid,
            char_type,
            debug_description,
            manufacturer_description: None,
            properties: Properties::empty(),
            unit: Unit::None,
            format,
            constraints: Constraints::default_for(format),
            callbacks: Callbacks::default(),
        }
    }

    /// Validates a value a controller wants written: the format must match
    /// and the value must satisfy the declared constraints. Violations are
    /// `InvalidData`.
    pub fn validate_value(&self, value: &HapValue) -> Result<()> {
        if value.format() != Some(self.format) {
            return Err(Error::InvalidData);
        }
        match (&self.constraints, value) {
            (Constraints::None, _) => Ok(()),
            (
                Constraints::UInt {
                    min,
                    max,
                    step,
                    valid_values,
                    valid_value_ranges,
                },
                v,
            ) => {
                let v = v.as_unsigned().ok_or(Error::InvalidData)?;
                if v < *min || v > *max {
                    return Err(Error::InvalidData);
                }
                if *step > 1 && (v - *min) % *step != 0 {
                    return Err(Error::InvalidData);
                }
                if let Some(values) = valid_values {
                    if !values.contains(&v) {
                        return Err(Error::InvalidData);
                    }
                }
                if let Some(ranges) = valid_value_ranges {
                    if !ranges.iter().any(|(start, end)| v >= *start && v <= *end) {
                        return Err(Error::InvalidData);
                    }
                }
                Ok(())
            }
            (
                Constraints::Int {
                    min,
                    max,
                    step,
                    valid_values,
                    valid_value_ranges,
                },
                HapValue::Int32(v),
            ) => {
                if v < min || v > max {
                    return Err(Error::InvalidData);
                }
                if *step > 1 && (*v as i64 - *min as i64) % *step as i64 != 0 {
                    return Err(Error::InvalidData);
                }
                if let Some(values) = valid_values {
                    if !values.contains(v) {
                        return Err(Error::InvalidData);
                    }
                }
                if let Some(ranges) = valid_value_ranges {
                    if !ranges.iter().any(|(start, end)| v >= start && v <= end) {
                        return Err(Error::InvalidData);
                    }
                }
                Ok(())
            }
            (Constraints::Float { min, max, .. }, HapValue::Float32(v)) => {
                if v.is_nan() || *v < *min || *v > *max {
                    return Err(Error::InvalidData);
                }
                Ok(())
            }
            (Constraints::String { max_length }, HapValue::String(s)) => {
                if s.len() > *max_length as usize {
                    return Err(Error::InvalidData);
                }
                Ok(())
            }
            (Constraints::Data { max_length }, HapValue::Data(d)) => {
                if d.len() > *max_length as usize {
                    return Err(Error::InvalidData);
                }
                Ok(())
            }
            _ => Err(Error::InvalidData),
        }
    }
}

/// Apple-defined characteristic types used by the standard services.
pub mod types {
    use crate::hapuuid::uuid_from_u16;
    use uuid::Uuid;

    pub const IDENTIFY: Uuid = uuid_from_u16(0x14);
    pub const MANUFACTURER: Uuid = uuid_from_u16(0x20);
    pub const MODEL: Uuid = uuid_from_u16(0x21);
    pub const NAME: Uuid = uuid_from_u16(0x23);
    pub const SERIAL_NUMBER: Uuid = uuid_from_u16(0x30);
    pub const FIRMWARE_REVISION: Uuid = uuid_from_u16(0x52);
    pub const HARDWARE_REVISION: Uuid = uuid_from_u16(0x53);
    pub const VERSION: Uuid = uuid_from_u16(0x37);
    pub const PAIR_SETUP: Uuid = uuid_from_u16(0x4c);
    pub const PAIR_VERIFY: Uuid = uuid_from_u16(0x4e);
    pub const PAIRING_FEATURES: Uuid = uuid_from_u16(0x4f);
    pub const PAIRING_PAIRINGS: Uuid = uuid_from_u16(0x50);
    pub const SERVICE_SIGNATURE: Uuid = uuid_from_u16(0xa5);
    pub const PROGRAMMABLE_SWITCH_EVENT: Uuid = uuid_from_u16(0x73);
    pub const ON: Uuid = uuid_from_u16(0x25);
    pub const BRIGHTNESS: Uuid = uuid_from_u16(0x08);
}
