//! Utilities for dealing with HAP type UUIDs, converting to and from the
//! short forms reserved for Apple-defined types.

use uuid::Uuid;

const HAP_BASE_UUID: u128 = 0x00000000_0000_1000_8000_0026bb765291;
const HAP_BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;

/// Convert a 32-bit HAP short UUID to a full 128-bit UUID by filling in the
/// Apple base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(HAP_BASE_UUID | ((short as u128) << 96))
}

/// Convert a 16-bit HAP short UUID to a full 128-bit UUID by filling in the
/// Apple base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// An extension trait for `Uuid` which provides HAP-specific methods.
pub trait HapUuid {
    /// If the UUID is an Apple-defined HAP type then return its short form,
    /// otherwise return `None`.
    fn to_hap_u32(&self) -> Option<u32>;

    /// Whether the UUID lies in the Apple-defined range. Only these types
    /// may carry valid-values and valid-value-range constraints.
    fn is_apple_defined(&self) -> bool;

    /// The textual form used on the wire: short types render as the bare
    /// hex value with leading zeros stripped, vendor types as the full
    /// hyphenated UUID.
    fn to_hap_string(&self) -> String;

    /// The 16 bytes of the UUID in HAP wire order, which is the reverse of
    /// the textual byte order.
    fn to_hap_bytes(&self) -> [u8; 16];
}

impl HapUuid for Uuid {
    fn to_hap_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & HAP_BASE_MASK == HAP_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn is_apple_defined(&self) -> bool {
        self.to_hap_u32().is_some()
    }

    fn to_hap_string(&self) -> String {
        if let Some(short) = self.to_hap_u32() {
            format!("{:X}", short)
        } else {
            self.to_string().to_uppercase()
        }
    }

    fn to_hap_bytes(&self) -> [u8; 16] {
        let mut bytes = *self.as_bytes();
        bytes.reverse();
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_from_u16_test() {
        assert_eq!(
            uuid_from_u16(0x0043),
            Uuid::parse_str("00000043-0000-1000-8000-0026bb765291").unwrap()
        );
    }

    #[test]
    fn uuid_from_u32_test() {
        assert_eq!(
            uuid_from_u32(0x11223344),
            Uuid::parse_str("11223344-0000-1000-8000-0026bb765291").unwrap()
        );
    }

    #[test]
    fn uuid_to_from_u32_success() {
        let uuid = Uuid::parse_str("000000ce-0000-1000-8000-0026bb765291").unwrap();
        assert_eq!(uuid_from_u32(uuid.to_hap_u32().unwrap()), uuid);
        assert!(uuid.is_apple_defined());
    }

    #[test]
    fn uuid_to_u32_fail() {
        assert_eq!(
            Uuid::parse_str("12345678-9000-1000-8000-0026bb765291")
                .unwrap()
                .to_hap_u32(),
            None
        );
        // The Bluetooth base is not the Apple base.
        assert_eq!(
            Uuid::parse_str("00000043-0000-1000-8000-00805f9b34fb")
                .unwrap()
                .to_hap_u32(),
            None
        );
    }

    #[test]
    fn to_hap_string_short() {
        assert_eq!(uuid_from_u16(0x0025).to_hap_string(), "25");
        assert_eq!(uuid_from_u16(0x00ce).to_hap_string(), "CE");
        assert_eq!(uuid_from_u32(0x11223344).to_hap_string(), "11223344");
    }

    #[test]
    fn to_hap_string_long() {
        let uuid = Uuid::parse_str("34ab8811-ac7f-4340-bac3-fd6a85f9943b").unwrap();
        assert_eq!(
            uuid.to_hap_string(),
            "34AB8811-AC7F-4340-BAC3-FD6A85F9943B"
        );
    }

    #[test]
    fn wire_bytes_are_reversed() {
        let uuid = uuid_from_u16(0x0043);
        let bytes = uuid.to_hap_bytes();
        assert_eq!(bytes[0], 0x91);
        assert_eq!(bytes[1], 0x52);
        assert_eq!(bytes[15], 0x00);
        assert_eq!(bytes[12], 0x43);
    }
}
