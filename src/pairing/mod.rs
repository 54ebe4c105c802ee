// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Pairing: the wire vocabulary shared by Pair-Setup, Pair-Verify, and
//! pairing administration, the persistent pairing store, and the three
//! protocol engines themselves.

pub mod admin;
pub mod setup;
pub mod store;
pub mod verify;

pub use store::{
    DeviceIdentity, PairingStore, DOMAIN_DEVICE, DOMAIN_PAIRINGS, KEY_BROADCAST_KEY,
    KEY_CONFIG_NUMBER, KEY_DEVICE_ID, KEY_GSN, KEY_HAS_CONFIGURED, KEY_LTSK, KEY_SETUP_ATTEMPTS,
};

use crate::{Error, Result};

/// TLV types of the pairing protocol payloads.
pub mod tlv_types {
    pub const METHOD: u8 = 0x00;
    pub const IDENTIFIER: u8 = 0x01;
    pub const SALT: u8 = 0x02;
    pub const PUBLIC_KEY: u8 = 0x03;
    pub const PROOF: u8 = 0x04;
    pub const ENCRYPTED_DATA: u8 = 0x05;
    pub const STATE: u8 = 0x06;
    pub const ERROR: u8 = 0x07;
    pub const RETRY_DELAY: u8 = 0x08;
    pub const CERTIFICATE: u8 = 0x09;
    pub const SIGNATURE: u8 = 0x0a;
    pub const PERMISSIONS: u8 = 0x0b;
    pub const FRAGMENT_DATA: u8 = 0x0c;
    pub const FRAGMENT_LAST: u8 = 0x0d;
    pub const SESSION_ID: u8 = 0x0e;
    pub const FLAGS: u8 = 0x13;
    pub const SEPARATOR: u8 = 0xff;
}

/// Pairing protocol methods carried in the `METHOD` TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Method {
    PairSetup = 0,
    PairSetupWithAuth = 1,
    PairVerify = 2,
    AddPairing = 3,
    RemovePairing = 4,
    ListPairings = 5,
    PairResume = 6,
}

impl TryFrom<u8> for Method {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Method::PairSetup),
            1 => Ok(Method::PairSetupWithAuth),
            2 => Ok(Method::PairVerify),
            3 => Ok(Method::AddPairing),
            4 => Ok(Method::RemovePairing),
            5 => Ok(Method::ListPairings),
            6 => Ok(Method::PairResume),
            _ => Err(Error::InvalidData),
        }
    }
}

/// Error codes carried in the `ERROR` TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PairingError {
    Unknown = 1,
    Authentication = 2,
    Backoff = 3,
    MaxPeers = 4,
    MaxTries = 5,
    Unavailable = 6,
    Busy = 7,
}

/// Maximum length of a controller identifier in bytes.
pub const MAX_CONTROLLER_ID_BYTES: usize = 36;

/// A controller identifier: an opaque byte string of at most 36 bytes,
/// typically the textual form of a UUID.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControllerId {
    bytes: [u8; MAX_CONTROLLER_ID_BYTES],
    len: u8,
}

impl ControllerId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl TryFrom<&[u8]> for ControllerId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.is_empty() || value.len() > MAX_CONTROLLER_ID_BYTES {
            return Err(Error::InvalidData);
        }
        let mut bytes = [0u8; MAX_CONTROLLER_ID_BYTES];
        bytes[..value.len()].copy_from_slice(value);
        Ok(ControllerId {
            bytes,
            len: value.len() as u8,
        })
    }
}

impl std::fmt::Debug for ControllerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "ControllerId({})", s),
            Err(_) => write!(f, "ControllerId({:02x?})", self.as_bytes()),
        }
    }
}

/// Permission byte: bit 0 marks an admin controller.
pub const PERMISSION_ADMIN: u8 = 0x01;

/// One stored pairing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    pub id: ControllerId,
    pub public_key: [u8; 32],
    pub permissions: u8,
}

impl Pairing {
    pub fn is_admin(&self) -> bool {
        self.permissions & PERMISSION_ADMIN != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_id_bounds() {
        assert!(ControllerId::try_from(&b""[..]).is_err());
        assert!(ControllerId::try_from(&[0u8; 37][..]).is_err());
        let id = ControllerId::try_from(&b"4A:3B:2C:1D:0E:FF"[..]).unwrap();
        assert_eq!(id.as_bytes(), b"4A:3B:2C:1D:0E:FF");
    }

    #[test]
    fn method_round_trip() {
        assert_eq!(Method::try_from(6).unwrap(), Method::PairResume);
        assert!(Method::try_from(7).is_err());
    }

    #[test]
    fn admin_bit() {
        let id = ControllerId::try_from(&b"abc"[..]).unwrap();
        let admin = Pairing {
            id,
            public_key: [0; 32],
            permissions: PERMISSION_ADMIN,
        };
        assert!(admin.is_admin());
        let regular = Pairing {
            id,
            public_key: [0; 32],
            permissions: 0,
        };
        assert!(!regular.is_admin());
    }
}
