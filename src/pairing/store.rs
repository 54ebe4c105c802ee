// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Persistence: pairing records, the device identity, and the replay
//! counters, all as small opaque blobs in the platform key-value store.

use log::{debug, info};

use crate::crypto::Ed25519SecretKey;
use crate::pairing::{ControllerId, Pairing, MAX_CONTROLLER_ID_BYTES};
use crate::platform::{Domain, KeyValueStore, Rng};
use crate::{Error, Result};

pub const DOMAIN_DEVICE: Domain = Domain(0x40);
pub const DOMAIN_PAIRINGS: Domain = Domain(0x50);

pub const KEY_DEVICE_ID: u8 = 0x00;
pub const KEY_LTSK: u8 = 0x01;
pub const KEY_CONFIG_NUMBER: u8 = 0x02;
pub const KEY_GSN: u8 = 0x03;
pub const KEY_BROADCAST_KEY: u8 = 0x04;
pub const KEY_SETUP_ATTEMPTS: u8 = 0x05;
pub const KEY_HAS_CONFIGURED: u8 = 0x06;

/// Serialized pairing record: identifier length, identifier padded to 36
/// bytes, public key, permission byte.
const PAIRING_RECORD_BYTES: usize = 1 + MAX_CONTROLLER_ID_BYTES + 32 + 1;

/// The 6-byte device identifier and Ed25519 long-term secret, generated
/// on first start and immutable thereafter.
pub struct DeviceIdentity {
    pub device_id: [u8; 6],
    pub ltsk: Ed25519SecretKey,
}

impl DeviceIdentity {
    pub fn load_or_create(kv: &mut dyn KeyValueStore, rng: &mut dyn Rng) -> Result<Self> {
        let device_id = match kv.get(DOMAIN_DEVICE, KEY_DEVICE_ID)? {
            Some(bytes) if bytes.len() == 6 => bytes.try_into().unwrap(),
            Some(_) => return Err(Error::Unknown),
            None => {
                let mut id = [0u8; 6];
                rng.fill(&mut id);
                kv.set(DOMAIN_DEVICE, KEY_DEVICE_ID, &id)?;
                info!("Generated device id {}.", format_device_id(&id));
                id
            }
        };
        let ltsk = match kv.get(DOMAIN_DEVICE, KEY_LTSK)? {
            Some(bytes) if bytes.len() == 32 => Ed25519SecretKey(bytes.try_into().unwrap()),
            Some(_) => return Err(Error::Unknown),
            None => {
                let mut secret = [0u8; 32];
                rng.fill(&mut secret);
                kv.set(DOMAIN_DEVICE, KEY_LTSK, &secret)?;
                Ed25519SecretKey(secret)
            }
        };
        Ok(DeviceIdentity { device_id, ltsk })
    }

    /// The colon-separated textual form advertised in the `id` TXT record
    /// and used as the accessory's pairing identity.
    pub fn id_string(&self) -> String {
        format_device_id(&self.device_id)
    }
}

pub fn format_device_id(id: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        id[0], id[1], id[2], id[3], id[4], id[5]
    )
}

/// Slot-indexed pairing records in the key-value store.
pub struct PairingStore {
    max_pairings: usize,
}

impl PairingStore {
    pub fn new(max_pairings: usize) -> Self {
        PairingStore { max_pairings }
    }

    pub fn max_pairings(&self) -> usize {
        self.max_pairings
    }

    fn load_slot(&self, kv: &dyn KeyValueStore, slot: u8) -> Result<Option<Pairing>> {
        let bytes = match kv.get(DOMAIN_PAIRINGS, slot)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        if bytes.len() != PAIRING_RECORD_BYTES {
            return Err(Error::Unknown);
        }
        let id_len = bytes[0] as usize;
        if id_len == 0 || id_len > MAX_CONTROLLER_ID_BYTES {
            return Err(Error::Unknown);
        }
        let id = ControllerId::try_from(&bytes[1..1 + id_len])?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&bytes[1 + MAX_CONTROLLER_ID_BYTES..1 + MAX_CONTROLLER_ID_BYTES + 32]);
        let permissions = bytes[PAIRING_RECORD_BYTES - 1];
        Ok(Some(Pairing {
            id,
            public_key,
            permissions,
        }))
    }

    fn store_slot(&self, kv: &mut dyn KeyValueStore, slot: u8, pairing: &Pairing) -> Result<()> {
        let mut bytes = [0u8; PAIRING_RECORD_BYTES];
        let id = pairing.id.as_bytes();
        bytes[0] = id.len() as u8;
        bytes[1..1 + id.len()].copy_from_slice(id);
        bytes[1 + MAX_CONTROLLER_ID_BYTES..1 + MAX_CONTROLLER_ID_BYTES + 32]
            .copy_from_slice(&pairing.public_key);
        bytes[PAIRING_RECORD_BYTES - 1] = pairing.permissions;
        kv.set(DOMAIN_PAIRINGS, slot, &bytes)
    }

    /// Finds the record for a controller, with its slot.
    pub fn find(
        &self,
        kv: &dyn KeyValueStore,
        id: &ControllerId,
    ) -> Result<Option<(u8, Pairing)>> {
        for slot in 0..self.max_pairings as u8 {
            if let Some(pairing) = self.load_slot(kv, slot)? {
                if pairing.id == *id {
                    return Ok(Some((slot, pairing)));
                }
            }
        }
        Ok(None)
    }

    /// Inserts or overwrites the record for `pairing.id`. A new controller
    /// takes the first free slot; exhaustion is `OutOfResources`.
    pub fn insert(&self, kv: &mut dyn KeyValueStore, pairing: &Pairing) -> Result<u8> {
        if let Some((slot, _)) = self.find(kv, &pairing.id)? {
            self.store_slot(kv, slot, pairing)?;
            return Ok(slot);
        }
        for slot in 0..self.max_pairings as u8 {
            if self.load_slot(kv, slot)?.is_none() {
                self.store_slot(kv, slot, pairing)?;
                debug!("Stored pairing {:?} in slot {}.", pairing.id, slot);
                return Ok(slot);
            }
        }
        Err(Error::OutOfResources)
    }

    pub fn remove(&self, kv: &mut dyn KeyValueStore, id: &ControllerId) -> Result<bool> {
        match self.find(kv, id)? {
            Some((slot, _)) => {
                kv.remove(DOMAIN_PAIRINGS, slot)?;
                debug!("Removed pairing {:?} from slot {}.", id, slot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All records in slot order.
    pub fn list(&self, kv: &dyn KeyValueStore) -> Result<Vec<Pairing>> {
        let mut pairings = Vec::new();
        for slot in 0..self.max_pairings as u8 {
            if let Some(pairing) = self.load_slot(kv, slot)? {
                pairings.push(pairing);
            }
        }
        Ok(pairings)
    }

    pub fn count(&self, kv: &dyn KeyValueStore) -> Result<usize> {
        Ok(self.list(kv)?.len())
    }

    pub fn has_admin(&self, kv: &dyn KeyValueStore) -> Result<bool> {
        Ok(self.list(kv)?.iter().any(|p| p.is_admin()))
    }

    /// Whether the accessory is paired at all; drives the `sf` status flag
    /// and the BLE advertisement.
    pub fn is_paired(&self, kv: &dyn KeyValueStore) -> Result<bool> {
        self.has_admin(kv)
    }

    pub fn purge(&self, kv: &mut dyn KeyValueStore) -> Result<()> {
        kv.purge_domain(DOMAIN_PAIRINGS)
    }
}

/// The persisted global state number: two little-endian value bytes and a
/// wrap epoch byte.
pub fn load_gsn(kv: &dyn KeyValueStore) -> Result<(u16, u8)> {
    match kv.get(DOMAIN_DEVICE, KEY_GSN)? {
        Some(bytes) if bytes.len() == 3 => {
            Ok((u16::from_le_bytes([bytes[0], bytes[1]]), bytes[2]))
        }
        Some(_) => Err(Error::Unknown),
        None => Ok((1, 0)),
    }
}

pub fn store_gsn(kv: &mut dyn KeyValueStore, gsn: u16, epoch: u8) -> Result<()> {
    let bytes = [gsn.to_le_bytes()[0], gsn.to_le_bytes()[1], epoch];
    kv.set(DOMAIN_DEVICE, KEY_GSN, &bytes)
}

/// Increments the GSN, wrapping from 65535 back to 1 and bumping the
/// epoch. Returns the new value.
pub fn increment_gsn(kv: &mut dyn KeyValueStore) -> Result<u16> {
    let (gsn, epoch) = load_gsn(kv)?;
    let (next, epoch) = if gsn == u16::MAX {
        (1, epoch.wrapping_add(1))
    } else {
        (gsn + 1, epoch)
    };
    store_gsn(kv, next, epoch)?;
    Ok(next)
}

/// The configuration number advertised as `c#`, in 1..=65535.
pub fn load_config_number(kv: &dyn KeyValueStore) -> Result<u32> {
    match kv.get(DOMAIN_DEVICE, KEY_CONFIG_NUMBER)? {
        Some(bytes) if bytes.len() == 4 => {
            Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        Some(_) => Err(Error::Unknown),
        None => Ok(1),
    }
}

pub fn increment_config_number(kv: &mut dyn KeyValueStore) -> Result<u32> {
    let current = load_config_number(kv)?;
    let next = if current >= 65535 { 1 } else { current + 1 };
    kv.set(DOMAIN_DEVICE, KEY_CONFIG_NUMBER, &next.to_le_bytes())?;
    Ok(next)
}

/// Lifetime count of failed pair-setup authentication attempts.
pub fn load_setup_attempts(kv: &dyn KeyValueStore) -> Result<u8> {
    match kv.get(DOMAIN_DEVICE, KEY_SETUP_ATTEMPTS)? {
        Some(bytes) if bytes.len() == 1 => Ok(bytes[0]),
        Some(_) => Err(Error::Unknown),
        None => Ok(0),
    }
}

pub fn store_setup_attempts(kv: &mut dyn KeyValueStore, attempts: u8) -> Result<()> {
    kv.set(DOMAIN_DEVICE, KEY_SETUP_ATTEMPTS, &[attempts])
}
