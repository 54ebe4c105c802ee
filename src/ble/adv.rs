// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! BLE advertising payloads: the regular HAP advertisement and the
//! encrypted notification advertisement used for disconnected events.

use bytes::{BufMut, BytesMut};

use crate::crypto;

/// Flags AD: LE General Discoverable, BR/EDR not supported; LE Limited
/// Discoverable must stay clear.
const FLAGS_AD: [u8; 3] = [0x02, 0x01, 0x06];

/// Apple company identifier in little-endian order.
const COMPANY_ID: [u8; 2] = [0x4c, 0x00];

const TYPE_REGULAR: u8 = 0x06;
const TYPE_NOTIFICATION: u8 = 0x11;

/// Default regular advertising interval.
pub const REGULAR_INTERVAL_MS: u16 = 417;

/// Notification advertisements broadcast fast and briefly.
pub const NOTIFICATION_INTERVAL_MS: u16 = 20;

/// Minimum time the notification advertisement stays active.
pub const NOTIFICATION_DURATION_MS: u64 = 3_000;

/// Inputs of the regular advertisement body.
pub struct AdvertisementInfo {
    pub paired: bool,
    pub device_id: [u8; 6],
    pub category: u16,
    pub gsn: u16,
    pub config_number: u8,
    pub setup_hash: Option<[u8; 4]>,
}

/// Builds the regular advertisement AD structures.
pub fn regular_advertisement(info: &AdvertisementInfo) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(18);
    body.put_u8(if info.paired { 0x00 } else { 0x01 });
    body.put_slice(&info.device_id);
    body.put_u16_le(info.category);
    body.put_u16_le(info.gsn);
    body.put_u8(info.config_number);
    // Compatible version.
    body.put_u8(0x02);
    if let Some(hash) = info.setup_hash {
        body.put_slice(&hash);
    }

    let mut out = BytesMut::with_capacity(31);
    out.put_slice(&FLAGS_AD);
    // Manufacturer data: company id, type, subtype 1 plus body length.
    out.put_u8(1 + COMPANY_ID.len() as u8 + 2 + body.len() as u8);
    out.put_u8(0xff);
    out.put_slice(&COMPANY_ID);
    out.put_u8(TYPE_REGULAR);
    out.put_u8((1 << 5) | (body.len() as u8));
    out.put_slice(&body);
    out.to_vec()
}

/// Builds the Local Name AD for the scan response, shortening if needed.
pub fn scan_response(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut out = BytesMut::with_capacity(31);
    if bytes.len() <= 29 {
        out.put_u8(1 + bytes.len() as u8);
        // Complete Local Name.
        out.put_u8(0x09);
        out.put_slice(bytes);
    } else {
        let mut cut = 29;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        out.put_u8(1 + cut as u8);
        // Shortened Local Name.
        out.put_u8(0x08);
        out.put_slice(&bytes[..cut]);
    }
    out.to_vec()
}

/// Builds the encrypted notification advertisement for a disconnected
/// event: the characteristic instance id, value digest, and GSN, sealed
/// with the broadcast key.
pub fn notification_advertisement(
    device_id: &[u8; 6],
    broadcast_key: &[u8; 32],
    gsn: u16,
    iid: u16,
    value: &[u8],
) -> Vec<u8> {
    let mut plaintext = [0u8; 12];
    plaintext[..2].copy_from_slice(&gsn.to_le_bytes());
    plaintext[2..4].copy_from_slice(&iid.to_le_bytes());
    let n = value.len().min(8);
    plaintext[4..4 + n].copy_from_slice(&value[..n]);

    let nonce = crypto::nonce_from_counter(gsn as u64);
    let sealed = crypto::aead_seal(broadcast_key, &nonce, &[], &plaintext);
    // Truncated 4-byte authentication tag, as the advertisement budget
    // demands.
    let payload = &sealed[..12 + 4];

    let mut out = BytesMut::with_capacity(31);
    out.put_slice(&FLAGS_AD);
    out.put_u8(1 + COMPANY_ID.len() as u8 + 2 + 6 + payload.len() as u8);
    out.put_u8(0xff);
    out.put_slice(&COMPANY_ID);
    out.put_u8(TYPE_NOTIFICATION);
    out.put_u8((1 << 5) | (6 + payload.len() as u8));
    out.put_slice(device_id);
    out.put_slice(payload);
    out.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> AdvertisementInfo {
        AdvertisementInfo {
            paired: false,
            device_id: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66],
            category: 5,
            gsn: 3,
            config_number: 1,
            setup_hash: Some([0xaa, 0xbb, 0xcc, 0xdd]),
        }
    }

    #[test]
    fn regular_advertisement_layout() {
        let adv = regular_advertisement(&info());
        // Flags: general discoverable set, limited clear.
        assert_eq!(&adv[..3], &[0x02, 0x01, 0x06]);
        // Manufacturer AD header.
        assert_eq!(adv[4], 0xff);
        assert_eq!(&adv[5..7], &[0x4c, 0x00]);
        assert_eq!(adv[7], 0x06);
        // Subtype 1 with a 17-byte body when the setup hash is present.
        assert_eq!(adv[8], (1 << 5) | 17);
        // SF bit 0 set while unpaired.
        assert_eq!(adv[9], 0x01);
        assert_eq!(&adv[10..16], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        // ACID and GSN little-endian.
        assert_eq!(&adv[16..18], &[5, 0]);
        assert_eq!(&adv[18..20], &[3, 0]);
        assert_eq!(adv[20], 1);
        assert_eq!(adv[21], 0x02);
        assert!(adv.len() <= 31);
    }

    #[test]
    fn paired_clears_status_flag() {
        let mut i = info();
        i.paired = true;
        i.setup_hash = None;
        let adv = regular_advertisement(&i);
        assert_eq!(adv[8], (1 << 5) | 13);
        assert_eq!(adv[9], 0x00);
        assert_eq!(adv.len(), 9 + 13);
    }

    #[test]
    fn scan_response_shortens_long_names() {
        let short = scan_response("Acme Light");
        assert_eq!(short[1], 0x09);
        assert_eq!(&short[2..], b"Acme Light");

        let long = scan_response("An Exceedingly Verbose Accessory Name");
        assert_eq!(long[1], 0x08);
        assert_eq!(long.len(), 31);
    }

    #[test]
    fn notification_advertisement_is_sealed_and_bounded() {
        let key = [7u8; 32];
        let adv = notification_advertisement(
            &[1, 2, 3, 4, 5, 6],
            &key,
            9,
            0x33,
            &[0x01],
        );
        assert!(adv.len() <= 31);
        assert_eq!(adv[7], 0x11);
        // Different GSNs produce different ciphertexts.
        let other = notification_advertisement(&[1, 2, 3, 4, 5, 6], &key, 10, 0x33, &[0x01]);
        assert_ne!(adv, other);
    }
}
