// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Per-controller sessions: directional transport keys with their nonce
//! counters, subscription state, and transient protocol bookkeeping.
//! Sessions live in a pool sized at construction and are addressed by
//! index handles; a stale handle fails lookup instead of aliasing a new
//! session.

use std::collections::BTreeSet;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, AEAD_KEY_BYTES};
use crate::pairing::ControllerId;
use crate::{Error, Result};

/// Which transport carries the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Ip,
    Ble,
}

/// Largest plaintext carried by one secured IP frame.
pub const MAX_FRAME_BYTES: usize = 1024;

/// The directional key material installed by Pair-Verify, plus the
/// verified controller it is bound to.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecuredChannel {
    #[zeroize(skip)]
    pub controller: ControllerId,
    pub controller_is_admin: bool,
    /// Accessory-to-controller key ("read" in key-derivation terms).
    encrypt_key: [u8; AEAD_KEY_BYTES],
    /// Controller-to-accessory key ("write" in key-derivation terms).
    decrypt_key: [u8; AEAD_KEY_BYTES],
    encrypt_count: u64,
    decrypt_count: u64,
}

impl SecuredChannel {
    pub fn new(
        controller: ControllerId,
        controller_is_admin: bool,
        encrypt_key: [u8; AEAD_KEY_BYTES],
        decrypt_key: [u8; AEAD_KEY_BYTES],
    ) -> Self {
        SecuredChannel {
            controller,
            controller_is_admin,
            encrypt_key,
            decrypt_key,
            encrypt_count: 0,
            decrypt_count: 0,
        }
    }

    /// Seals one outbound message, consuming the next outbound nonce.
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let nonce = crypto::nonce_from_counter(self.encrypt_count);
        self.encrypt_count += 1;
        crypto::aead_seal(&self.encrypt_key, &nonce, aad, plaintext)
    }

    /// Opens one inbound message, consuming the next inbound nonce. A
    /// failed open is fatal to the session; the caller invalidates it.
    pub fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = crypto::nonce_from_counter(self.decrypt_count);
        self.decrypt_count += 1;
        crypto::aead_open(&self.decrypt_key, &nonce, aad, ciphertext)
    }

    /// Wraps plaintext into secured IP frames: 2-byte little-endian
    /// plaintext length (authenticated as AAD), ciphertext, tag. Long
    /// bodies span several frames.
    pub fn seal_frames(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(plaintext.len() + 64);
        let mut rest = plaintext;
        loop {
            let n = rest.len().min(MAX_FRAME_BYTES);
            let aad = (n as u16).to_le_bytes();
            out.extend_from_slice(&aad);
            out.extend_from_slice(&self.seal(&aad, &rest[..n]));
            rest = &rest[n..];
            if rest.is_empty() {
                break;
            }
        }
        out
    }

    /// Extracts and opens the next secured IP frame from `buf`, returning
    /// the plaintext and the number of buffer bytes consumed, or `None`
    /// when the frame is still incomplete.
    pub fn open_frame(&mut self, buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let frame_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if frame_len > MAX_FRAME_BYTES {
            return Err(Error::InvalidData);
        }
        let total = 2 + frame_len + crypto::AEAD_TAG_BYTES;
        if buf.len() < total {
            return Ok(None);
        }
        let plaintext = self.open(&buf[..2], &buf[2..total])?;
        Ok(Some((plaintext, total)))
    }
}

/// A pending timed-write window opened by a prepare request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedWrite {
    pub pid: u64,
    pub expires_ms: u64,
}

/// Per-controller runtime state.
pub struct Session {
    pub transport: TransportType,
    /// Installed by a completed Pair-Verify; `None` while the session is
    /// still plaintext.
    pub secured: Option<SecuredChannel>,
    /// Characteristics with event delivery enabled, as `(aid, iid)`.
    pub subscriptions: BTreeSet<(u64, u64)>,
    /// Raised characteristics awaiting coalesced delivery.
    pub pending_events: BTreeSet<(u64, u64)>,
    pub last_event_flush_ms: u64,
    pub timed_write: Option<TimedWrite>,
    pub last_activity_ms: u64,
}

impl Session {
    fn new(transport: TransportType, now_ms: u64) -> Self {
        Session {
            transport,
            secured: None,
            subscriptions: BTreeSet::new(),
            pending_events: BTreeSet::new(),
            last_event_flush_ms: 0,
            timed_write: None,
            last_activity_ms: now_ms,
        }
    }

    pub fn is_secured(&self) -> bool {
        self.secured.is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.secured
            .as_ref()
            .map(|s| s.controller_is_admin)
            .unwrap_or(false)
    }

    pub fn controller(&self) -> Option<&ControllerId> {
        self.secured.as_ref().map(|s| &s.controller)
    }
}

/// Pool index of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub usize);

/// Fixed-size session storage; no allocation happens per session at run
/// time beyond the session's own collections.
pub struct SessionPool {
    slots: Vec<Option<Session>>,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Self {
        SessionPool {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims a free slot, or `OutOfResources` when the pool is full.
    pub fn allocate(&mut self, transport: TransportType, now_ms: u64) -> Result<SessionHandle> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Session::new(transport, now_ms));
                return Ok(SessionHandle(i));
            }
        }
        Err(Error::OutOfResources)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.slots.get(handle.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.slots.get_mut(handle.0).and_then(|s| s.as_mut())
    }

    /// Tears the session down; key material is scrubbed by drop.
    pub fn free(&mut self, handle: SessionHandle) {
        if let Some(slot) = self.slots.get_mut(handle.0) {
            *slot = None;
        }
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| SessionHandle(i))
            .collect()
    }

    /// Sessions bound to the given controller.
    pub fn handles_for_controller(&self, controller: &ControllerId) -> Vec<SessionHandle> {
        self.handles()
            .into_iter()
            .filter(|h| self.get(*h).and_then(|s| s.controller()) == Some(controller))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key;

    fn channel_pair() -> (SecuredChannel, SecuredChannel) {
        let shared = [0x5a; 32];
        let read = derive_key(&shared, b"Control-Salt", b"Control-Read-Encryption-Key");
        let write = derive_key(&shared, b"Control-Salt", b"Control-Write-Encryption-Key");
        let accessory = SecuredChannel::new(
            ControllerId::try_from(&b"11:22:33:44:55:66"[..]).unwrap(),
            true,
            read,
            write,
        );
        // The controller end encrypts with the write key and decrypts
        // with the read key.
        let controller = SecuredChannel::new(
            ControllerId::try_from(&b"11:22:33:44:55:66"[..]).unwrap(),
            true,
            write,
            read,
        );
        (accessory, controller)
    }

    #[test]
    fn directional_keys_are_not_interchangeable() {
        let (mut accessory, mut controller) = channel_pair();

        let request = controller.seal(&[], b"GET /accessories");
        assert_eq!(accessory.open(&[], &request).unwrap(), b"GET /accessories");

        let response = accessory.seal(&[], b"HTTP/1.1 200 OK");
        assert_eq!(controller.open(&[], &response).unwrap(), b"HTTP/1.1 200 OK");

        // A frame sealed with the read key must not open with itself.
        let (mut accessory2, _) = channel_pair();
        let bogus = accessory2.seal(&[], b"swapped");
        let (mut accessory3, _) = channel_pair();
        assert!(accessory3.open(&[], &bogus).is_err());
    }

    #[test]
    fn nonces_advance_per_message() {
        let (mut accessory, mut controller) = channel_pair();
        let first = controller.seal(&[], b"one");
        let second = controller.seal(&[], b"two");
        assert_eq!(accessory.open(&[], &first).unwrap(), b"one");
        assert_eq!(accessory.open(&[], &second).unwrap(), b"two");

        // Replaying an old frame fails because the counter moved on.
        let replay = controller.seal(&[], b"three");
        assert_eq!(accessory.open(&[], &replay).unwrap(), b"three");
        assert!(accessory.open(&[], &replay).is_err());
    }

    #[test]
    fn frames_round_trip_and_split() {
        let (mut accessory, mut controller) = channel_pair();
        let body = vec![0xabu8; MAX_FRAME_BYTES + 100];
        let framed = accessory.seal_frames(&body);

        let (first, consumed) = controller.open_frame(&framed).unwrap().unwrap();
        assert_eq!(first.len(), MAX_FRAME_BYTES);
        let (second, consumed2) = controller.open_frame(&framed[consumed..]).unwrap().unwrap();
        assert_eq!(second.len(), 100);
        assert_eq!(consumed + consumed2, framed.len());
        assert_eq!([first, second].concat(), body);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let (mut accessory, mut controller) = channel_pair();
        let framed = accessory.seal_frames(b"short");
        assert_eq!(controller.open_frame(&framed[..1]).unwrap(), None);
        assert_eq!(controller.open_frame(&framed[..4]).unwrap(), None);
    }

    #[test]
    fn pool_allocates_to_capacity() {
        let mut pool = SessionPool::new(2);
        let a = pool.allocate(TransportType::Ip, 0).unwrap();
        let _b = pool.allocate(TransportType::Ip, 0).unwrap();
        assert_eq!(pool.allocate(TransportType::Ip, 0), Err(Error::OutOfResources));
        pool.free(a);
        assert!(pool.allocate(TransportType::Ip, 0).is_ok());
    }

    #[test]
    fn freed_handle_fails_lookup() {
        let mut pool = SessionPool::new(1);
        let handle = pool.allocate(TransportType::Ble, 0).unwrap();
        assert!(pool.get(handle).is_some());
        pool.free(handle);
        assert!(pool.get(handle).is_none());
    }

    #[test]
    fn subscriptions_are_idempotent() {
        let mut pool = SessionPool::new(1);
        let handle = pool.allocate(TransportType::Ip, 0).unwrap();
        let session = pool.get_mut(handle).unwrap();
        session.subscriptions.insert((1, 0x33));
        session.subscriptions.insert((1, 0x33));
        assert_eq!(session.subscriptions.len(), 1);
        session.subscriptions.remove(&(1, 0x33));
        session.subscriptions.remove(&(1, 0x33));
        assert!(session.subscriptions.is_empty());
    }
}
