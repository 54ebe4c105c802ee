// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Pair-Verify: the four-message X25519 exchange that turns a stored
//! pairing into per-session transport keys, plus the Pair-Resume shortcut
//! that collapses it to two messages from a cached shared secret.

use log::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, derive_key, nonce_from_label, X25519SecretKey};
use crate::pairing::{
    tlv_types, ControllerId, DeviceIdentity, Method, PairingError, PairingStore,
};
use crate::platform::{KeyValueStore, Rng};
use crate::tlv8::{self, Reader, Tlv, TlvSlot};
use crate::{Error, Result};

/// Minimum number of resumable sessions the cache holds.
pub const RESUME_CACHE_MIN_ENTRIES: usize = 8;

/// Cached shared secrets expire after this long.
pub const RESUME_LIFETIME_MS: u64 = 24 * 60 * 60 * 1000;

pub const SESSION_ID_BYTES: usize = 8;

static_assertions::const_assert!(RESUME_CACHE_MIN_ENTRIES >= 8);

struct ResumeEntry {
    session_id: [u8; SESSION_ID_BYTES],
    shared_secret: [u8; 32],
    controller: ControllerId,
    created_ms: u64,
    last_used_ms: u64,
}

/// LRU cache of `(session id -> shared secret)` records.
#[derive(Default)]
pub struct ResumeCache {
    entries: Vec<ResumeEntry>,
}

impl ResumeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the entry for `session_id` if it exists and has not expired.
    /// Hit or miss, the entry is gone afterwards; a resumed session gets a
    /// fresh id.
    pub fn take(
        &mut self,
        session_id: &[u8],
        now_ms: u64,
    ) -> Option<([u8; 32], ControllerId)> {
        let index = self
            .entries
            .iter()
            .position(|e| e.session_id == session_id)?;
        let entry = self.entries.remove(index);
        if now_ms.saturating_sub(entry.created_ms) >= RESUME_LIFETIME_MS {
            debug!("Pair-Resume cache entry expired.");
            return None;
        }
        Some((entry.shared_secret, entry.controller))
    }

    pub fn insert(
        &mut self,
        session_id: [u8; SESSION_ID_BYTES],
        shared_secret: [u8; 32],
        controller: ControllerId,
        now_ms: u64,
    ) {
        self.entries.retain(|e| e.session_id != session_id);
        if self.entries.len() >= RESUME_CACHE_MIN_ENTRIES {
            // Evict the least recently used entry.
            if let Some(lru) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_used_ms)
                .map(|(i, _)| i)
            {
                self.entries.remove(lru);
            }
        }
        self.entries.push(ResumeEntry {
            session_id,
            shared_secret,
            controller,
            created_ms: now_ms,
            last_used_ms: now_ms,
        });
    }

    /// Drops every entry of a controller; used when its pairing is
    /// removed.
    pub fn purge_controller(&mut self, controller: &ControllerId) {
        self.entries.retain(|e| e.controller != *controller);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything Pair-Verify needs from the server per message.
pub struct VerifyContext<'a> {
    pub kv: &'a dyn KeyValueStore,
    pub rng: &'a mut dyn Rng,
    pub identity: &'a DeviceIdentity,
    pub store: &'a PairingStore,
    pub resume: &'a mut ResumeCache,
    pub now_ms: u64,
}

/// Keys produced by a completed verify or resume, ready to install on the
/// session.
pub struct InstalledKeys {
    pub controller: ControllerId,
    pub controller_is_admin: bool,
    /// Accessory-to-controller direction.
    pub encrypt_key: [u8; 32],
    /// Controller-to-accessory direction.
    pub decrypt_key: [u8; 32],
    /// The verify shared secret; the BLE transport derives broadcast keys
    /// from it.
    pub shared_secret: [u8; 32],
    /// Resume ticket handed to the controller.
    pub session_id: [u8; SESSION_ID_BYTES],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    M1Received,
    Done,
    Error,
}

/// Per-session Pair-Verify engine.
pub struct PairVerify {
    state: State,
    accessory_secret: Option<X25519SecretKey>,
    accessory_public: [u8; 32],
    controller_public: [u8; 32],
    session_key: Option<Zeroizing<[u8; 32]>>,
    shared_secret: Option<Zeroizing<[u8; 32]>>,
}

/// Result of one handled message.
pub struct VerifyResponse {
    pub body: Vec<u8>,
    /// Present when the exchange completed and transport security starts.
    pub installed: Option<InstalledKeys>,
}

impl Default for PairVerify {
    fn default() -> Self {
        Self::new()
    }
}

impl PairVerify {
    pub fn new() -> Self {
        PairVerify {
            state: State::Idle,
            accessory_secret: None,
            accessory_public: [0; 32],
            controller_public: [0; 32],
            session_key: None,
            shared_secret: None,
        }
    }

    pub fn reset(&mut self) {
        *self = PairVerify::new();
    }

    pub fn handle(&mut self, ctx: &mut VerifyContext<'_>, body: &[u8]) -> Result<VerifyResponse> {
        let mut slots = [
            TlvSlot::new(tlv_types::STATE),
            TlvSlot::new(tlv_types::METHOD),
            TlvSlot::new(tlv_types::PUBLIC_KEY),
            TlvSlot::new(tlv_types::ENCRYPTED_DATA),
            TlvSlot::new(tlv_types::SESSION_ID),
        ];
        Reader::new(body).extract(&mut slots)?;
        let [state, method, public_key, encrypted_data, session_id] = slots;

        let state = match state.value.as_deref() {
            Some([value]) => *value,
            _ => return Err(Error::InvalidData),
        };

        match state {
            0x01 => {
                let is_resume = matches!(
                    method.value.as_deref(),
                    Some([m]) if Method::try_from(*m) == Ok(Method::PairResume)
                );
                if is_resume {
                    self.handle_resume_m1(
                        ctx,
                        public_key.value.as_deref(),
                        session_id.value.as_deref(),
                        encrypted_data.value.as_deref(),
                    )
                } else {
                    self.handle_m1(ctx, public_key.value.as_deref())
                }
            }
            0x03 => self.handle_m3(ctx, encrypted_data.value.as_deref()),
            _ => {
                warn!("Pair-Verify message with unexpected state {}.", state);
                self.state = State::Error;
                Ok(self.error_response(0x02, PairingError::Unknown))
            }
        }
    }

    fn handle_m1(
        &mut self,
        ctx: &mut VerifyContext<'_>,
        controller_public: Option<&[u8]>,
    ) -> Result<VerifyResponse> {
        let controller_public: [u8; 32] = controller_public
            .ok_or(Error::InvalidData)?
            .try_into()
            .map_err(|_| Error::InvalidData)?;

        let mut secret = [0u8; 32];
        ctx.rng.fill(&mut secret);
        let accessory_secret = X25519SecretKey(secret);
        let accessory_public = accessory_secret.public_key();
        let shared = accessory_secret.shared_secret(&controller_public);
        let session_key = derive_key(
            &shared,
            b"Pair-Verify-Encrypt-Salt",
            b"Pair-Verify-Encrypt-Info",
        );

        let accessory_id = ctx.identity.id_string();
        let mut signed = Vec::with_capacity(32 + accessory_id.len() + 32);
        signed.extend_from_slice(&accessory_public);
        signed.extend_from_slice(accessory_id.as_bytes());
        signed.extend_from_slice(&controller_public);
        let signature = ctx.identity.ltsk.sign(&signed);

        let sub_tlv = tlv8::encode(&[
            Tlv::new(tlv_types::IDENTIFIER, accessory_id.into_bytes()),
            Tlv::new(tlv_types::SIGNATURE, signature.to_vec()),
        ]);
        let sealed = crypto::aead_seal(&session_key, &nonce_from_label(b"PV-Msg02"), &[], &sub_tlv);

        let body = tlv8::encode(&[
            Tlv::new(tlv_types::STATE, vec![0x02]),
            Tlv::new(tlv_types::PUBLIC_KEY, accessory_public.to_vec()),
            Tlv::new(tlv_types::ENCRYPTED_DATA, sealed),
        ]);

        self.accessory_secret = Some(accessory_secret);
        self.accessory_public = accessory_public;
        self.controller_public = controller_public;
        self.session_key = Some(Zeroizing::new(session_key));
        self.shared_secret = Some(Zeroizing::new(shared));
        self.state = State::M1Received;
        debug!("Pair-Verify M1 -> M2.");
        Ok(VerifyResponse {
            body,
            installed: None,
        })
    }

    fn handle_m3(
        &mut self,
        ctx: &mut VerifyContext<'_>,
        encrypted_data: Option<&[u8]>,
    ) -> Result<VerifyResponse> {
        if self.state != State::M1Received {
            self.state = State::Error;
            return Ok(self.error_response(0x04, PairingError::Unknown));
        }
        let encrypted_data = encrypted_data.ok_or(Error::InvalidData)?;
        let (session_key, shared_secret) =
            match (self.session_key.as_ref(), self.shared_secret.as_ref()) {
                (Some(k), Some(s)) => (k, s),
                _ => {
                    self.state = State::Error;
                    return Ok(self.error_response(0x04, PairingError::Unknown));
                }
            };

        let plaintext = match crypto::aead_open(
            session_key,
            &nonce_from_label(b"PV-Msg03"),
            &[],
            encrypted_data,
        ) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                warn!("Pair-Verify M3 decryption failed.");
                self.state = State::Error;
                return Ok(self.error_response(0x04, PairingError::Authentication));
            }
        };

        let mut slots = [
            TlvSlot::new(tlv_types::IDENTIFIER),
            TlvSlot::new(tlv_types::SIGNATURE),
        ];
        Reader::new(&plaintext).extract(&mut slots)?;
        let [identifier, signature] = slots;
        let (identifier, signature) = match (identifier.value, signature.value) {
            (Some(i), Some(s)) => (i, s),
            _ => return Err(Error::InvalidData),
        };

        let controller = ControllerId::try_from(identifier.as_slice())?;
        let pairing = match ctx.store.find(ctx.kv, &controller)? {
            Some((_, pairing)) => pairing,
            None => {
                warn!("Pair-Verify M3 from unknown controller {:?}.", controller);
                self.state = State::Error;
                return Ok(self.error_response(0x04, PairingError::Authentication));
            }
        };

        let mut signed = Vec::with_capacity(32 + identifier.len() + 32);
        signed.extend_from_slice(&self.controller_public);
        signed.extend_from_slice(&identifier);
        signed.extend_from_slice(&self.accessory_public);
        if crypto::ed25519_verify(&pairing.public_key, &signed, &signature).is_err() {
            warn!("Pair-Verify M3 signature verification failed.");
            self.state = State::Error;
            return Ok(self.error_response(0x04, PairingError::Authentication));
        }

        let installed = self.install_keys(ctx, **shared_secret, controller, pairing.is_admin());
        let body = tlv8::encode(&[
            Tlv::new(tlv_types::STATE, vec![0x04]),
            Tlv::new(tlv_types::SESSION_ID, installed.session_id.to_vec()),
        ]);
        self.state = State::Done;
        self.accessory_secret = None;
        self.session_key = None;
        self.shared_secret = None;
        debug!("Pair-Verify completed for {:?}.", installed.controller);
        Ok(VerifyResponse {
            body,
            installed: Some(installed),
        })
    }

    fn handle_resume_m1(
        &mut self,
        ctx: &mut VerifyContext<'_>,
        controller_public: Option<&[u8]>,
        session_id: Option<&[u8]>,
        auth_tag: Option<&[u8]>,
    ) -> Result<VerifyResponse> {
        let (controller_public, session_id, auth_tag) =
            match (controller_public, session_id, auth_tag) {
                (Some(p), Some(s), Some(t)) if s.len() == SESSION_ID_BYTES => (p, s, t),
                _ => return Err(Error::InvalidData),
            };

        let (shared_secret, controller) = match ctx.resume.take(session_id, ctx.now_ms) {
            Some(hit) => hit,
            None => {
                // Cache miss falls back to a full Pair-Verify from the
                // same M1 public key.
                debug!("Pair-Resume miss; falling back to full Pair-Verify.");
                return self.handle_m1(ctx, Some(controller_public));
            }
        };

        let mut salt = Vec::with_capacity(controller_public.len() + SESSION_ID_BYTES);
        salt.extend_from_slice(controller_public);
        salt.extend_from_slice(session_id);
        let mut request_key = [0u8; 32];
        crypto::hkdf_sha512(&salt, &shared_secret, b"Pair-Resume-Request-Info", &mut request_key);

        if crypto::aead_open(&request_key, &[0u8; 12], &[], auth_tag).is_err() {
            warn!("Pair-Resume request authentication failed.");
            self.state = State::Error;
            return Ok(self.error_response(0x02, PairingError::Authentication));
        }

        // Admin status may have changed since the secret was cached.
        let pairing = match ctx.store.find(ctx.kv, &controller)? {
            Some((_, pairing)) => pairing,
            None => {
                warn!("Pair-Resume for a removed pairing.");
                self.state = State::Error;
                return Ok(self.error_response(0x02, PairingError::Authentication));
            }
        };

        let mut new_session_id = [0u8; SESSION_ID_BYTES];
        ctx.rng.fill(&mut new_session_id);

        let mut salt = Vec::with_capacity(controller_public.len() + SESSION_ID_BYTES);
        salt.extend_from_slice(controller_public);
        salt.extend_from_slice(&new_session_id);
        let mut response_key = [0u8; 32];
        crypto::hkdf_sha512(
            &salt,
            &shared_secret,
            b"Pair-Resume-Response-Info",
            &mut response_key,
        );
        let sealed = crypto::aead_seal(&response_key, &[0u8; 12], &[], &[]);

        let mut new_shared = [0u8; 32];
        crypto::hkdf_sha512(
            &salt,
            &shared_secret,
            b"Pair-Resume-Shared-Secret-Info",
            &mut new_shared,
        );

        let body = tlv8::encode(&[
            Tlv::new(tlv_types::STATE, vec![0x02]),
            Tlv::new(tlv_types::METHOD, vec![Method::PairResume as u8]),
            Tlv::new(tlv_types::SESSION_ID, new_session_id.to_vec()),
            Tlv::new(tlv_types::ENCRYPTED_DATA, sealed),
        ]);

        let encrypt_key = derive_key(&new_shared, b"Control-Salt", b"Control-Read-Encryption-Key");
        let decrypt_key = derive_key(&new_shared, b"Control-Salt", b"Control-Write-Encryption-Key");
        ctx.resume
            .insert(new_session_id, new_shared, controller, ctx.now_ms);

        self.state = State::Done;
        debug!("Pair-Resume completed for {:?}.", controller);
        Ok(VerifyResponse {
            body,
            installed: Some(InstalledKeys {
                controller,
                controller_is_admin: pairing.is_admin(),
                encrypt_key,
                decrypt_key,
                shared_secret: new_shared,
                session_id: new_session_id,
            }),
        })
    }

    fn install_keys(
        &self,
        ctx: &mut VerifyContext<'_>,
        shared_secret: [u8; 32],
        controller: ControllerId,
        controller_is_admin: bool,
    ) -> InstalledKeys {
        let encrypt_key = derive_key(
            &shared_secret,
            b"Control-Salt",
            b"Control-Read-Encryption-Key",
        );
        let decrypt_key = derive_key(
            &shared_secret,
            b"Control-Salt",
            b"Control-Write-Encryption-Key",
        );
        let mut session_id = [0u8; SESSION_ID_BYTES];
        ctx.rng.fill(&mut session_id);
        ctx.resume
            .insert(session_id, shared_secret, controller, ctx.now_ms);
        InstalledKeys {
            controller,
            controller_is_admin,
            encrypt_key,
            decrypt_key,
            shared_secret,
            session_id,
        }
    }

    fn error_response(&self, state: u8, error: PairingError) -> VerifyResponse {
        VerifyResponse {
            body: tlv8::encode(&[
                Tlv::new(tlv_types::STATE, vec![state]),
                Tlv::new(tlv_types::ERROR, vec![error as u8]),
            ]),
            installed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519SecretKey;
    use crate::pairing::{Pairing, PERMISSION_ADMIN};
    use crate::platform::mock::{MockKeyValueStore, MockRng};
    use crate::tlv8::encode;

    struct Harness {
        kv: MockKeyValueStore,
        rng: MockRng,
        identity: DeviceIdentity,
        store: PairingStore,
        resume: ResumeCache,
        controller_ltsk: Ed25519SecretKey,
    }

    const CONTROLLER_ID: &[u8] = b"4A:3B:2C:1D:0E:FF";

    impl Harness {
        fn new() -> Self {
            let mut kv = MockKeyValueStore::new();
            let mut rng = MockRng::with_seed(0x5eed);
            let identity = DeviceIdentity::load_or_create(&mut kv, &mut rng).unwrap();
            let store = PairingStore::new(16);
            let controller_ltsk = Ed25519SecretKey([0x66; 32]);
            store
                .insert(
                    &mut kv,
                    &Pairing {
                        id: ControllerId::try_from(CONTROLLER_ID).unwrap(),
                        public_key: controller_ltsk.public_key(),
                        permissions: PERMISSION_ADMIN,
                    },
                )
                .unwrap();
            Harness {
                kv,
                rng,
                identity,
                store,
                resume: ResumeCache::new(),
                controller_ltsk,
            }
        }

        fn handle(&mut self, engine: &mut PairVerify, body: &[u8], now_ms: u64) -> VerifyResponse {
            let mut ctx = VerifyContext {
                kv: &self.kv,
                rng: &mut self.rng,
                identity: &self.identity,
                store: &self.store,
                resume: &mut self.resume,
                now_ms,
            };
            engine.handle(&mut ctx, body).unwrap()
        }

        /// Runs the controller side of a full verify, returning the
        /// installed keys and the controller-side transport keys.
        fn run_full_verify(
            &mut self,
            engine: &mut PairVerify,
        ) -> (InstalledKeys, [u8; 32], [u8; 32]) {
            let controller_secret = X25519SecretKey([0x13; 32]);
            let controller_public = controller_secret.public_key();
            let m1 = encode(&[
                Tlv::new(tlv_types::STATE, vec![0x01]),
                Tlv::new(tlv_types::PUBLIC_KEY, controller_public.to_vec()),
            ]);
            let m2 = self.handle(engine, &m1, 0);

            let mut slots = [
                TlvSlot::new(tlv_types::STATE),
                TlvSlot::new(tlv_types::PUBLIC_KEY),
                TlvSlot::new(tlv_types::ENCRYPTED_DATA),
            ];
            Reader::new(&m2.body).extract(&mut slots).unwrap();
            let accessory_public: [u8; 32] =
                slots[1].value.clone().unwrap().try_into().unwrap();
            let shared = controller_secret.shared_secret(&accessory_public);
            let session_key = derive_key(
                &shared,
                b"Pair-Verify-Encrypt-Salt",
                b"Pair-Verify-Encrypt-Info",
            );

            // Validate the accessory signature like a controller.
            let sealed = slots[2].value.clone().unwrap();
            let plaintext = crypto::aead_open(
                &session_key,
                &nonce_from_label(b"PV-Msg02"),
                &[],
                &sealed,
            )
            .unwrap();
            let mut sub = [
                TlvSlot::new(tlv_types::IDENTIFIER),
                TlvSlot::new(tlv_types::SIGNATURE),
            ];
            Reader::new(&plaintext).extract(&mut sub).unwrap();
            let accessory_id = sub[0].value.clone().unwrap();
            assert_eq!(accessory_id, self.identity.id_string().into_bytes());

            let mut message = Vec::new();
            message.extend_from_slice(&controller_public);
            message.extend_from_slice(CONTROLLER_ID);
            message.extend_from_slice(&accessory_public);
            let signature = self.controller_ltsk.sign(&message);
            let sub_tlv = encode(&[
                Tlv::new(tlv_types::IDENTIFIER, CONTROLLER_ID.to_vec()),
                Tlv::new(tlv_types::SIGNATURE, signature.to_vec()),
            ]);
            let sealed =
                crypto::aead_seal(&session_key, &nonce_from_label(b"PV-Msg03"), &[], &sub_tlv);
            let m3 = encode(&[
                Tlv::new(tlv_types::STATE, vec![0x03]),
                Tlv::new(tlv_types::ENCRYPTED_DATA, sealed),
            ]);
            let m4 = self.handle(engine, &m3, 0);
            let installed = m4.installed.expect("verify must complete");

            let read_key = derive_key(&shared, b"Control-Salt", b"Control-Read-Encryption-Key");
            let write_key = derive_key(&shared, b"Control-Salt", b"Control-Write-Encryption-Key");
            (installed, read_key, write_key)
        }
    }

    #[test]
    fn full_verify_installs_directional_keys() {
        let mut harness = Harness::new();
        let mut engine = PairVerify::new();
        let (installed, read_key, write_key) = harness.run_full_verify(&mut engine);
        assert_eq!(installed.encrypt_key, read_key);
        assert_eq!(installed.decrypt_key, write_key);
        assert!(installed.controller_is_admin);
        assert_eq!(installed.controller.as_bytes(), CONTROLLER_ID);
        assert_eq!(harness.resume.len(), 1);
    }

    #[test]
    fn m3_with_wrong_signature_fails() {
        let mut harness = Harness::new();
        let mut engine = PairVerify::new();
        let controller_secret = X25519SecretKey([0x13; 32]);
        let m1 = encode(&[
            Tlv::new(tlv_types::STATE, vec![0x01]),
            Tlv::new(tlv_types::PUBLIC_KEY, controller_secret.public_key().to_vec()),
        ]);
        let m2 = harness.handle(&mut engine, &m1, 0);
        let mut slots = [TlvSlot::new(tlv_types::PUBLIC_KEY)];
        Reader::new(&m2.body).extract(&mut slots).unwrap();
        let accessory_public: [u8; 32] = slots[0].value.clone().unwrap().try_into().unwrap();
        let shared = controller_secret.shared_secret(&accessory_public);
        let session_key = derive_key(
            &shared,
            b"Pair-Verify-Encrypt-Salt",
            b"Pair-Verify-Encrypt-Info",
        );

        // Signature from a key the accessory never stored.
        let rogue = Ed25519SecretKey([0x01; 32]);
        let mut message = Vec::new();
        message.extend_from_slice(&controller_secret.public_key());
        message.extend_from_slice(CONTROLLER_ID);
        message.extend_from_slice(&accessory_public);
        let sub_tlv = encode(&[
            Tlv::new(tlv_types::IDENTIFIER, CONTROLLER_ID.to_vec()),
            Tlv::new(tlv_types::SIGNATURE, rogue.sign(&message).to_vec()),
        ]);
        let sealed = crypto::aead_seal(&session_key, &nonce_from_label(b"PV-Msg03"), &[], &sub_tlv);
        let m3 = encode(&[
            Tlv::new(tlv_types::STATE, vec![0x03]),
            Tlv::new(tlv_types::ENCRYPTED_DATA, sealed),
        ]);
        let m4 = harness.handle(&mut engine, &m3, 0);
        assert!(m4.installed.is_none());
        let mut slots = [TlvSlot::new(tlv_types::ERROR)];
        Reader::new(&m4.body).extract(&mut slots).unwrap();
        assert_eq!(
            slots[0].value.as_deref(),
            Some(&[PairingError::Authentication as u8][..])
        );
    }

    #[test]
    fn resume_collapses_to_two_messages() {
        let mut harness = Harness::new();
        let mut engine = PairVerify::new();
        let (installed, _, _) = harness.run_full_verify(&mut engine);

        // Controller computes the resume request from the cached secret.
        let controller_secret = X25519SecretKey([0x37; 32]);
        let controller_public = controller_secret.public_key();
        let mut salt = Vec::new();
        salt.extend_from_slice(&controller_public);
        salt.extend_from_slice(&installed.session_id);
        let mut request_key = [0u8; 32];
        crypto::hkdf_sha512(
            &salt,
            &installed.shared_secret,
            b"Pair-Resume-Request-Info",
            &mut request_key,
        );
        let auth_tag = crypto::aead_seal(&request_key, &[0u8; 12], &[], &[]);

        let m1 = encode(&[
            Tlv::new(tlv_types::STATE, vec![0x01]),
            Tlv::new(tlv_types::METHOD, vec![Method::PairResume as u8]),
            Tlv::new(tlv_types::PUBLIC_KEY, controller_public.to_vec()),
            Tlv::new(tlv_types::SESSION_ID, installed.session_id.to_vec()),
            Tlv::new(tlv_types::ENCRYPTED_DATA, auth_tag),
        ]);
        let mut resumed = PairVerify::new();
        let m2 = harness.handle(&mut resumed, &m1, 1000);
        let keys = m2.installed.expect("resume must complete");
        assert_eq!(keys.controller.as_bytes(), CONTROLLER_ID);
        assert_ne!(keys.session_id, installed.session_id);
        assert_ne!(keys.shared_secret, installed.shared_secret);

        // The old ticket is single-use.
        let mut third = PairVerify::new();
        let m2_again = harness.handle(&mut third, &m1, 2000);
        // Falls back to full verify: no keys installed yet, M2 carries the
        // accessory public key.
        assert!(m2_again.installed.is_none());
        let mut slots = [TlvSlot::new(tlv_types::PUBLIC_KEY)];
        Reader::new(&m2_again.body).extract(&mut slots).unwrap();
        assert!(slots[0].value.is_some());
    }

    #[test]
    fn expired_ticket_misses() {
        let mut cache = ResumeCache::new();
        let controller = ControllerId::try_from(CONTROLLER_ID).unwrap();
        cache.insert([1; 8], [9; 32], controller, 0);
        assert!(cache.take(&[1; 8], RESUME_LIFETIME_MS).is_none());
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = ResumeCache::new();
        let controller = ControllerId::try_from(CONTROLLER_ID).unwrap();
        for i in 0..RESUME_CACHE_MIN_ENTRIES as u8 {
            cache.insert([i; 8], [i; 32], controller, i as u64);
        }
        cache.insert([0xee; 8], [0xee; 32], controller, 100);
        assert_eq!(cache.len(), RESUME_CACHE_MIN_ENTRIES);
        // The oldest entry is gone.
        assert!(cache.take(&[0; 8], 101).is_none());
        assert!(cache.take(&[1; 8], 101).is_some());
    }

    #[test]
    fn purge_controller_drops_entries() {
        let mut cache = ResumeCache::new();
        let a = ControllerId::try_from(&b"aaa"[..]).unwrap();
        let b = ControllerId::try_from(&b"bbb"[..]).unwrap();
        cache.insert([1; 8], [1; 32], a, 0);
        cache.insert([2; 8], [2; 32], b, 0);
        cache.purge_controller(&a);
        assert_eq!(cache.len(), 1);
        assert!(cache.take(&[2; 8], 1).is_some());
    }
}
