// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Pair-Setup: the six-message SRP exchange that installs the first
//! (admin) pairing. The accessory is the SRP verifier; the whole procedure
//! runs over a single unsecured transport session, and only one procedure
//! may exist per accessory at a time.

use log::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{
    self, derive_key, nonce_from_label, Ed25519SecretKey, SrpServer, SRP_SALT_BYTES,
};
use crate::pairing::{
    store, tlv_types, ControllerId, Method, Pairing, PairingError, PairingStore, DeviceIdentity,
    PERMISSION_ADMIN,
};
use crate::platform::{KeyValueStore, Rng};
use crate::tlv8::{self, Reader, Tlv, TlvSlot};
use crate::{Error, Result};

/// SRP username fixed by the protocol.
const SRP_USERNAME: &[u8] = b"Pair-Setup";

/// Failed authentication attempts tolerated across the device lifetime.
const MAX_AUTH_ATTEMPTS: u8 = 100;

/// A procedure with no progress for this long is abandoned.
pub const SETUP_TIMEOUT_MS: u64 = 60_000;

/// Provisioned setup credentials: the SRP salt and verifier derived from
/// the 8-digit setup code. The raw code is never retained.
pub struct SetupInfo {
    pub salt: [u8; SRP_SALT_BYTES],
    pub verifier: Vec<u8>,
}

impl SetupInfo {
    /// Derives the salt and verifier for a setup code in `XXX-XX-XXX`
    /// form.
    pub fn from_code(rng: &mut dyn Rng, code: &str) -> Result<Self> {
        if !is_valid_setup_code(code) {
            return Err(Error::InvalidData);
        }
        let mut salt = [0u8; SRP_SALT_BYTES];
        rng.fill(&mut salt);
        let verifier = crypto::srp_verifier(&salt, SRP_USERNAME, code.as_bytes());
        Ok(SetupInfo { salt, verifier })
    }
}

/// Setup codes are eight digits grouped `XXX-XX-XXX`. Trivial codes are
/// rejected at provisioning time.
pub fn is_valid_setup_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    if bytes.len() != 10 || bytes[3] != b'-' || bytes[6] != b'-' {
        return false;
    }
    let digits: Vec<u8> = bytes
        .iter()
        .filter(|b| **b != b'-')
        .map(|b| b.wrapping_sub(b'0'))
        .collect();
    if digits.len() != 8 || digits.iter().any(|d| *d > 9) {
        return false;
    }
    const TRIVIAL: [[u8; 8]; 12] = [
        [0; 8],
        [1; 8],
        [2; 8],
        [3; 8],
        [4; 8],
        [5; 8],
        [6; 8],
        [7; 8],
        [8; 8],
        [9; 8],
        [1, 2, 3, 4, 5, 6, 7, 8],
        [8, 7, 6, 5, 4, 3, 2, 1],
    ];
    !TRIVIAL.iter().any(|t| digits == t)
}

/// Everything Pair-Setup needs from the server per message.
pub struct SetupContext<'a> {
    pub kv: &'a mut dyn KeyValueStore,
    pub rng: &'a mut dyn Rng,
    pub identity: &'a DeviceIdentity,
    pub store: &'a PairingStore,
    pub setup: &'a SetupInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    M1Received,
    M3Received,
    Done,
    Error,
}

/// The accessory-side Pair-Setup engine. One instance per server.
pub struct PairSetup {
    state: State,
    /// Transport token of the session driving the procedure.
    owner: Option<u64>,
    srp: Option<SrpServer>,
    session_key: Option<Zeroizing<[u8; 64]>>,
    last_activity_ms: u64,
}

/// Result of one handled message.
pub struct SetupResponse {
    pub body: Vec<u8>,
    /// Set when M6 went out and a pairing was stored.
    pub completed: bool,
}

impl Default for PairSetup {
    fn default() -> Self {
        Self::new()
    }
}

impl PairSetup {
    pub fn new() -> Self {
        PairSetup {
            state: State::Idle,
            owner: None,
            srp: None,
            session_key: None,
            last_activity_ms: 0,
        }
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.state, State::M1Received | State::M3Received)
    }

    /// Abandons the procedure, e.g. on transport disconnect of the owner.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.owner = None;
        self.srp = None;
        self.session_key = None;
    }

    /// Abandons a stalled procedure. Driven by the server timer.
    pub fn expire(&mut self, now_ms: u64) {
        if self.in_progress() && now_ms.saturating_sub(self.last_activity_ms) >= SETUP_TIMEOUT_MS {
            warn!("Pair-Setup timed out without progress; resetting.");
            self.reset();
        }
    }

    /// Called when a transport session closes; abandons the procedure if
    /// that session owned it.
    pub fn owner_disconnected(&mut self, owner: u64) {
        if self.owner == Some(owner) {
            self.reset();
        }
    }

    /// Handles one inbound pairing TLV. Unparseable input is
    /// `InvalidData` (the transport answers with its own error status);
    /// protocol failures produce an in-band error TLV.
    pub fn handle(
        &mut self,
        ctx: &mut SetupContext<'_>,
        owner: u64,
        body: &[u8],
        now_ms: u64,
    ) -> Result<SetupResponse> {
        let mut slots = [
            TlvSlot::new(tlv_types::STATE),
            TlvSlot::new(tlv_types::METHOD),
            TlvSlot::new(tlv_types::PUBLIC_KEY),
            TlvSlot::new(tlv_types::PROOF),
            TlvSlot::new(tlv_types::ENCRYPTED_DATA),
            TlvSlot::new(tlv_types::FLAGS),
        ];
        Reader::new(body).extract(&mut slots)?;
        let [state, method, public_key, proof, encrypted_data, _flags] = slots;

        let state = match state.value.as_deref() {
            Some([value]) => *value,
            _ => return Err(Error::InvalidData),
        };
        self.last_activity_ms = now_ms;

        match state {
            0x01 => self.handle_m1(ctx, owner, method.value.as_deref()),
            0x03 => self.handle_m3(
                ctx,
                owner,
                public_key.value.as_deref(),
                proof.value.as_deref(),
            ),
            0x05 => self.handle_m5(ctx, owner, encrypted_data.value.as_deref()),
            _ => {
                warn!("Pair-Setup message with unexpected state {}.", state);
                self.state = State::Error;
                Ok(self.error_response(0x02, PairingError::Unknown))
            }
        }
    }

    fn handle_m1(
        &mut self,
        ctx: &mut SetupContext<'_>,
        owner: u64,
        method: Option<&[u8]>,
    ) -> Result<SetupResponse> {
        match method {
            Some([m]) => {
                let method = Method::try_from(*m)?;
                if method != Method::PairSetup && method != Method::PairSetupWithAuth {
                    return Err(Error::InvalidData);
                }
            }
            Some(_) => return Err(Error::InvalidData),
            None => {}
        }

        if self.in_progress() && self.owner != Some(owner) {
            debug!("Pair-Setup M1 while another procedure is in progress.");
            return Ok(self.error_response(0x02, PairingError::Unavailable));
        }
        if ctx.store.has_admin(ctx.kv)? {
            debug!("Pair-Setup M1 while already paired.");
            self.state = State::Error;
            return Ok(self.error_response(0x02, PairingError::Unavailable));
        }
        if store::load_setup_attempts(ctx.kv)? >= MAX_AUTH_ATTEMPTS {
            warn!("Pair-Setup refused: too many failed authentication attempts.");
            self.state = State::Error;
            return Ok(self.error_response(0x02, PairingError::MaxTries));
        }

        let mut secret_b = Zeroizing::new([0u8; 32]);
        ctx.rng.fill(&mut *secret_b);
        let srp = SrpServer::new(&secret_b, ctx.setup.salt, &ctx.setup.verifier);

        let body = tlv8::encode(&[
            Tlv::new(tlv_types::STATE, vec![0x02]),
            Tlv::new(tlv_types::PUBLIC_KEY, srp.public_key().to_vec()),
            Tlv::new(tlv_types::SALT, srp.salt().to_vec()),
        ]);
        self.srp = Some(srp);
        self.owner = Some(owner);
        self.state = State::M1Received;
        debug!("Pair-Setup M1 -> M2.");
        Ok(SetupResponse {
            body,
            completed: false,
        })
    }

    fn handle_m3(
        &mut self,
        ctx: &mut SetupContext<'_>,
        owner: u64,
        client_public: Option<&[u8]>,
        client_proof: Option<&[u8]>,
    ) -> Result<SetupResponse> {
        if self.state != State::M1Received || self.owner != Some(owner) {
            self.state = State::Error;
            return Ok(self.error_response(0x04, PairingError::Unknown));
        }
        let (client_public, client_proof) = match (client_public, client_proof) {
            (Some(a), Some(m)) => (a, m),
            _ => return Err(Error::InvalidData),
        };

        let srp = match self.srp.as_ref() {
            Some(srp) => srp,
            None => {
                self.state = State::Error;
                return Ok(self.error_response(0x04, PairingError::Unknown));
            }
        };
        match srp.verify_client(SRP_USERNAME, client_public, client_proof) {
            Ok(proof) => {
                let body = tlv8::encode(&[
                    Tlv::new(tlv_types::STATE, vec![0x04]),
                    Tlv::new(tlv_types::PROOF, proof.server_proof.to_vec()),
                ]);
                self.session_key = Some(Zeroizing::new(proof.session_key));
                self.state = State::M3Received;
                debug!("Pair-Setup M3 -> M4.");
                Ok(SetupResponse {
                    body,
                    completed: false,
                })
            }
            Err(_) => {
                let attempts = store::load_setup_attempts(ctx.kv)?.saturating_add(1);
                store::store_setup_attempts(ctx.kv, attempts)?;
                warn!(
                    "Pair-Setup SRP proof verification failed (attempt {} of {}).",
                    attempts, MAX_AUTH_ATTEMPTS
                );
                self.state = State::Error;
                Ok(self.error_response(0x04, PairingError::Authentication))
            }
        }
    }

    fn handle_m5(
        &mut self,
        ctx: &mut SetupContext<'_>,
        owner: u64,
        encrypted_data: Option<&[u8]>,
    ) -> Result<SetupResponse> {
        if self.state != State::M3Received || self.owner != Some(owner) {
            self.state = State::Error;
            return Ok(self.error_response(0x06, PairingError::Unknown));
        }
        let encrypted_data = encrypted_data.ok_or(Error::InvalidData)?;
        let session_key = match self.session_key.as_ref() {
            Some(key) => key,
            None => {
                self.state = State::Error;
                return Ok(self.error_response(0x06, PairingError::Unknown));
            }
        };

        let encrypt_key = derive_key(
            session_key.as_ref(),
            b"Pair-Setup-Encrypt-Salt",
            b"Pair-Setup-Encrypt-Info",
        );
        let plaintext =
            match crypto::aead_open(&encrypt_key, &nonce_from_label(b"PS-Msg05"), &[], encrypted_data) {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    warn!("Pair-Setup M5 decryption failed.");
                    self.state = State::Error;
                    return Ok(self.error_response(0x06, PairingError::Authentication));
                }
            };

        let mut slots = [
            TlvSlot::new(tlv_types::IDENTIFIER),
            TlvSlot::new(tlv_types::PUBLIC_KEY),
            TlvSlot::new(tlv_types::SIGNATURE),
        ];
        Reader::new(&plaintext).extract(&mut slots)?;
        let [identifier, ltpk, signature] = slots;
        let (identifier, ltpk, signature) = match (identifier.value, ltpk.value, signature.value) {
            (Some(i), Some(k), Some(s)) if k.len() == 32 => (i, k, s),
            _ => return Err(Error::InvalidData),
        };

        let mut controller_info = [0u8; 32];
        crypto::hkdf_sha512(
            b"Pair-Setup-Controller-Sign-Salt",
            session_key.as_ref(),
            b"Pair-Setup-Controller-Sign-Info",
            &mut controller_info,
        );
        let mut signed = Vec::with_capacity(32 + identifier.len() + 32);
        signed.extend_from_slice(&controller_info);
        signed.extend_from_slice(&identifier);
        signed.extend_from_slice(&ltpk);

        let ltpk_array: [u8; 32] = ltpk.as_slice().try_into().map_err(|_| Error::InvalidData)?;
        if crypto::ed25519_verify(&ltpk_array, &signed, &signature).is_err() {
            warn!("Pair-Setup M5 signature verification failed.");
            self.state = State::Error;
            return Ok(self.error_response(0x06, PairingError::Authentication));
        }

        let controller = ControllerId::try_from(identifier.as_slice())?;
        ctx.store.insert(
            ctx.kv,
            &Pairing {
                id: controller,
                public_key: ltpk_array,
                permissions: PERMISSION_ADMIN,
            },
        )?;

        // Accessory sub-TLV, signed with the long-term identity.
        let accessory_id = ctx.identity.id_string();
        let mut accessory_info = [0u8; 32];
        crypto::hkdf_sha512(
            b"Pair-Setup-Accessory-Sign-Salt",
            session_key.as_ref(),
            b"Pair-Setup-Accessory-Sign-Info",
            &mut accessory_info,
        );
        let ltsk: &Ed25519SecretKey = &ctx.identity.ltsk;
        let mut signed = Vec::with_capacity(32 + accessory_id.len() + 32);
        signed.extend_from_slice(&accessory_info);
        signed.extend_from_slice(accessory_id.as_bytes());
        signed.extend_from_slice(&ltsk.public_key());
        let signature = ltsk.sign(&signed);

        let sub_tlv = tlv8::encode(&[
            Tlv::new(tlv_types::IDENTIFIER, accessory_id.into_bytes()),
            Tlv::new(tlv_types::PUBLIC_KEY, ltsk.public_key().to_vec()),
            Tlv::new(tlv_types::SIGNATURE, signature.to_vec()),
        ]);
        let sealed = crypto::aead_seal(&encrypt_key, &nonce_from_label(b"PS-Msg06"), &[], &sub_tlv);

        let body = tlv8::encode(&[
            Tlv::new(tlv_types::STATE, vec![0x06]),
            Tlv::new(tlv_types::ENCRYPTED_DATA, sealed),
        ]);
        self.state = State::Done;
        self.srp = None;
        self.session_key = None;
        self.owner = None;
        info!("Pair-Setup completed; admin pairing stored.");
        Ok(SetupResponse {
            body,
            completed: true,
        })
    }

    fn error_response(&self, state: u8, error: PairingError) -> SetupResponse {
        SetupResponse {
            body: tlv8::encode(&[
                Tlv::new(tlv_types::STATE, vec![state]),
                Tlv::new(tlv_types::ERROR, vec![error as u8]),
            ]),
            completed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SrpClient;
    use crate::platform::mock::{MockKeyValueStore, MockRng};
    use crate::tlv8::encode;

    struct Harness {
        kv: MockKeyValueStore,
        rng: MockRng,
        identity: DeviceIdentity,
        store: PairingStore,
        setup: SetupInfo,
        engine: PairSetup,
    }

    impl Harness {
        fn new() -> Self {
            let mut kv = MockKeyValueStore::new();
            let mut rng = MockRng::with_seed(0xdead_beef);
            let identity = DeviceIdentity::load_or_create(&mut kv, &mut rng).unwrap();
            let setup = SetupInfo::from_code(&mut rng, "111-22-333").unwrap();
            Harness {
                kv,
                rng,
                identity,
                store: PairingStore::new(16),
                setup,
                engine: PairSetup::new(),
            }
        }

        fn handle(&mut self, owner: u64, body: &[u8]) -> SetupResponse {
            let mut ctx = SetupContext {
                kv: &mut self.kv,
                rng: &mut self.rng,
                identity: &self.identity,
                store: &self.store,
                setup: &self.setup,
            };
            self.engine.handle(&mut ctx, owner, body, 0).unwrap()
        }
    }

    fn extract(body: &[u8], wanted: &[u8]) -> Vec<Option<Vec<u8>>> {
        let mut slots: Vec<TlvSlot> = wanted.iter().map(|t| TlvSlot::new(*t)).collect();
        Reader::new(body).extract(&mut slots).unwrap();
        slots.into_iter().map(|s| s.value).collect()
    }

    fn m1() -> Vec<u8> {
        encode(&[
            Tlv::new(tlv_types::STATE, vec![0x01]),
            Tlv::new(tlv_types::METHOD, vec![Method::PairSetup as u8]),
        ])
    }

    /// Drives the full controller side with the given code, returning the
    /// final response and the engine's completion flag.
    fn run_exchange(harness: &mut Harness, code: &str) -> SetupResponse {
        let m2 = harness.handle(1, &m1());
        let fields = extract(&m2.body, &[tlv_types::STATE, tlv_types::PUBLIC_KEY, tlv_types::SALT]);
        assert_eq!(fields[0].as_deref(), Some(&[0x02][..]));
        let server_public = fields[1].clone().unwrap();
        let salt = fields[2].clone().unwrap();

        let client = SrpClient::new(&[0x44; 32]);
        let (session_key, proof) =
            client.compute_proof(&salt, &server_public, SRP_USERNAME, code.as_bytes());
        let m3 = encode(&[
            Tlv::new(tlv_types::STATE, vec![0x03]),
            Tlv::new(tlv_types::PUBLIC_KEY, client.public_key().to_vec()),
            Tlv::new(tlv_types::PROOF, proof.to_vec()),
        ]);
        let m4 = harness.handle(1, &m3);
        let fields = extract(&m4.body, &[tlv_types::STATE, tlv_types::PROOF, tlv_types::ERROR]);
        if fields[2].is_some() {
            return m4;
        }
        assert_eq!(fields[0].as_deref(), Some(&[0x04][..]));

        // Check the server proof like a real controller would.
        use sha2::Digest;
        let server_proof = fields[1].clone().unwrap();
        let mut hasher = sha2::Sha512::new();
        hasher.update(client.public_key());
        hasher.update(proof);
        hasher.update(session_key);
        let expected: [u8; 64] = hasher.finalize().into();
        assert_eq!(server_proof, expected.to_vec());

        // M5: controller identity sealed to the session key.
        let controller_id = b"4A:3B:2C:1D:0E:FF";
        let controller_ltsk = Ed25519SecretKey([0x21; 32]);
        let mut sign_info = [0u8; 32];
        crypto::hkdf_sha512(
            b"Pair-Setup-Controller-Sign-Salt",
            &session_key,
            b"Pair-Setup-Controller-Sign-Info",
            &mut sign_info,
        );
        let mut signed = Vec::new();
        signed.extend_from_slice(&sign_info);
        signed.extend_from_slice(controller_id);
        signed.extend_from_slice(&controller_ltsk.public_key());
        let signature = controller_ltsk.sign(&signed);
        let sub_tlv = encode(&[
            Tlv::new(tlv_types::IDENTIFIER, controller_id.to_vec()),
            Tlv::new(tlv_types::PUBLIC_KEY, controller_ltsk.public_key().to_vec()),
            Tlv::new(tlv_types::SIGNATURE, signature.to_vec()),
        ]);
        let encrypt_key = derive_key(
            &session_key,
            b"Pair-Setup-Encrypt-Salt",
            b"Pair-Setup-Encrypt-Info",
        );
        let sealed = crypto::aead_seal(&encrypt_key, &nonce_from_label(b"PS-Msg05"), &[], &sub_tlv);
        let m5 = encode(&[
            Tlv::new(tlv_types::STATE, vec![0x05]),
            Tlv::new(tlv_types::ENCRYPTED_DATA, sealed),
        ]);
        harness.handle(1, &m5)
    }

    #[test]
    fn full_exchange_stores_admin_pairing() {
        let mut harness = Harness::new();
        let m6 = run_exchange(&mut harness, "111-22-333");
        assert!(m6.completed);

        let fields = extract(&m6.body, &[tlv_types::STATE, tlv_types::ENCRYPTED_DATA]);
        assert_eq!(fields[0].as_deref(), Some(&[0x06][..]));
        assert!(fields[1].is_some());

        let pairings = harness.store.list(&harness.kv).unwrap();
        assert_eq!(pairings.len(), 1);
        assert!(pairings[0].is_admin());
        assert_eq!(pairings[0].id.as_bytes(), b"4A:3B:2C:1D:0E:FF");
        assert_eq!(pairings[0].public_key, Ed25519SecretKey([0x21; 32]).public_key());
    }

    #[test]
    fn second_setup_is_unavailable_once_paired() {
        let mut harness = Harness::new();
        assert!(run_exchange(&mut harness, "111-22-333").completed);
        let response = harness.handle(2, &m1());
        let fields = extract(&response.body, &[tlv_types::STATE, tlv_types::ERROR]);
        assert_eq!(fields[0].as_deref(), Some(&[0x02][..]));
        assert_eq!(
            fields[1].as_deref(),
            Some(&[PairingError::Unavailable as u8][..])
        );
    }

    #[test]
    fn wrong_code_counts_an_attempt_and_errors() {
        let mut harness = Harness::new();
        let response = run_exchange(&mut harness, "999-88-777");
        assert!(!response.completed);
        let fields = extract(&response.body, &[tlv_types::STATE, tlv_types::ERROR]);
        assert_eq!(fields[0].as_deref(), Some(&[0x04][..]));
        assert_eq!(
            fields[1].as_deref(),
            Some(&[PairingError::Authentication as u8][..])
        );
        assert_eq!(store::load_setup_attempts(&harness.kv).unwrap(), 1);
        assert!(harness.store.list(&harness.kv).unwrap().is_empty());

        // The error state clears on a fresh M1 and the right code works.
        assert!(run_exchange(&mut harness, "111-22-333").completed);
    }

    #[test]
    fn attempt_limit_is_permanent() {
        let mut harness = Harness::new();
        store::store_setup_attempts(&mut harness.kv, MAX_AUTH_ATTEMPTS).unwrap();
        let response = harness.handle(1, &m1());
        let fields = extract(&response.body, &[tlv_types::ERROR]);
        assert_eq!(
            fields[0].as_deref(),
            Some(&[PairingError::MaxTries as u8][..])
        );
    }

    #[test]
    fn concurrent_owner_is_rejected() {
        let mut harness = Harness::new();
        harness.handle(1, &m1());
        let response = harness.handle(2, &m1());
        let fields = extract(&response.body, &[tlv_types::ERROR]);
        assert_eq!(
            fields[0].as_deref(),
            Some(&[PairingError::Unavailable as u8][..])
        );
        // The original owner's procedure is still alive.
        assert!(harness.engine.in_progress());
    }

    #[test]
    fn m3_before_m1_is_a_state_error() {
        let mut harness = Harness::new();
        let m3 = encode(&[
            Tlv::new(tlv_types::STATE, vec![0x03]),
            Tlv::new(tlv_types::PUBLIC_KEY, vec![1; 384]),
            Tlv::new(tlv_types::PROOF, vec![2; 64]),
        ]);
        let response = harness.handle(1, &m3);
        let fields = extract(&response.body, &[tlv_types::STATE, tlv_types::ERROR]);
        assert_eq!(fields[0].as_deref(), Some(&[0x04][..]));
        assert!(fields[1].is_some());
    }

    #[test]
    fn stalled_procedure_expires() {
        let mut harness = Harness::new();
        harness.handle(1, &m1());
        assert!(harness.engine.in_progress());
        harness.engine.expire(SETUP_TIMEOUT_MS - 1);
        assert!(harness.engine.in_progress());
        harness.engine.expire(SETUP_TIMEOUT_MS);
        assert!(!harness.engine.in_progress());
    }

    #[test]
    fn setup_code_shape() {
        assert!(is_valid_setup_code("111-22-333"));
        assert!(!is_valid_setup_code("11122333"));
        assert!(!is_valid_setup_code("111-22-33a"));
        assert!(!is_valid_setup_code("000-00-000"));
        assert!(!is_valid_setup_code("123-45-678"));
    }
}
