// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Thin wrappers over the cryptographic backends: SHA-512, HKDF-SHA512,
//! ChaCha20-Poly1305, Ed25519, X25519, and the SRP-6a verifier side over
//! the RFC 5054 3072-bit group.
//!
//! Randomness never originates here; callers pass bytes drawn from the
//! platform RNG capability.

use std::sync::OnceLock;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, Verifier};
use hkdf::Hkdf;
use num_bigint::BigUint;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

pub const AEAD_KEY_BYTES: usize = 32;
pub const AEAD_TAG_BYTES: usize = 16;
pub const AEAD_NONCE_BYTES: usize = 12;
pub const ED25519_PUBLIC_KEY_BYTES: usize = 32;
pub const ED25519_SIGNATURE_BYTES: usize = 64;
pub const X25519_KEY_BYTES: usize = 32;
pub const SRP_PRIME_BYTES: usize = 384;
pub const SRP_SALT_BYTES: usize = 16;

pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hkdf_sha512(salt: &[u8], ikm: &[u8], info: &[u8], okm: &mut [u8]) {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    // The output lengths used by the protocol are far below the HKDF
    // bound, so expansion cannot fail.
    hk.expand(info, okm).unwrap();
}

/// Derives one 32-byte key with the given context strings.
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; AEAD_KEY_BYTES] {
    let mut key = [0u8; AEAD_KEY_BYTES];
    hkdf_sha512(salt, ikm, info, &mut key);
    key
}

/// A 96-bit AEAD nonce from a 64-bit message counter: four zero bytes
/// followed by the counter in little-endian order.
pub fn nonce_from_counter(counter: u64) -> [u8; AEAD_NONCE_BYTES] {
    let mut nonce = [0u8; AEAD_NONCE_BYTES];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// A 96-bit AEAD nonce from an eight-character protocol label such as
/// `PS-Msg05`.
pub fn nonce_from_label(label: &[u8; 8]) -> [u8; AEAD_NONCE_BYTES] {
    let mut nonce = [0u8; AEAD_NONCE_BYTES];
    nonce[4..].copy_from_slice(label);
    nonce
}

/// Seals `plaintext`, returning ciphertext with the 16-byte tag appended.
pub fn aead_seal(
    key: &[u8; AEAD_KEY_BYTES],
    nonce: &[u8; AEAD_NONCE_BYTES],
    aad: &[u8],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("sealing cannot fail")
}

/// Opens ciphertext-with-tag. An authentication mismatch is `InvalidData`;
/// session owners treat it as fatal.
pub fn aead_open(
    key: &[u8; AEAD_KEY_BYTES],
    nonce: &[u8; AEAD_NONCE_BYTES],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < AEAD_TAG_BYTES {
        return Err(Error::InvalidData);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::InvalidData)
}

/// An Ed25519 long-term secret key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ed25519SecretKey(pub [u8; 32]);

impl Ed25519SecretKey {
    pub fn public_key(&self) -> [u8; ED25519_PUBLIC_KEY_BYTES] {
        ed25519_dalek::SigningKey::from_bytes(&self.0)
            .verifying_key()
            .to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; ED25519_SIGNATURE_BYTES] {
        ed25519_dalek::SigningKey::from_bytes(&self.0)
            .sign(message)
            .to_bytes()
    }
}

/// Verifies an Ed25519 signature; failure is `NotAuthorized`.
pub fn ed25519_verify(
    public_key: &[u8; ED25519_PUBLIC_KEY_BYTES],
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let signature: &[u8; ED25519_SIGNATURE_BYTES] =
        signature.try_into().map_err(|_| Error::InvalidData)?;
    let key =
        ed25519_dalek::VerifyingKey::from_bytes(public_key).map_err(|_| Error::InvalidData)?;
    key.verify(message, &ed25519_dalek::Signature::from_bytes(signature))
        .map_err(|_| Error::NotAuthorized)
}

/// An X25519 ephemeral secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct X25519SecretKey(pub [u8; X25519_KEY_BYTES]);

impl X25519SecretKey {
    pub fn public_key(&self) -> [u8; X25519_KEY_BYTES] {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        *x25519_dalek::PublicKey::from(&secret).as_bytes()
    }

    pub fn shared_secret(&self, peer_public: &[u8; X25519_KEY_BYTES]) -> [u8; X25519_KEY_BYTES] {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        *secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(*peer_public))
            .as_bytes()
    }
}

/// Constant-time equality for fixed-size digests and proofs.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

// RFC 5054 3072-bit group (identical to the RFC 3526 group 15 prime),
// generator 5.
const SRP_N_HEX: &[u8] = b"\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

fn srp_group() -> &'static (BigUint, BigUint) {
    static GROUP: OnceLock<(BigUint, BigUint)> = OnceLock::new();
    GROUP.get_or_init(|| {
        let n = BigUint::parse_bytes(SRP_N_HEX, 16).unwrap();
        let g = BigUint::from(5u8);
        (n, g)
    })
}

fn pad_to_prime(value: &BigUint) -> [u8; SRP_PRIME_BYTES] {
    let bytes = value.to_bytes_be();
    let mut padded = [0u8; SRP_PRIME_BYTES];
    padded[SRP_PRIME_BYTES - bytes.len()..].copy_from_slice(&bytes);
    padded
}

/// `x = H(salt ‖ H(username ":" password))`, then `v = g^x mod N`.
pub fn srp_verifier(salt: &[u8], username: &[u8], password: &[u8]) -> Vec<u8> {
    let (n, g) = srp_group();
    let mut hasher = Sha512::new();
    hasher.update(username);
    hasher.update(b":");
    hasher.update(password);
    let identity: [u8; 64] = hasher.finalize().into();

    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(identity);
    let x: [u8; 64] = hasher.finalize().into();

    let x = BigUint::from_bytes_be(&x);
    let v = g.modpow(&x, n);
    pad_to_prime(&v).to_vec()
}

/// The SRP session key and the two proofs of the M3/M4 exchange.
pub struct SrpProof {
    pub session_key: [u8; 64],
    pub server_proof: [u8; 64],
}

/// Verifier-side SRP state for one Pair-Setup attempt.
pub struct SrpServer {
    secret: BigUint,
    public: [u8; SRP_PRIME_BYTES],
    verifier: BigUint,
    salt: [u8; SRP_SALT_BYTES],
}

impl Drop for SrpServer {
    fn drop(&mut self) {
        // BigUint offers no in-place scrub; drop the limbs through zeroed
        // replacements instead.
        self.secret = BigUint::default();
    }
}

impl SrpServer {
    /// `B = k·v + g^b mod N` with `k = H(N ‖ PAD(g))`.
    pub fn new(secret_b: &[u8; 32], salt: [u8; SRP_SALT_BYTES], verifier_bytes: &[u8]) -> Self {
        let (n, g) = srp_group();
        let verifier = BigUint::from_bytes_be(verifier_bytes);
        let secret = BigUint::from_bytes_be(secret_b);

        let mut hasher = Sha512::new();
        hasher.update(pad_to_prime(n));
        hasher.update(pad_to_prime(g));
        let k: [u8; 64] = hasher.finalize().into();
        let k = BigUint::from_bytes_be(&k);

        let public = (k * &verifier + g.modpow(&secret, n)) % n;
        SrpServer {
            secret,
            public: pad_to_prime(&public),
            verifier,
            salt,
        }
    }

    pub fn public_key(&self) -> &[u8; SRP_PRIME_BYTES] {
        &self.public
    }

    pub fn salt(&self) -> &[u8; SRP_SALT_BYTES] {
        &self.salt
    }

    /// Computes the shared session key from the client public key and
    /// checks the client proof `M1`. A public key that reduces to zero and
    /// a wrong proof are both `NotAuthorized`.
    pub fn verify_client(
        &self,
        username: &[u8],
        client_public: &[u8],
        client_proof: &[u8],
    ) -> Result<SrpProof> {
        let (n, g) = srp_group();
        if client_public.len() > SRP_PRIME_BYTES {
            return Err(Error::InvalidData);
        }
        let a = BigUint::from_bytes_be(client_public);
        if (&a % n) == BigUint::default() {
            return Err(Error::NotAuthorized);
        }

        let mut hasher = Sha512::new();
        hasher.update(pad_to_prime(&a));
        hasher.update(self.public);
        let u: [u8; 64] = hasher.finalize().into();
        let u = BigUint::from_bytes_be(&u);

        // S = (A · v^u)^b mod N
        let s = (&a * self.verifier.modpow(&u, n)).modpow(&self.secret, n);
        let session_key: [u8; 64] = sha512(&pad_to_prime(&s));

        let hn = sha512(&pad_to_prime(n));
        let hg = sha512(&pad_to_prime(g));
        let mut hn_xor_hg = [0u8; 64];
        for i in 0..64 {
            hn_xor_hg[i] = hn[i] ^ hg[i];
        }

        let mut hasher = Sha512::new();
        hasher.update(hn_xor_hg);
        hasher.update(sha512(username));
        hasher.update(self.salt);
        hasher.update(client_public);
        hasher.update(self.public);
        hasher.update(session_key);
        let expected_m1: [u8; 64] = hasher.finalize().into();

        if !ct_eq(&expected_m1, client_proof) {
            return Err(Error::NotAuthorized);
        }

        let mut hasher = Sha512::new();
        hasher.update(client_public);
        hasher.update(expected_m1);
        hasher.update(session_key);
        let server_proof: [u8; 64] = hasher.finalize().into();

        Ok(SrpProof {
            session_key,
            server_proof,
        })
    }
}

/// Client side of the SRP exchange. The accessory never runs this; it
/// exists so the test suite can drive Pair-Setup end to end.
pub struct SrpClient {
    secret: BigUint,
    public: [u8; SRP_PRIME_BYTES],
}

impl SrpClient {
    pub fn new(secret_a: &[u8; 32]) -> Self {
        let (n, g) = srp_group();
        let secret = BigUint::from_bytes_be(secret_a);
        let public = g.modpow(&secret, n);
        SrpClient {
            secret,
            public: pad_to_prime(&public),
        }
    }

    pub fn public_key(&self) -> &[u8; SRP_PRIME_BYTES] {
        &self.public
    }

    /// Derives the session key and client proof from the server public
    /// key, salt, and credentials.
    pub fn compute_proof(
        &self,
        salt: &[u8],
        server_public: &[u8],
        username: &[u8],
        password: &[u8],
    ) -> ([u8; 64], [u8; 64]) {
        let (n, g) = srp_group();
        let b_pub = BigUint::from_bytes_be(server_public);

        let mut hasher = Sha512::new();
        hasher.update(self.public);
        hasher.update(server_public);
        let u: [u8; 64] = hasher.finalize().into();
        let u = BigUint::from_bytes_be(&u);

        let mut hasher = Sha512::new();
        hasher.update(pad_to_prime(n));
        hasher.update(pad_to_prime(g));
        let k: [u8; 64] = hasher.finalize().into();
        let k = BigUint::from_bytes_be(&k);

        let mut hasher = Sha512::new();
        hasher.update(username);
        hasher.update(b":");
        hasher.update(password);
        let identity: [u8; 64] = hasher.finalize().into();
        let mut hasher = Sha512::new();
        hasher.update(salt);
        hasher.update(identity);
        let x: [u8; 64] = hasher.finalize().into();
        let x = BigUint::from_bytes_be(&x);

        // S = (B - k·g^x)^(a + u·x) mod N
        let gx = g.modpow(&x, n);
        let kgx = (k * &gx) % n;
        let base = ((&b_pub + n) - kgx) % n;
        let exponent = &self.secret + &u * &x;
        let s = base.modpow(&exponent, n);
        let session_key: [u8; 64] = sha512(&pad_to_prime(&s));

        let hn = sha512(&pad_to_prime(n));
        let hg = sha512(&pad_to_prime(g));
        let mut hn_xor_hg = [0u8; 64];
        for i in 0..64 {
            hn_xor_hg[i] = hn[i] ^ hg[i];
        }
        let mut hasher = Sha512::new();
        hasher.update(hn_xor_hg);
        hasher.update(sha512(username));
        hasher.update(salt);
        hasher.update(self.public);
        hasher.update(server_public);
        hasher.update(session_key);
        let proof: [u8; 64] = hasher.finalize().into();

        (session_key, proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_round_trip_and_tamper() {
        let key = [7u8; 32];
        let nonce = nonce_from_counter(3);
        let sealed = aead_seal(&key, &nonce, &[], b"attribute database");
        assert_eq!(sealed.len(), 18 + AEAD_TAG_BYTES);
        let opened = aead_open(&key, &nonce, &[], &sealed).unwrap();
        assert_eq!(opened, b"attribute database");

        let mut tampered = sealed.clone();
        tampered[0] ^= 1;
        assert_eq!(aead_open(&key, &nonce, &[], &tampered), Err(Error::InvalidData));
        // Wrong nonce fails too.
        assert_eq!(
            aead_open(&key, &nonce_from_counter(4), &[], &sealed),
            Err(Error::InvalidData)
        );
    }

    #[test]
    fn aead_authenticates_aad() {
        let key = [9u8; 32];
        let nonce = nonce_from_label(b"PS-Msg05");
        let sealed = aead_seal(&key, &nonce, &[0x02, 0x00], b"payload");
        assert!(aead_open(&key, &nonce, &[0x02, 0x00], &sealed).is_ok());
        assert_eq!(
            aead_open(&key, &nonce, &[0x03, 0x00], &sealed),
            Err(Error::InvalidData)
        );
    }

    #[test]
    fn counter_nonce_layout() {
        let nonce = nonce_from_counter(0x0102_0304_0506_0708);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn ed25519_sign_verify() {
        let secret = Ed25519SecretKey([0x42; 32]);
        let public = secret.public_key();
        let signature = secret.sign(b"pair-setup m5");
        assert!(ed25519_verify(&public, b"pair-setup m5", &signature).is_ok());
        assert_eq!(
            ed25519_verify(&public, b"pair-setup m6", &signature),
            Err(Error::NotAuthorized)
        );
    }

    #[test]
    fn x25519_agreement() {
        let a = X25519SecretKey([0x11; 32]);
        let b = X25519SecretKey([0x22; 32]);
        let shared_ab = a.shared_secret(&b.public_key());
        let shared_ba = b.shared_secret(&a.public_key());
        assert_eq!(shared_ab, shared_ba);
        assert_ne!(shared_ab, [0u8; 32]);
    }

    #[test]
    fn hkdf_derives_distinct_keys_per_info() {
        let ikm = [3u8; 32];
        let read = derive_key(&ikm, b"Control-Salt", b"Control-Read-Encryption-Key");
        let write = derive_key(&ikm, b"Control-Salt", b"Control-Write-Encryption-Key");
        assert_ne!(read, write);
    }

    #[test]
    fn srp_exchange_agrees() {
        let salt = [5u8; SRP_SALT_BYTES];
        let username = b"Pair-Setup";
        let password = b"111-22-333";
        let verifier = srp_verifier(&salt, username, password);

        let server = SrpServer::new(&[0x31; 32], salt, &verifier);
        let client = SrpClient::new(&[0x77; 32]);
        let (client_key, client_proof) =
            client.compute_proof(&salt, server.public_key(), username, password);

        let proof = server
            .verify_client(username, client.public_key(), &client_proof)
            .unwrap();
        assert_eq!(proof.session_key, client_key);
    }

    #[test]
    fn srp_rejects_wrong_password() {
        let salt = [5u8; SRP_SALT_BYTES];
        let verifier = srp_verifier(&salt, b"Pair-Setup", b"111-22-333");
        let server = SrpServer::new(&[0x31; 32], salt, &verifier);
        let client = SrpClient::new(&[0x77; 32]);
        let (_, wrong_proof) =
            client.compute_proof(&salt, server.public_key(), b"Pair-Setup", b"999-88-777");
        assert!(matches!(
            server.verify_client(b"Pair-Setup", client.public_key(), &wrong_proof),
            Err(Error::NotAuthorized)
        ));
    }

    #[test]
    fn srp_rejects_zero_public_key() {
        let salt = [5u8; SRP_SALT_BYTES];
        let verifier = srp_verifier(&salt, b"Pair-Setup", b"111-22-333");
        let server = SrpServer::new(&[0x31; 32], salt, &verifier);
        assert!(matches!(
            server.verify_client(b"Pair-Setup", &[0u8; SRP_PRIME_BYTES], &[0u8; 64]),
            Err(Error::NotAuthorized)
        ));
    }
}
