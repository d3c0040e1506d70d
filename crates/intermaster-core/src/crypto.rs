//! Cryptographic primitives for inter-master sessions.
//!
//! Provides four things:
//!   1. BLAKE3 hashing and key folding
//!   2. Long-term Ed25519 identity key pairs and identity proofs
//!   3. Ephemeral X25519 key exchange
//!   4. The ChaCha20-Poly1305 record cipher used after key exchange
//!
//! The key exchange is deliberately unauthenticated. Identity is proven
//! afterwards, inside the encrypted stream, by signing the session
//! transcript with the long-term key.
//!
//! All secret material is zeroized on drop. There is no unsafe code in
//! this module.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// XOR-fold `input` down to `len` bytes.
///
/// Byte `i` of the input lands in byte `i % len` of the output. Inputs
/// shorter than `len` are zero-extended.
pub fn fold(input: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    if len == 0 {
        return out;
    }
    for (i, b) in input.iter().enumerate() {
        out[i % len] ^= b;
    }
    out
}

const TRANSCRIPT_CONTEXT: &str = "intermaster 2024-01 session transcript";
const PROOF_CONTEXT: &[u8] = b"intermaster identity proof";

// ── Identity ──────────────────────────────────────────────────────────────────

/// A master's long-term name: the bytes of its Ed25519 public key.
///
/// Equality, ordering and hashing are all by key bytes. Serialized as
/// lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; 32]);

impl Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::MalformedIdentity)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::MalformedIdentity)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Colon-separated digest of the key, e.g. `3f:a0:…:1c` (16 bytes).
    pub fn fingerprint(&self) -> String {
        hash(&self.0)[..16]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Check that the bytes are a valid Ed25519 point.
    pub fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::MalformedIdentity)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Identity::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Which end of the stream a party is on. Sent explicitly during key
/// exchange and mixed into identity proofs so a proof cannot be reflected
/// back at its author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn as_byte(self) -> u8 {
        match self {
            Role::Initiator => 1,
            Role::Responder => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Role::Initiator),
            2 => Some(Role::Responder),
            _ => None,
        }
    }

    pub fn peer(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// A master's long-term Ed25519 key pair.
///
/// Supplied once at startup and shared read-only across handshakes. The
/// signing key never leaves this struct; `seed()` exists only so the
/// daemon can persist it.
pub struct IdentityKeypair {
    signing: SigningKey,
    identity: Identity,
}

impl IdentityKeypair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild a key pair from its 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let seed = Zeroizing::new(seed);
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let identity = Identity(signing.verifying_key().to_bytes());
        Self { signing, identity }
    }

    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Sign the transcript of a session on behalf of `role`.
    pub fn prove(&self, role: Role, transcript_hash: &[u8; 32]) -> [u8; 64] {
        self.signing
            .sign(&proof_message(role, transcript_hash))
            .to_bytes()
    }
}

fn proof_message(role: Role, transcript_hash: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(PROOF_CONTEXT.len() + 1 + 32);
    msg.extend_from_slice(PROOF_CONTEXT);
    msg.push(role.as_byte());
    msg.extend_from_slice(transcript_hash);
    msg
}

/// Verify that `identity` signed this session's transcript as `role`.
pub fn verify_identity_proof(
    identity: &Identity,
    role: Role,
    transcript_hash: &[u8; 32],
    signature: &[u8; 64],
) -> Result<(), CryptoError> {
    let key = identity.verifying_key()?;
    let signature = Signature::from_bytes(signature);
    key.verify_strict(&proof_message(role, transcript_hash), &signature)
        .map_err(|_| CryptoError::BadProof)
}

// ── Key exchange ──────────────────────────────────────────────────────────────

/// One side of an ephemeral X25519 exchange.
///
/// A fresh secret is generated per handshake and consumed by
/// [`KeyExchange::complete`].
pub struct KeyExchange {
    role: Role,
    secret: EphemeralSecret,
    public: [u8; 32],
}

impl KeyExchange {
    pub fn new(role: Role) -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = *PublicKey::from(&secret).as_bytes();
        Self {
            role,
            secret,
            public,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Our ephemeral public key, sent in the clear.
    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    /// Combine with the peer's ephemeral public key.
    ///
    /// Rejects low-order peer keys, which would force a known shared
    /// secret.
    pub fn complete(self, peer_public: &[u8; 32]) -> Result<SessionKeys, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakPeerKey);
        }

        // Transcript order is fixed by role so both sides agree.
        let (initiator_public, responder_public) = match self.role {
            Role::Initiator => (self.public, *peer_public),
            Role::Responder => (*peer_public, self.public),
        };

        let mut hasher = blake3::Hasher::new_derive_key(TRANSCRIPT_CONTEXT);
        hasher.update(shared.as_bytes());
        hasher.update(&initiator_public);
        hasher.update(&responder_public);
        let mut block = Zeroizing::new([0u8; 64]);
        hasher.finalize_xof().fill(&mut block[..]);

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&fold(&block[..], 32));

        let mut binding = Vec::with_capacity(96);
        binding.extend_from_slice(&initiator_public);
        binding.extend_from_slice(&responder_public);
        binding.extend_from_slice(&block[32..]);
        let transcript_hash = hash(&binding);
        binding.zeroize();

        Ok(SessionKeys {
            role: self.role,
            key,
            transcript_hash,
        })
    }
}

/// Output of a completed key exchange.
pub struct SessionKeys {
    role: Role,
    key: Zeroizing<[u8; 32]>,
    transcript_hash: [u8; 32],
}

impl SessionKeys {
    /// Channel binding: depends on the shared secret and both ephemeral
    /// keys. Identity proofs sign this value.
    pub fn transcript_hash(&self) -> &[u8; 32] {
        &self.transcript_hash
    }

    /// Stable identifier, identical on both sides.
    pub fn session_id(&self) -> [u8; 32] {
        hash(&self.transcript_hash)
    }

    /// Split into the sealing half (our direction) and the opening half
    /// (the peer's direction).
    pub fn into_record_cipher(self) -> (RecordSealer, RecordOpener) {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key[..]));
        let (send_dir, recv_dir) = match self.role {
            Role::Initiator => (DIR_INITIATOR, DIR_RESPONDER),
            Role::Responder => (DIR_RESPONDER, DIR_INITIATOR),
        };
        (
            RecordSealer {
                cipher: cipher.clone(),
                direction: send_dir,
                counter: 0,
            },
            RecordOpener {
                cipher,
                direction: recv_dir,
                counter: 0,
            },
        )
    }
}

// ── Record cipher ─────────────────────────────────────────────────────────────

/// Poly1305 tag appended to every sealed record.
pub const TAG_LEN: usize = 16;

const DIR_INITIATOR: u8 = 0x01;
const DIR_RESPONDER: u8 = 0x02;

/// Nonce layout: `[direction, 0, 0, 0, counter (8 bytes LE)]`.
///
/// Both directions share one key, so the direction byte keeps their nonce
/// spaces disjoint.
pub fn construct_nonce(direction: u8, counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = direction;
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypts outgoing records. Counters are implicit: the stream is ordered,
/// so the n-th record sealed is the n-th record opened.
pub struct RecordSealer {
    cipher: ChaCha20Poly1305,
    direction: u8,
    counter: u64,
}

impl RecordSealer {
    /// Returns `plaintext.len() + TAG_LEN` bytes. The counter only moves
    /// when a record is produced.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let next = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)?;
        let nonce = construct_nonce(self.direction, self.counter);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[self.direction],
                },
            )
            .map_err(|_| CryptoError::Seal)?;
        self.counter = next;
        Ok(sealed)
    }
}

/// Decrypts incoming records. A failure poisons nothing by itself, but
/// callers must treat it as fatal to the stream.
pub struct RecordOpener {
    cipher: ChaCha20Poly1305,
    direction: u8,
    counter: u64,
}

impl RecordOpener {
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        let nonce = construct_nonce(self.direction, self.counter);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[self.direction],
                },
            )
            .map_err(|_| CryptoError::Open)?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)?;
        Ok(plaintext)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed identity key")]
    MalformedIdentity,

    #[error("identity proof signature does not verify")]
    BadProof,

    #[error("peer ephemeral key is low-order")]
    WeakPeerKey,

    #[error("record encryption failed")]
    Seal,

    #[error("record authentication failed")]
    Open,

    #[error("record shorter than the 16-byte tag")]
    TooShort,

    #[error("record counter exhausted")]
    CounterExhausted,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> (SessionKeys, SessionKeys) {
        let i = KeyExchange::new(Role::Initiator);
        let r = KeyExchange::new(Role::Responder);
        let i_pub = *i.public();
        let r_pub = *r.public();
        (i.complete(&r_pub).unwrap(), r.complete(&i_pub).unwrap())
    }

    #[test]
    fn fold_xors_overflow_into_prefix() {
        assert_eq!(fold(&[1, 2, 3, 4], 2), vec![1 ^ 3, 2 ^ 4]);
        assert_eq!(fold(&[0xff], 3), vec![0xff, 0, 0]);
        assert!(fold(&[1, 2], 0).is_empty());
    }

    #[test]
    fn identity_hex_roundtrip_and_fingerprint() {
        let kp = IdentityKeypair::generate();
        let id = kp.identity();
        assert_eq!(Identity::from_hex(&id.to_hex()).unwrap(), id);
        assert_eq!(id.fingerprint().split(':').count(), 16);
        assert!(Identity::from_hex("abcd").is_err());
    }

    #[test]
    fn identity_serializes_as_hex_string() {
        let id = IdentityKeypair::generate().identity();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn keypair_seed_roundtrip() {
        let kp = IdentityKeypair::generate();
        let again = IdentityKeypair::from_seed(*kp.seed());
        assert_eq!(kp.identity(), again.identity());
    }

    #[test]
    fn both_sides_derive_same_transcript() {
        let (i, r) = exchange();
        assert_eq!(i.transcript_hash(), r.transcript_hash());
        assert_eq!(i.session_id(), r.session_id());
    }

    #[test]
    fn separate_exchanges_differ() {
        let (a, _) = exchange();
        let (b, _) = exchange();
        assert_ne!(a.transcript_hash(), b.transcript_hash());
    }

    #[test]
    fn low_order_peer_key_rejected() {
        let i = KeyExchange::new(Role::Initiator);
        assert!(matches!(i.complete(&[0u8; 32]), Err(CryptoError::WeakPeerKey)));
    }

    #[test]
    fn identity_proof_verifies_for_signer_and_role() {
        let kp = IdentityKeypair::generate();
        let (keys, _) = exchange();
        let sig = kp.prove(Role::Initiator, keys.transcript_hash());

        verify_identity_proof(&kp.identity(), Role::Initiator, keys.transcript_hash(), &sig)
            .unwrap();
    }

    #[test]
    fn identity_proof_rejects_wrong_role_key_or_transcript() {
        let kp = IdentityKeypair::generate();
        let other = IdentityKeypair::generate();
        let (keys, _) = exchange();
        let (keys2, _) = exchange();
        let sig = kp.prove(Role::Initiator, keys.transcript_hash());

        // reflected back with the opposite role
        assert!(verify_identity_proof(
            &kp.identity(),
            Role::Responder,
            keys.transcript_hash(),
            &sig
        )
        .is_err());
        // claimed by someone else
        assert!(verify_identity_proof(
            &other.identity(),
            Role::Initiator,
            keys.transcript_hash(),
            &sig
        )
        .is_err());
        // replayed into another session
        assert!(verify_identity_proof(
            &kp.identity(),
            Role::Initiator,
            keys2.transcript_hash(),
            &sig
        )
        .is_err());
    }

    #[test]
    fn records_roundtrip_both_directions() {
        let (i, r) = exchange();
        let (mut i_seal, mut i_open) = i.into_record_cipher();
        let (mut r_seal, mut r_open) = r.into_record_cipher();

        let ct = i_seal.seal(b"ping").unwrap();
        assert_eq!(ct.len(), 4 + 16);
        assert_eq!(r_open.open(&ct).unwrap(), b"ping");

        let ct = r_seal.seal(b"pong").unwrap();
        assert_eq!(i_open.open(&ct).unwrap(), b"pong");
    }

    #[test]
    fn reordered_or_replayed_record_rejected() {
        let (i, r) = exchange();
        let (mut seal, _) = i.into_record_cipher();
        let (_, mut open) = r.into_record_cipher();

        let first = seal.seal(b"one").unwrap();
        let second = seal.seal(b"two").unwrap();

        assert!(open.open(&second).is_err(), "out-of-order record must fail");
        assert_eq!(open.open(&first).unwrap(), b"one");
        assert!(open.open(&first).is_err(), "replayed record must fail");
    }

    #[test]
    fn tampered_record_rejected() {
        let (i, r) = exchange();
        let (mut seal, _) = i.into_record_cipher();
        let (_, mut open) = r.into_record_cipher();

        let mut ct = seal.seal(b"important").unwrap();
        ct[2] ^= 0x40;
        assert!(matches!(open.open(&ct), Err(CryptoError::Open)));
        assert!(matches!(open.open(&[0u8; 8]), Err(CryptoError::TooShort)));
    }

    #[test]
    fn own_direction_cannot_be_opened_by_self() {
        let (i, _) = exchange();
        let (mut seal, mut open) = i.into_record_cipher();
        let ct = seal.seal(b"loop").unwrap();
        assert!(open.open(&ct).is_err());
    }
}
