//! Destination identities and packet signature handling.
//!
//! A destination is addressed by the SHA-256 hash of its serialized identity.
//! The identity is self-delimited on the wire: a big-endian signature-type
//! code followed by the verifying key whose length the code determines, which
//! is what lets it sit inside a packet's options region without a length
//! prefix.
//!
//! Destinations may delegate to a *transient* key via an offline signature
//! block: the long-term key signs an expiry plus a short-lived verifying key,
//! and packets are then signed with the short-lived key. Verification prefers
//! a transient verifier published in the leaseset and falls back to the
//! in-band block.

use std::fmt;

use bytes::{BufMut, Bytes};
use ring::digest;
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair};
use thiserror::Error;

/// SHA-256 hash of a serialized identity; the address of a destination
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct IdentHash(pub [u8; 32]);

impl IdentHash {
    /// The raw hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…")
    }
}

impl fmt::Display for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Signature algorithm codes used on the wire
///
/// Parsing recognizes every assigned code so a foreign identity can be
/// skipped over, but only the elliptic schemes are accepted; RSA and DSA
/// peers are rejected at the handshake.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SigType {
    /// Legacy DSA-SHA1 (code 0); recognized, never accepted
    DsaSha1,
    /// ECDSA over P-256 with SHA-256 (code 1); verify only
    EcdsaP256,
    /// RSA variants (codes 4–6); recognized, never accepted
    Rsa(u16),
    /// Ed25519 (code 7); the native signing scheme
    Ed25519,
    /// RedDSA (code 11); recognized, never accepted
    RedDsa,
}

impl SigType {
    pub(crate) fn from_code(code: u16) -> Result<Self, IdentityError> {
        match code {
            0 => Ok(SigType::DsaSha1),
            1 => Ok(SigType::EcdsaP256),
            4..=6 => Ok(SigType::Rsa(code)),
            7 => Ok(SigType::Ed25519),
            11 => Ok(SigType::RedDsa),
            _ => Err(IdentityError::UnknownSigType(code)),
        }
    }

    pub(crate) fn code(self) -> u16 {
        match self {
            SigType::DsaSha1 => 0,
            SigType::EcdsaP256 => 1,
            SigType::Rsa(code) => code,
            SigType::Ed25519 => 7,
            SigType::RedDsa => 11,
        }
    }

    /// Length of a verifying key of this type
    pub(crate) fn public_key_len(self) -> usize {
        match self {
            SigType::DsaSha1 => 128,
            SigType::EcdsaP256 => 64,
            SigType::Rsa(4) => 256,
            SigType::Rsa(5) => 384,
            SigType::Rsa(_) => 512,
            SigType::Ed25519 | SigType::RedDsa => 32,
        }
    }

    /// Length of a signature produced by this type
    pub(crate) fn signature_len(self) -> usize {
        match self {
            SigType::DsaSha1 => 40,
            SigType::EcdsaP256 => 64,
            SigType::Rsa(4) => 256,
            SigType::Rsa(5) => 384,
            SigType::Rsa(_) => 512,
            SigType::Ed25519 | SigType::RedDsa => 64,
        }
    }

    /// Whether this implementation can verify signatures of this type
    pub(crate) fn verification_supported(self) -> bool {
        matches!(self, SigType::EcdsaP256 | SigType::Ed25519)
    }
}

/// A verifying key, either a destination's long-term key or a transient one
#[derive(Debug, Clone)]
pub struct Verifier {
    sig_type: SigType,
    key: Bytes,
}

impl Verifier {
    pub(crate) fn new(sig_type: SigType, key: Bytes) -> Result<Self, IdentityError> {
        if !sig_type.verification_supported() {
            return Err(IdentityError::UnsupportedSigner(sig_type.code()));
        }
        if key.len() != sig_type.public_key_len() {
            return Err(IdentityError::Malformed);
        }
        Ok(Self { sig_type, key })
    }

    /// Length of the signatures this key produces
    pub fn signature_len(&self) -> usize {
        self.sig_type.signature_len()
    }

    /// Length of the key itself as serialized on the wire
    pub fn public_key_len(&self) -> usize {
        self.key.len()
    }

    /// Verify `sig` over `msg`
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        if sig.len() != self.sig_type.signature_len() {
            return false;
        }
        match self.sig_type {
            SigType::Ed25519 => {
                signature::UnparsedPublicKey::new(&signature::ED25519, &self.key)
                    .verify(msg, sig)
                    .is_ok()
            }
            SigType::EcdsaP256 => {
                // ring expects an uncompressed SEC1 point
                let mut point = Vec::with_capacity(65);
                point.push(0x04);
                point.extend_from_slice(&self.key);
                signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, point)
                    .verify(msg, sig)
                    .is_ok()
            }
            _ => false,
        }
    }
}

/// A destination's public identity
#[derive(Debug, Clone)]
pub struct Identity {
    verifier: Verifier,
    hash: IdentHash,
}

impl Identity {
    /// Parse a self-delimited identity from the front of `data`
    ///
    /// Returns the identity and the number of bytes it occupied. Identities
    /// with an unverifiable signature scheme parse far enough to be skipped,
    /// then fail with [`IdentityError::UnsupportedSigner`].
    pub fn parse(data: &[u8]) -> Result<(Self, usize), IdentityError> {
        if data.len() < 2 {
            return Err(IdentityError::Truncated);
        }
        let sig_type = SigType::from_code(u16::from_be_bytes([data[0], data[1]]))?;
        let key_len = sig_type.public_key_len();
        if data.len() < 2 + key_len {
            return Err(IdentityError::Truncated);
        }
        let verifier = Verifier::new(sig_type, Bytes::copy_from_slice(&data[2..2 + key_len]))?;
        let hash = Self::hash_serialized(sig_type, &verifier.key);
        Ok((Self { verifier, hash }, 2 + key_len))
    }

    fn hash_serialized(sig_type: SigType, key: &[u8]) -> IdentHash {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&sig_type.code().to_be_bytes());
        ctx.update(key);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(ctx.finish().as_ref());
        IdentHash(hash)
    }

    /// Number of bytes `write_to` emits
    pub fn serialized_len(&self) -> usize {
        2 + self.verifier.key.len()
    }

    /// Append the wire form to `buf`
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u16(self.verifier.sig_type.code());
        buf.put_slice(&self.verifier.key);
    }

    /// The destination's address
    pub fn hash(&self) -> &IdentHash {
        &self.hash
    }

    /// The long-term verifying key
    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    /// Length of signatures made with the long-term key
    pub fn signature_len(&self) -> usize {
        self.verifier.signature_len()
    }

    /// Verify a signature made with the long-term key
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        self.verifier.verify(msg, sig)
    }
}

/// An offline-signature block: a transient key endorsed by the long-term key
///
/// Wire form: expiry (4 bytes, seconds since the Unix epoch), transient
/// signature type (2 bytes), transient verifying key, then a signature by the
/// *long-term* key over everything preceding it.
#[derive(Debug, Clone)]
pub struct OfflineSignature {
    bytes: Bytes,
    verifier: Verifier,
    expires: u32,
}

impl OfflineSignature {
    /// Parse and authenticate a block from the front of `data`
    pub fn parse(
        identity: &Identity,
        data: &[u8],
        now_unix_secs: u64,
    ) -> Result<(Self, usize), IdentityError> {
        if data.len() < 6 {
            return Err(IdentityError::Truncated);
        }
        let expires = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let sig_type = SigType::from_code(u16::from_be_bytes([data[4], data[5]]))?;
        let key_len = sig_type.public_key_len();
        let signed_len = 6 + key_len;
        let total = signed_len + identity.signature_len();
        if data.len() < total {
            return Err(IdentityError::Truncated);
        }
        if u64::from(expires) < now_unix_secs {
            return Err(IdentityError::ExpiredOfflineSignature);
        }
        if !identity.verify(&data[..signed_len], &data[signed_len..total]) {
            return Err(IdentityError::BadSignature);
        }
        let verifier = Verifier::new(sig_type, Bytes::copy_from_slice(&data[6..6 + key_len]))?;
        Ok((
            Self {
                bytes: Bytes::copy_from_slice(&data[..total]),
                verifier,
                expires,
            },
            total,
        ))
    }

    /// The transient verifier endorsed by this block
    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    /// Expiry, in seconds since the Unix epoch
    pub fn expires(&self) -> u32 {
        self.expires
    }

    /// The raw wire form, for inclusion in handshake options
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A destination's signing material: identity plus the Ed25519 secret, and
/// optionally a transient key with its offline-signature block
pub struct PrivateKeys {
    identity: Identity,
    signing_key: Ed25519KeyPair,
    offline: Option<(OfflineSignature, Ed25519KeyPair)>,
}

impl PrivateKeys {
    /// Generate a fresh Ed25519 destination
    pub fn generate() -> Result<Self, IdentityError> {
        let rng = SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| IdentityError::KeyRejected)?;
        let key = Ed25519KeyPair::from_pkcs8(doc.as_ref()).map_err(|_| IdentityError::KeyRejected)?;
        Self::from_key(key)
    }

    /// Deterministic construction from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, IdentityError> {
        let key =
            Ed25519KeyPair::from_seed_unchecked(seed).map_err(|_| IdentityError::KeyRejected)?;
        Self::from_key(key)
    }

    /// Deterministic construction that signs with a transient key derived
    /// from `transient_seed`, endorsed by the long-term key until
    /// `expires_unix_secs`
    pub fn from_seed_with_transient(
        seed: &[u8; 32],
        transient_seed: &[u8; 32],
        expires_unix_secs: u32,
    ) -> Result<Self, IdentityError> {
        let mut keys = Self::from_seed(seed)?;
        let transient = Ed25519KeyPair::from_seed_unchecked(transient_seed)
            .map_err(|_| IdentityError::KeyRejected)?;
        let mut signed = Vec::new();
        signed.put_u32(expires_unix_secs);
        signed.put_u16(SigType::Ed25519.code());
        signed.put_slice(transient.public_key().as_ref());
        let endorsement = keys.signing_key.sign(&signed);
        signed.extend_from_slice(endorsement.as_ref());
        let (offline, _) = OfflineSignature::parse(&keys.identity, &signed, 0)?;
        keys.offline = Some((offline, transient));
        Ok(keys)
    }

    fn from_key(signing_key: Ed25519KeyPair) -> Result<Self, IdentityError> {
        let public = Bytes::copy_from_slice(signing_key.public_key().as_ref());
        let verifier = Verifier::new(SigType::Ed25519, public.clone())?;
        let hash = Identity::hash_serialized(SigType::Ed25519, &public);
        Ok(Self {
            identity: Identity { verifier, hash },
            signing_key,
            offline: None,
        })
    }

    /// The public identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether packets are signed with a transient key
    pub fn is_offline_signature(&self) -> bool {
        self.offline.is_some()
    }

    /// The offline-signature block to embed in handshakes, if any
    pub fn offline_signature(&self) -> Option<&OfflineSignature> {
        self.offline.as_ref().map(|(sig, _)| sig)
    }

    /// Length of the signatures `sign` produces
    pub fn signature_len(&self) -> usize {
        SigType::Ed25519.signature_len()
    }

    /// Sign `msg` with the transient key if present, else the long-term key
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let key = match &self.offline {
            Some((_, transient)) => transient,
            None => &self.signing_key,
        };
        key.sign(msg).as_ref().to_vec()
    }
}

impl fmt::Debug for PrivateKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeys")
            .field("identity", self.identity.hash())
            .field("offline", &self.offline.is_some())
            .finish()
    }
}

/// Identity and signature processing failures
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum IdentityError {
    /// Identity or offline-signature block cut short
    #[error("truncated identity data")]
    Truncated,
    /// Signature type code not assigned
    #[error("unknown signature type {0}")]
    UnknownSigType(u16),
    /// Recognized scheme this implementation refuses (RSA, DSA, RedDSA)
    #[error("unsupported signer type {0}")]
    UnsupportedSigner(u16),
    /// Structurally invalid key material
    #[error("malformed identity")]
    Malformed,
    /// Offline-signature block past its expiry
    #[error("offline signature expired")]
    ExpiredOfflineSignature,
    /// Endorsement of a transient key did not verify
    #[error("bad signature")]
    BadSignature,
    /// Key material rejected by the crypto backend
    #[error("key rejected")]
    KeyRejected,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn identity_round_trip() {
        let keys = PrivateKeys::from_seed(&[7u8; 32]).unwrap();
        let mut buf = Vec::new();
        keys.identity().write_to(&mut buf);
        buf.extend_from_slice(b"trailing");
        let (parsed, consumed) = Identity::parse(&buf).unwrap();
        assert_eq!(consumed, keys.identity().serialized_len());
        assert_eq!(parsed.hash(), keys.identity().hash());
    }

    #[test]
    fn sign_and_verify() {
        let keys = PrivateKeys::from_seed(&[1u8; 32]).unwrap();
        let sig = keys.sign(b"payload");
        assert_eq!(sig.len(), keys.signature_len());
        assert!(keys.identity().verify(b"payload", &sig));
        assert!(!keys.identity().verify(b"tampered", &sig));
    }

    #[test]
    fn rsa_identity_is_rejected_but_sized() {
        let mut buf = vec![0u8, 4]; // RSA-SHA256-2048
        buf.extend_from_slice(&[0u8; 256]);
        assert_matches!(
            Identity::parse(&buf),
            Err(IdentityError::UnsupportedSigner(4))
        );
    }

    #[test]
    fn transient_key_signs_and_verifies() {
        let keys =
            PrivateKeys::from_seed_with_transient(&[2u8; 32], &[3u8; 32], 4_000_000_000).unwrap();
        assert!(keys.is_offline_signature());
        let offline = keys.offline_signature().unwrap();

        // a peer parses the block out of the options region
        let (parsed, consumed) =
            OfflineSignature::parse(keys.identity(), offline.as_bytes(), 1_000).unwrap();
        assert_eq!(consumed, offline.as_bytes().len());

        let sig = keys.sign(b"msg");
        assert!(parsed.verifier().verify(b"msg", &sig));
        // the long-term key did not make this signature
        assert!(!keys.identity().verify(b"msg", &sig));
    }

    #[test]
    fn expired_offline_signature() {
        let keys = PrivateKeys::from_seed_with_transient(&[2u8; 32], &[3u8; 32], 100).unwrap();
        let bytes = keys.offline_signature().unwrap().as_bytes().to_vec();
        assert_matches!(
            OfflineSignature::parse(keys.identity(), &bytes, 101),
            Err(IdentityError::ExpiredOfflineSignature)
        );
    }

    #[test]
    fn tampered_endorsement_fails() {
        let keys =
            PrivateKeys::from_seed_with_transient(&[5u8; 32], &[6u8; 32], 4_000_000_000).unwrap();
        let mut bytes = keys.offline_signature().unwrap().as_bytes().to_vec();
        bytes[8] ^= 1; // flip a transient-key bit
        assert_matches!(
            OfflineSignature::parse(keys.identity(), &bytes, 0),
            Err(IdentityError::BadSignature)
        );
    }
}
