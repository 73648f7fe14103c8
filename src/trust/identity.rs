// trust/identity.rs - Public Keys, Fingerprints and Sub-Key Identifiers

use ed25519_dalek::{Signature as Ed25519Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised when key material or a certificate fails an integrity check
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("Fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("Key ID mismatch: expected {expected}, got {actual}")]
    KeyIdMismatch { expected: KeyId, actual: KeyId },

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Certificate is not signed")]
    Unsigned,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Not a self-signature: issuer {issuer}, subject {subject}")]
    NotSelfSigned {
        issuer: Fingerprint,
        subject: Fingerprint,
    },

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),
}

/// An ed25519 master or signing public key
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Parse a public key, rejecting points that are not valid ed25519 keys
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IntegrityError> {
        let raw: [u8; PUBLIC_KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| IntegrityError::InvalidKeyLength {
                    expected: PUBLIC_KEY_LENGTH,
                    got: bytes.len(),
                })?;

        VerifyingKey::from_bytes(&raw).map_err(|_| IntegrityError::InvalidPublicKey)?;
        Ok(Self(raw))
    }

    pub(crate) fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }

    /// The encoded key, as folded into fingerprints and certificate digests
    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    /// Get the fingerprint of this key
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }

    /// Verify a signature made by this key over `data`
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), IntegrityError> {
        if signature.is_empty() {
            return Err(IntegrityError::Unsigned);
        }

        let sig_bytes: [u8; SIGNATURE_LENGTH] =
            signature
                .try_into()
                .map_err(|_| IntegrityError::InvalidKeyLength {
                    expected: SIGNATURE_LENGTH,
                    got: signature.len(),
                })?;

        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| IntegrityError::InvalidPublicKey)?;

        verifying_key
            .verify(data, &Ed25519Signature::from_bytes(&sig_bytes))
            .map_err(|_| IntegrityError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint().short())
    }
}

/// A unique fingerprint derived from a public key
///
/// `SHA256(0x99 || be32(len(key)) || key)`, the same framing OpenPGP uses for
/// v4 key fingerprints.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const SIZE: usize = 32;
    const TAG: u8 = 0x99;

    /// Compute the fingerprint of a public key
    pub fn of(public_key: &PublicKey) -> Self {
        Self::from_key_bytes(public_key.encoded())
    }

    /// Compute the fingerprint of raw encoded key bytes
    pub fn from_key_bytes(key: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([Self::TAG]);
        hasher.update((key.len() as u32).to_be_bytes());
        hasher.update(key);
        Self(hasher.finalize().into())
    }

    /// Create from raw digest bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for display (first 8 bytes as hex)
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Fingerprint {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| IntegrityError::InvalidEncoding(e.to_string()))?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IntegrityError::InvalidKeyLength {
                expected: Self::SIZE,
                got: bytes.len(),
            })?;
        Ok(Self(raw))
    }
}

/// Short identifier of a sub-key: the trailing 8 bytes of its raw encoding
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId([u8; 8]);

impl KeyId {
    pub const SIZE: usize = 8;

    /// Derive the key ID of a raw sub-key
    pub fn of(subkey: &[u8]) -> Result<Self, IntegrityError> {
        if subkey.len() < Self::SIZE {
            return Err(IntegrityError::InvalidKeyLength {
                expected: Self::SIZE,
                got: subkey.len(),
            });
        }

        let mut raw = [0u8; Self::SIZE];
        raw.copy_from_slice(&subkey[subkey.len() - Self::SIZE..]);
        Ok(Self(raw))
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for KeyId {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| IntegrityError::InvalidEncoding(e.to_string()))?;
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IntegrityError::InvalidKeyLength {
                expected: Self::SIZE,
                got: bytes.len(),
            })?;
        Ok(Self(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::keys::{KeyManager, SoftwareKeyManager};

    #[test]
    fn test_fingerprint_framing() {
        let keys = SoftwareKeyManager::generate();
        let key = keys.public_key();

        let mut hasher = Sha256::new();
        hasher.update([0x99u8]);
        hasher.update([0u8, 0, 0, 32]);
        hasher.update(key.encoded());
        let expected: [u8; 32] = hasher.finalize().into();

        assert_eq!(key.fingerprint().as_bytes(), &expected);
        assert_eq!(key.fingerprint(), keys.fingerprint());
    }

    #[test]
    fn test_fingerprint_display_roundtrip() {
        let fp = SoftwareKeyManager::generate().fingerprint();

        assert_eq!(fp.short().len(), 16);
        assert_eq!(fp.to_string().len(), 64);
        assert_eq!(fp.to_string().parse::<Fingerprint>().unwrap(), fp);
        assert!("abcd".parse::<Fingerprint>().is_err());
        assert!("zz".repeat(32).parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_key_id_is_trailing_bytes() {
        let subkey: Vec<u8> = (0u8..20).collect();
        let id = KeyId::of(&subkey).unwrap();

        assert_eq!(id.as_bytes(), &[12, 13, 14, 15, 16, 17, 18, 19]);
        assert_eq!(id.to_string().parse::<KeyId>().unwrap(), id);
    }

    #[test]
    fn test_key_id_rejects_short_keys() {
        assert!(matches!(
            KeyId::of(&[1, 2, 3]),
            Err(IntegrityError::InvalidKeyLength { expected: 8, got: 3 })
        ));
    }

    #[test]
    fn test_public_key_verify() {
        let keys = SoftwareKeyManager::generate();
        let signature = keys.sign(b"hello world").unwrap();

        assert!(keys.public_key().verify(b"hello world", &signature).is_ok());
        assert_eq!(
            keys.public_key().verify(b"wrong data", &signature),
            Err(IntegrityError::InvalidSignature)
        );
        assert_eq!(
            keys.public_key().verify(b"hello world", &[]),
            Err(IntegrityError::Unsigned)
        );
    }

    #[test]
    fn test_public_key_from_bytes() {
        let key = SoftwareKeyManager::generate().public_key().clone();

        assert_eq!(PublicKey::from_bytes(key.encoded()).unwrap(), key);
        assert!(PublicKey::from_bytes(&[0u8; 5]).is_err());
    }
}
