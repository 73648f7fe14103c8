// trust/signature.rs - Trust Certificates and Sub-Key Signatures

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::identity::{Fingerprint, IntegrityError, KeyId, PublicKey};

/// A certificate in which `issuer` vouches that `subject` owns the given key
///
/// A signature with `issuer == subject` is the subject's self-signature and
/// is the only certificate allowed to travel together with a public key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Creation time in milliseconds since the Unix epoch
    pub time: i64,

    /// Who vouches
    pub issuer: Fingerprint,

    /// Who is vouched for
    pub subject: Fingerprint,

    /// Human-readable label the issuer gave the subject
    pub alias: Option<String>,

    /// Ed25519 signature over [`Signature::digest`]
    pub data: Vec<u8>,
}

impl Signature {
    /// Create an unsigned certificate
    pub fn new(
        time: i64,
        issuer: Fingerprint,
        subject: Fingerprint,
        alias: Option<String>,
    ) -> Self {
        Self {
            time,
            issuer,
            subject,
            alias,
            data: Vec::new(),
        }
    }

    /// Digest covered by the signature: time, both fingerprints, the
    /// subject's encoded key and, if present, the alias.
    pub fn digest(&self, subject_key: &PublicKey) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.time.to_be_bytes());
        hasher.update(self.issuer.as_bytes());
        hasher.update(self.subject.as_bytes());
        hasher.update(subject_key.encoded());
        if let Some(alias) = &self.alias {
            hasher.update(alias.as_bytes());
        }
        hasher.finalize().into()
    }

    pub fn is_self_signature(&self) -> bool {
        self.issuer == self.subject
    }

    pub fn is_signed(&self) -> bool {
        !self.data.is_empty()
    }

    /// Verify this certificate against the issuer's and subject's keys
    pub fn verify(&self, issuer_key: &PublicKey, subject_key: &PublicKey) -> Result<(), IntegrityError> {
        check_fingerprint(&self.issuer, issuer_key)?;
        check_fingerprint(&self.subject, subject_key)?;
        issuer_key.verify(&self.digest(subject_key), &self.data)
    }

    /// Verify a self-signature
    pub fn verify_self(&self, key: &PublicKey) -> Result<(), IntegrityError> {
        if !self.is_self_signature() {
            return Err(IntegrityError::NotSelfSigned {
                issuer: self.issuer.clone(),
                subject: self.subject.clone(),
            });
        }
        self.verify(key, key)
    }
}

fn check_fingerprint(expected: &Fingerprint, key: &PublicKey) -> Result<(), IntegrityError> {
    let actual = key.fingerprint();
    if &actual != expected {
        return Err(IntegrityError::FingerprintMismatch {
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}

/// Application a sub-key is issued for
///
/// A sub-key whose details carry a signing-certificate fingerprint is bound
/// to that exact application build; otherwise any build with the same
/// package name may use it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppDetails {
    pub package_name: String,
    pub signature_fingerprint: Option<Fingerprint>,
}

impl AppDetails {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            signature_fingerprint: None,
        }
    }

    pub fn with_signature(mut self, fingerprint: Fingerprint) -> Self {
        self.signature_fingerprint = Some(fingerprint);
        self
    }

    /// The same details with the signing-certificate binding dropped
    pub fn unbound(&self) -> Self {
        Self::new(self.package_name.clone())
    }

    /// Whether a sub-key issued for `self` may be handed to `other`
    pub fn allows(&self, other: &AppDetails) -> bool {
        match &self.signature_fingerprint {
            None => true,
            Some(fp) => other.signature_fingerprint.as_ref() == Some(fp),
        }
    }
}

/// A master key's certificate over one of its sub-keys
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubKeySignature {
    pub time: i64,
    pub owner: Fingerprint,
    pub subkey: KeyId,
    pub app: AppDetails,
    pub tag: Option<String>,
    pub data: Vec<u8>,
}

impl SubKeySignature {
    pub fn new(
        time: i64,
        owner: Fingerprint,
        subkey: KeyId,
        app: AppDetails,
        tag: Option<String>,
    ) -> Self {
        Self {
            time,
            owner,
            subkey,
            app,
            tag,
            data: Vec::new(),
        }
    }

    pub fn digest(&self, subkey: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.time.to_be_bytes());
        hasher.update(self.owner.as_bytes());
        hasher.update(self.subkey.as_bytes());
        hasher.update(self.app.package_name.as_bytes());
        if let Some(fp) = &self.app.signature_fingerprint {
            hasher.update(fp.as_bytes());
        }
        if let Some(tag) = &self.tag {
            hasher.update(tag.as_bytes());
        }
        hasher.update(subkey);
        hasher.finalize().into()
    }

    /// Verify against the owner's master key and the raw sub-key
    pub fn verify(&self, owner_key: &PublicKey, subkey: &[u8]) -> Result<(), IntegrityError> {
        check_fingerprint(&self.owner, owner_key)?;

        let actual = KeyId::of(subkey)?;
        if actual != self.subkey {
            return Err(IntegrityError::KeyIdMismatch {
                expected: self.subkey.clone(),
                actual,
            });
        }

        owner_key.verify(&self.digest(subkey), &self.data)
    }

    /// Case-insensitive substring match on the tag; untagged keys never match
    pub fn matches_tag(&self, needle: &str) -> bool {
        self.tag
            .as_ref()
            .is_some_and(|tag| tag.to_lowercase().contains(&needle.to_lowercase()))
    }
}

/// A raw sub-key travelling with its certificate
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubKeyEntry {
    pub public_key: Vec<u8>,
    pub signature: SubKeySignature,
}
