// trust/keys.rs - Key Manager Abstraction and Software Key Backend

use ed25519_dalek::{Signer, SigningKey, SECRET_KEY_LENGTH};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

use super::identity::{Fingerprint, IntegrityError, KeyId, PublicKey};
use super::signature::{AppDetails, Signature, SubKeySignature};

/// Errors raised by key backends
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Signing backend error: {0}")]
    Backend(String),

    #[error("Invalid key material: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Custodian of the owner's master key
///
/// Backends only provide the key, its self-signature and raw signing; the
/// certificate constructors are shared.
pub trait KeyManager: Send + Sync {
    fn public_key(&self) -> &PublicKey;

    /// The owner's self-signature, stable across restarts
    fn self_signature(&self) -> &Signature;

    /// Sign raw bytes with the master key
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError>;

    fn fingerprint(&self) -> Fingerprint {
        self.public_key().fingerprint()
    }

    /// Certify `subject` as seen by the owner
    fn create_signature(&self, subject: &PublicKey, alias: Option<String>) -> Result<Signature, KeyError> {
        let mut signature = Signature::new(
            now_millis(),
            self.fingerprint(),
            subject.fingerprint(),
            alias,
        );
        signature.data = self.sign(&signature.digest(subject))?;
        Ok(signature)
    }

    /// Certify a sub-key for an application
    ///
    /// With `bind_to_app` false the app's signing-certificate fingerprint is
    /// dropped so any build of the package may use the key.
    fn create_subkey_signature(
        &self,
        subkey: &[u8],
        app: &AppDetails,
        bind_to_app: bool,
        tag: Option<String>,
    ) -> Result<SubKeySignature, KeyError> {
        let app = if bind_to_app { app.clone() } else { app.unbound() };
        let mut signature =
            SubKeySignature::new(now_millis(), self.fingerprint(), KeyId::of(subkey)?, app, tag);
        signature.data = self.sign(&signature.digest(subkey))?;
        Ok(signature)
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Master key held in process memory
pub struct SoftwareKeyManager {
    signing_key: SigningKey,
    public_key: PublicKey,
    self_signature: Signature,
    created_at: i64,
}

impl SoftwareKeyManager {
    /// Generate a new random master key
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; SECRET_KEY_LENGTH];
        rand::rng().fill_bytes(&mut secret_bytes);

        Self::with_signing_key(SigningKey::from_bytes(&secret_bytes), now_millis())
    }

    /// Restore from secret key bytes
    ///
    /// Ed25519 is deterministic, so the self-signature comes out identical
    /// to the one made when the key was created.
    pub fn from_secret_key(secret_bytes: &[u8], created_at: i64) -> Result<Self, KeyError> {
        let bytes: [u8; SECRET_KEY_LENGTH] =
            secret_bytes
                .try_into()
                .map_err(|_| IntegrityError::InvalidKeyLength {
                    expected: SECRET_KEY_LENGTH,
                    got: secret_bytes.len(),
                })?;

        Ok(Self::with_signing_key(SigningKey::from_bytes(&bytes), created_at))
    }

    fn with_signing_key(signing_key: SigningKey, created_at: i64) -> Self {
        let public_key = PublicKey::from_verifying_key(&signing_key.verifying_key());
        let fingerprint = public_key.fingerprint();

        let mut self_signature = Signature::new(created_at, fingerprint.clone(), fingerprint, None);
        self_signature.data = signing_key
            .sign(&self_signature.digest(&public_key))
            .to_bytes()
            .to_vec();

        Self {
            signing_key,
            public_key,
            self_signature,
            created_at,
        }
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn export(&self) -> ExportedKey {
        ExportedKey {
            secret_key: self.signing_key.to_bytes().to_vec(),
            created_at: self.created_at,
        }
    }

    pub fn import(exported: &ExportedKey) -> Result<Self, KeyError> {
        Self::from_secret_key(&exported.secret_key, exported.created_at)
    }

    /// Load the key stored at `path`, or generate and store a new one
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyError> {
        if path.exists() {
            return Self::import(&ExportedKey::load(path)?);
        }

        let keys = Self::generate();
        keys.export().save(path)?;
        tracing::info!(fingerprint = %keys.fingerprint().short(), "Generated new master key");
        Ok(keys)
    }
}

impl KeyManager for SoftwareKeyManager {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    fn self_signature(&self) -> &Signature {
        &self.self_signature
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        Ok(self.signing_key.sign(data).to_bytes().to_vec())
    }
}

impl fmt::Debug for SoftwareKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareKeyManager")
            .field("fingerprint", &self.public_key.fingerprint().short())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Serializable master key (for persistence)
#[derive(Clone, Serialize, Deserialize)]
pub struct ExportedKey {
    pub secret_key: Vec<u8>,
    pub created_at: i64,
}

impl ExportedKey {
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let bytes = fs::read(path)?;
        let (exported, _): (ExportedKey, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| KeyError::Serialization(e.to_string()))?;
        Ok(exported)
    }

    /// Write the key file, replacing any previous one atomically
    pub fn save(&self, path: &Path) -> Result<(), KeyError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| KeyError::Serialization(e.to_string()))?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| KeyError::Io(e.error))?;
        Ok(())
    }
}
