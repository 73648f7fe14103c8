// trust/store.rs - File-Backed Certificate Repository

//! One directory per subject:
//!
//! ```text
//! <root>/<subject-fp>/keys/public.key
//! <root>/<subject-fp>/<issuer-fp>.sig
//! <root>/<subject-fp>/keys/<key-id>.key
//! <root>/<subject-fp>/keys/<key-id>.sig
//! ```
//!
//! Files are written once and never modified. Reads re-check the embedded
//! identifiers against the path and, when strict, the signatures themselves.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use super::identity::{Fingerprint, IntegrityError, KeyId, PublicKey};
use super::signature::{Signature, SubKeySignature};

const KEYS_DIR: &str = "keys";
const PUBLIC_KEY_FILE: &str = "public.key";
const SIGNATURE_EXT: &str = "sig";
const SUBKEY_EXT: &str = "key";

/// Errors related to repository operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(PathBuf),

    #[error("Integrity violation: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Repository root is not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Persistent certificate repository rooted at a directory
#[derive(Debug, Clone)]
pub struct TrustStore {
    root: PathBuf,
    strict: bool,
}

impl TrustStore {
    /// Open or create a repository at the given path
    pub fn open<P: AsRef<Path>>(root: P, strict: bool) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        if root.exists() && !root.is_dir() {
            return Err(StoreError::NotADirectory(root));
        }
        fs::create_dir_all(&root)?;

        Ok(Self { root, strict })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    fn subject_dir(&self, subject: &Fingerprint) -> PathBuf {
        self.root.join(subject.to_string())
    }

    fn keys_dir(&self, subject: &Fingerprint) -> PathBuf {
        self.subject_dir(subject).join(KEYS_DIR)
    }

    fn public_key_path(&self, subject: &Fingerprint) -> PathBuf {
        self.keys_dir(subject).join(PUBLIC_KEY_FILE)
    }

    fn signature_path(&self, issuer: &Fingerprint, subject: &Fingerprint) -> PathBuf {
        self.subject_dir(subject)
            .join(format!("{}.{}", issuer, SIGNATURE_EXT))
    }

    fn subkey_path(&self, owner: &Fingerprint, key_id: &KeyId, ext: &str) -> PathBuf {
        self.keys_dir(owner).join(format!("{}.{}", key_id, ext))
    }

    /// Store a subject's key with its self-signature
    ///
    /// Returns `false` when both files already exist.
    pub fn save_public_key(&self, key: &PublicKey, self_signature: &Signature) -> Result<bool, StoreError> {
        self_signature.verify_self(key)?;

        let fingerprint = key.fingerprint();
        let key_written = write_new(&self.public_key_path(&fingerprint), key)?;
        let sig_written = self.save_signature(self_signature)?;
        Ok(key_written || sig_written)
    }

    /// Load a subject's public key, checking it hashes to its directory name
    pub fn load_public_key(&self, subject: &Fingerprint) -> Result<PublicKey, StoreError> {
        let key: PublicKey = read(&self.public_key_path(subject))?;

        let actual = key.fingerprint();
        if &actual != subject {
            return Err(IntegrityError::FingerprintMismatch {
                expected: subject.clone(),
                actual,
            }
            .into());
        }
        Ok(key)
    }

    pub fn has_public_key(&self, subject: &Fingerprint) -> bool {
        self.public_key_path(subject).is_file()
    }

    /// Store a certificate; `false` if one from the same issuer already exists
    pub fn save_signature(&self, signature: &Signature) -> Result<bool, StoreError> {
        if !signature.is_signed() {
            return Err(IntegrityError::Unsigned.into());
        }
        write_new(
            &self.signature_path(&signature.issuer, &signature.subject),
            signature,
        )
    }

    /// Load a certificate, checking only that it names the expected parties
    pub fn load_signature(&self, issuer: &Fingerprint, subject: &Fingerprint) -> Result<Signature, StoreError> {
        let signature: Signature = read(&self.signature_path(issuer, subject))?;

        if &signature.issuer != issuer {
            return Err(IntegrityError::FingerprintMismatch {
                expected: issuer.clone(),
                actual: signature.issuer,
            }
            .into());
        }
        if &signature.subject != subject {
            return Err(IntegrityError::FingerprintMismatch {
                expected: subject.clone(),
                actual: signature.subject,
            }
            .into());
        }
        Ok(signature)
    }

    /// Load a certificate and verify it against both keys
    pub fn load_verified_signature(
        &self,
        issuer: &PublicKey,
        subject: &PublicKey,
    ) -> Result<Signature, StoreError> {
        let signature = self.load_signature(&issuer.fingerprint(), &subject.fingerprint())?;
        if self.strict {
            signature.verify(issuer, subject)?;
        }
        Ok(signature)
    }

    pub fn has_signature(&self, issuer: &Fingerprint, subject: &Fingerprint) -> bool {
        self.signature_path(issuer, subject).is_file()
    }

    /// Remove a certificate; `false` if it was not there
    pub fn delete_signature(&self, signature: &Signature) -> Result<bool, StoreError> {
        let path = self.signature_path(&signature.issuer, &signature.subject);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted signature");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a subject's directory with everything in it
    pub fn delete_subject(&self, subject: &Fingerprint) -> Result<bool, StoreError> {
        match fs::remove_dir_all(self.subject_dir(subject)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a sub-key with its certificate
    pub fn save_subkey(&self, subkey: &[u8], signature: &SubKeySignature) -> Result<bool, StoreError> {
        let key_id = KeyId::of(subkey)?;
        if key_id != signature.subkey {
            return Err(IntegrityError::KeyIdMismatch {
                expected: signature.subkey.clone(),
                actual: key_id,
            }
            .into());
        }

        let owner = &signature.owner;
        let key_written = write_new(&self.subkey_path(owner, &key_id, SUBKEY_EXT), &subkey.to_vec())?;
        let sig_written = write_new(&self.subkey_path(owner, &key_id, SIGNATURE_EXT), signature)?;
        Ok(key_written || sig_written)
    }

    /// Load a raw sub-key, checking it matches its key ID
    pub fn load_subkey(&self, owner: &Fingerprint, key_id: &KeyId) -> Result<Vec<u8>, StoreError> {
        let subkey: Vec<u8> = read(&self.subkey_path(owner, key_id, SUBKEY_EXT))?;

        let actual = KeyId::of(&subkey)?;
        if &actual != key_id {
            return Err(IntegrityError::KeyIdMismatch {
                expected: key_id.clone(),
                actual,
            }
            .into());
        }
        Ok(subkey)
    }

    /// Load the certificate of a sub-key, verified against its owner
    pub fn load_subkey_signature(&self, owner: &PublicKey, subkey: &[u8]) -> Result<SubKeySignature, StoreError> {
        let key_id = KeyId::of(subkey)?;
        let signature: SubKeySignature =
            read(&self.subkey_path(&owner.fingerprint(), &key_id, SIGNATURE_EXT))?;

        if self.strict {
            signature.verify(owner, subkey)?;
        } else if signature.subkey != key_id {
            return Err(IntegrityError::KeyIdMismatch {
                expected: key_id,
                actual: signature.subkey,
            }
            .into());
        }
        Ok(signature)
    }

    /// Fingerprints of all subject directories
    pub fn subjects(&self) -> Result<Vec<Fingerprint>, StoreError> {
        let mut subjects = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_str().map(str::parse::<Fingerprint>) {
                Some(Ok(fp)) => subjects.push(fp),
                _ => warn!(path = %entry.path().display(), "Skipping unexpected directory in repository"),
            }
        }
        subjects.sort();
        Ok(subjects)
    }

    /// Issuers with a certificate on `subject`, including the subject itself
    pub fn signature_issuers(&self, subject: &Fingerprint) -> Result<Vec<Fingerprint>, StoreError> {
        list_stems(&self.subject_dir(subject), SIGNATURE_EXT)
    }

    /// Key IDs of all sub-keys stored for `owner`
    pub fn subkey_ids(&self, owner: &Fingerprint) -> Result<Vec<KeyId>, StoreError> {
        list_stems(&self.keys_dir(owner), SIGNATURE_EXT)
    }
}

/// Write `value` to `path` unless the file exists
///
/// The content goes to a temporary file in the same directory first and is
/// linked into place without clobbering, so readers never see partial files
/// and concurrent writers of the same certificate cannot both win.
fn write_new<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<bool, StoreError> {
    if path.exists() {
        return Ok(false);
    }

    let dir = path
        .parent()
        .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))?;
    fs::create_dir_all(dir)?;

    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(&bytes)?;
    file.as_file().sync_all()?;

    match file.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::Io(e.error)),
    }
}

fn read<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let (value, _): (T, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e)))?;
    Ok(value)
}

fn list_stems<T: std::str::FromStr>(dir: &Path, ext: &str) -> Result<Vec<T>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut items = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        match path.file_stem().and_then(|s| s.to_str()).map(str::parse::<T>) {
            Some(Ok(item)) => items.push(item),
            _ => warn!(path = %path.display(), "Skipping unexpected file in repository"),
        }
    }
    Ok(items)
}
