// protocol/sync.rs - Applying Gossiped Certificate Material

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::observability::record_sync_applied;
use crate::trust::{Fingerprint, RelatedData, Signature, SubKeyEntry, TrustManager};

/// Counts of what one sync bag changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub subjects_added: usize,
    pub signatures_added: usize,
    pub subkeys_added: usize,

    /// Items that failed verification
    pub rejected: usize,

    /// Items already known or about unknown subjects
    pub skipped: usize,

    /// Subjects purged by the refresh that followed
    pub purged: usize,
}

impl SyncSummary {
    pub fn added(&self) -> usize {
        self.subjects_added + self.signatures_added + self.subkeys_added
    }
}

/// Merge a peer's bag into the trust graph
///
/// Keys go first so certificates on and by newcomers can bind, then
/// certificates, then sub-keys. Everything is verified; bad items are
/// dropped without affecting the rest.
pub fn apply_related_data(
    trust: &mut TrustManager,
    peer: &Fingerprint,
    related: HashSet<RelatedData>,
) -> SyncSummary {
    let mut summary = SyncSummary::default();

    let mut self_signatures: HashMap<Fingerprint, Signature> = HashMap::new();
    let mut public_keys = Vec::new();
    let mut signatures = Vec::new();
    let mut subkeys: Vec<SubKeyEntry> = Vec::new();
    for item in related {
        match item {
            RelatedData::Signature(sig) if sig.is_self_signature() => {
                self_signatures.insert(sig.subject.clone(), sig);
            }
            RelatedData::Signature(sig) => signatures.push(sig),
            RelatedData::PublicKey(key) => public_keys.push(key),
            RelatedData::SubKey(entry) => subkeys.push(entry),
        }
    }

    for key in public_keys {
        let fingerprint = key.fingerprint();
        if trust.contains(&fingerprint) {
            summary.skipped += 1;
            continue;
        }

        let Some(self_signature) = self_signatures.remove(&fingerprint) else {
            warn!(peer = %peer.short(), subject = %fingerprint.short(), "Key without self-signature");
            summary.rejected += 1;
            continue;
        };
        if let Err(e) = self_signature.verify_self(&key) {
            warn!(peer = %peer.short(), subject = %fingerprint.short(), error = %e, "Invalid self-signature");
            summary.rejected += 1;
            continue;
        }

        match trust.add_subject(key, self_signature) {
            Ok(true) => summary.subjects_added += 1,
            Ok(false) => summary.skipped += 1,
            Err(e) => {
                warn!(peer = %peer.short(), subject = %fingerprint.short(), error = %e, "Failed to add subject");
                summary.rejected += 1;
            }
        }
    }

    for signature in signatures {
        let (issuer, subject) = (signature.issuer.short(), signature.subject.short());
        match trust.add_signature(signature) {
            Ok(true) => summary.signatures_added += 1,
            Ok(false) => summary.skipped += 1,
            Err(e) => {
                warn!(peer = %peer.short(), %issuer, %subject, error = %e, "Rejected signature");
                summary.rejected += 1;
            }
        }
    }

    for entry in subkeys {
        let key_id = entry.signature.subkey.clone();
        match trust.add_subkey(entry.public_key, entry.signature) {
            Ok(true) => summary.subkeys_added += 1,
            Ok(false) => summary.skipped += 1,
            Err(e) => {
                warn!(peer = %peer.short(), %key_id, error = %e, "Rejected sub-key");
                summary.rejected += 1;
            }
        }
    }

    summary.purged = trust.refresh_validity().purged.len();
    trust.update_last_sync(peer);
    record_sync_applied(summary.added(), summary.rejected);

    debug!(peer = %peer.short(), ?summary, "Applied sync");
    summary
}
