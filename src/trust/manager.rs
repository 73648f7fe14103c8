// trust/manager.rs - Trust Graph and Validity Computation

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, error, info, warn};

use super::identity::{Fingerprint, KeyId, PublicKey};
use super::info::{MetaInformation, TrustInfo, TrustLevel};
use super::keys::{now_millis, KeyManager};
use super::signature::{AppDetails, Signature, SubKeyEntry, SubKeySignature};
use super::store::{StoreError, TrustStore};
use crate::config::TrustConfig;
use crate::observability::{
    record_signature_rejected, record_subject_added, record_subject_purged, set_subject_count,
};

/// A subject in the trust graph
#[derive(Clone, Debug)]
pub struct Subject {
    pub fingerprint: Fingerprint,
    pub public_key: PublicKey,

    /// Certificates on this subject, keyed by issuer (self-signature included)
    pub issuers: HashMap<Fingerprint, Signature>,

    /// Subjects this one has verifiably certified (itself included)
    pub issued: HashSet<Fingerprint>,

    pub subkeys: HashMap<KeyId, SubKeyEntry>,
    pub trust_info: TrustInfo,

    /// Last successful sync (ms since epoch, 0 = never)
    pub last_sync: i64,
}

impl Subject {
    fn new(public_key: PublicKey, self_signature: Signature) -> Self {
        let fingerprint = public_key.fingerprint();
        Self {
            issuers: HashMap::from([(fingerprint.clone(), self_signature)]),
            issued: HashSet::from([fingerprint.clone()]),
            fingerprint,
            public_key,
            subkeys: HashMap::new(),
            trust_info: TrustInfo::UNKNOWN,
            last_sync: 0,
        }
    }

    pub fn self_signature(&self) -> Option<&Signature> {
        self.issuers.get(&self.fingerprint)
    }
}

/// A unit of certificate material exchanged during sync
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelatedData {
    Signature(Signature),
    PublicKey(PublicKey),
    SubKey(SubKeyEntry),
}

/// What a validity refresh changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Subjects whose trust info changed
    pub updated: usize,

    /// Subjects removed because they lost their last valid path
    pub purged: Vec<Fingerprint>,
}

enum Validity {
    Unchanged,
    Changed,
    Invalid,
}

/// The owner's view of the web of trust
///
/// Holds every subject loaded from the repository, keeps the certificate
/// edges between them and derives each subject's [`TrustInfo`]. Invalid
/// subjects are purged from memory and disk on refresh.
pub struct TrustManager {
    owner: Fingerprint,
    subjects: HashMap<Fingerprint, Subject>,
    store: TrustStore,
    config: TrustConfig,
}

impl TrustManager {
    /// Create a manager for an owner whose key is already in the repository
    ///
    /// Only the owner is loaded; call [`TrustManager::initialize`] to read
    /// the rest of the repository.
    pub fn new(store: TrustStore, owner: &Fingerprint, config: TrustConfig) -> Result<Self, StoreError> {
        let public_key = store.load_public_key(owner)?;
        let self_signature = store.load_verified_signature(&public_key, &public_key)?;

        let mut subject = Subject::new(public_key, self_signature);
        subject.trust_info = TrustInfo::OWNER;

        Ok(Self {
            owner: owner.clone(),
            subjects: HashMap::from([(owner.clone(), subject)]),
            store,
            config,
        })
    }

    /// Bootstrap from a key manager: store the owner's key if absent, then
    /// load and validate the whole repository
    pub fn open(store: TrustStore, keys: &dyn KeyManager, config: TrustConfig) -> Result<Self, StoreError> {
        if store.save_public_key(keys.public_key(), keys.self_signature())? {
            info!(owner = %keys.fingerprint().short(), "Stored owner key in repository");
        }

        let mut manager = Self::new(store, &keys.fingerprint(), config)?;
        manager.initialize()?;
        Ok(manager)
    }

    /// Load every subject in the repository and recompute validity
    ///
    /// Subjects whose files fail integrity checks are skipped with an error.
    pub fn initialize(&mut self) -> Result<RefreshOutcome, StoreError> {
        let owner = self.owner.clone();
        self.subjects.retain(|fp, _| fp == &owner);
        if let Some(subject) = self.subjects.get_mut(&owner) {
            let self_signature = subject.issuers.remove(&owner);
            subject.issuers.clear();
            subject.issued = HashSet::from([owner.clone()]);
            subject.subkeys.clear();
            if let Some(sig) = self_signature {
                subject.issuers.insert(owner.clone(), sig);
            }
        }

        for fingerprint in self.store.subjects()? {
            if let Err(e) = self.load_subject(&fingerprint) {
                error!(subject = %fingerprint.short(), error = %e, "Failed to load subject");
            }
        }

        let outcome = self.refresh_validity();
        info!(
            subjects = self.subjects.len(),
            purged = outcome.purged.len(),
            "Trust repository loaded"
        );
        Ok(outcome)
    }

    fn load_subject(&mut self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        // only the owner is already present while loading
        let mut subject = match self.subjects.get(fingerprint) {
            Some(owner) => owner.clone(),
            None => {
                let public_key = self.store.load_public_key(fingerprint)?;
                let self_signature = self.store.load_verified_signature(&public_key, &public_key)?;
                Subject::new(public_key, self_signature)
            }
        };

        let mut bound = Vec::new();
        for issuer in self.store.signature_issuers(fingerprint)? {
            if &issuer == fingerprint {
                continue;
            }

            let loaded = match self.subjects.get(&issuer) {
                Some(known) => self
                    .store
                    .load_verified_signature(&known.public_key, &subject.public_key),
                None => self.store.load_signature(&issuer, fingerprint),
            };

            match loaded {
                Ok(signature) => {
                    if self.subjects.contains_key(&issuer) {
                        bound.push(issuer.clone());
                    }
                    subject.issuers.insert(issuer, signature);
                }
                Err(e) => {
                    error!(subject = %fingerprint.short(), issuer = %issuer.short(), error = %e, "Skipping signature");
                }
            }
        }

        for key_id in self.store.subkey_ids(fingerprint)? {
            let loaded = self.store.load_subkey(fingerprint, &key_id).and_then(|bytes| {
                let signature = self.store.load_subkey_signature(&subject.public_key, &bytes)?;
                Ok((bytes, signature))
            });

            match loaded {
                Ok((public_key, signature)) => {
                    subject.subkeys.insert(key_id, SubKeyEntry { public_key, signature });
                }
                Err(e) => {
                    error!(subject = %fingerprint.short(), key_id = %key_id, error = %e, "Skipping sub-key");
                }
            }
        }

        self.subjects.insert(fingerprint.clone(), subject);
        for issuer in bound {
            if let Some(known) = self.subjects.get_mut(&issuer) {
                known.issued.insert(fingerprint.clone());
            }
        }
        self.resolve_unbound(fingerprint);
        Ok(())
    }

    /// Bind certificates issued by `issuer` that arrived before its key did
    ///
    /// Valid ones become edges, the rest are deleted.
    fn resolve_unbound(&mut self, issuer: &Fingerprint) {
        let Some(known) = self.subjects.get(issuer) else {
            return;
        };
        let issuer_key = known.public_key.clone();

        let mut bound = Vec::new();
        let mut forged = Vec::new();
        for (fingerprint, subject) in &self.subjects {
            if fingerprint == issuer || known.issued.contains(fingerprint) {
                continue;
            }
            let Some(signature) = subject.issuers.get(issuer) else {
                continue;
            };

            match signature.verify(&issuer_key, &subject.public_key) {
                Ok(()) => bound.push(fingerprint.clone()),
                Err(e) => {
                    error!(subject = %fingerprint.short(), issuer = %issuer.short(), error = %e, "Dropping forged signature");
                    forged.push(signature.clone());
                }
            }
        }

        if let Some(known) = self.subjects.get_mut(issuer) {
            known.issued.extend(bound);
        }

        for signature in forged {
            if let Err(e) = self.store.delete_signature(&signature) {
                error!(error = %e, "Failed to delete signature");
            }
            if let Some(subject) = self.subjects.get_mut(&signature.subject) {
                subject.issuers.remove(issuer);
            }
            record_signature_rejected();
        }
    }

    /// Add a subject from its key and self-signature
    ///
    /// Returns `false` if the subject is already known.
    pub fn add_subject(&mut self, public_key: PublicKey, self_signature: Signature) -> Result<bool, StoreError> {
        let fingerprint = public_key.fingerprint();
        if self.subjects.contains_key(&fingerprint) {
            return Ok(false);
        }

        if !self.store.save_public_key(&public_key, &self_signature)? {
            warn!(subject = %fingerprint.short(), "Repository already holds files for unloaded subject");
            return Ok(false);
        }

        self.subjects
            .insert(fingerprint.clone(), Subject::new(public_key, self_signature));
        self.resolve_unbound(&fingerprint);
        record_subject_added();
        debug!(subject = %fingerprint.short(), "Added subject");
        Ok(true)
    }

    /// Add a certificate on a known subject
    ///
    /// If the issuer is known the certificate is verified and becomes an
    /// edge; otherwise it is kept unbound until the issuer shows up.
    /// Returns `false` if the subject is unknown or the certificate exists.
    pub fn add_signature(&mut self, signature: Signature) -> Result<bool, StoreError> {
        let Some(subject) = self.subjects.get(&signature.subject) else {
            debug!(subject = %signature.subject.short(), "Ignoring signature on unknown subject");
            return Ok(false);
        };

        let issuer_known = match self.subjects.get(&signature.issuer) {
            Some(issuer) => {
                signature.verify(&issuer.public_key, &subject.public_key)?;
                true
            }
            None => false,
        };

        if !self.store.save_signature(&signature)? {
            return Ok(false);
        }

        let issuer = signature.issuer.clone();
        let subject = signature.subject.clone();
        if let Some(entry) = self.subjects.get_mut(&subject) {
            entry.issuers.insert(issuer.clone(), signature);
        }
        if issuer_known {
            if let Some(entry) = self.subjects.get_mut(&issuer) {
                entry.issued.insert(subject.clone());
            }
        }

        debug!(issuer = %issuer.short(), subject = %subject.short(), bound = issuer_known, "Added signature");
        Ok(true)
    }

    /// Add a certified sub-key of a known subject
    ///
    /// The owner may hold at most `max_subkeys_per_app` sub-keys per package.
    pub fn add_subkey(&mut self, subkey: Vec<u8>, signature: SubKeySignature) -> Result<bool, StoreError> {
        let Some(subject) = self.subjects.get(&signature.owner) else {
            return Ok(false);
        };
        signature.verify(&subject.public_key, &subkey)?;

        if subject.subkeys.contains_key(&signature.subkey) {
            return Ok(false);
        }

        if signature.owner == self.owner {
            let for_app = subject
                .subkeys
                .values()
                .filter(|entry| entry.signature.app.package_name == signature.app.package_name)
                .count();
            if for_app >= self.config.max_subkeys_per_app {
                warn!(package = %signature.app.package_name, "Sub-key limit reached");
                return Ok(false);
            }
        }

        if !self.store.save_subkey(&subkey, &signature)? {
            return Ok(false);
        }

        let owner = signature.owner.clone();
        if let Some(subject) = self.subjects.get_mut(&owner) {
            subject.subkeys.insert(
                signature.subkey.clone(),
                SubKeyEntry {
                    public_key: subkey,
                    signature,
                },
            );
        }
        Ok(true)
    }

    /// Recompute trust for every subject reachable from the owner, then
    /// purge subjects left without a valid path
    pub fn refresh_validity(&mut self) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();

        loop {
            outcome.updated += self.propagate();

            let mut purged = false;
            let candidates: Vec<Fingerprint> = self
                .subjects
                .keys()
                .filter(|fp| **fp != self.owner)
                .cloned()
                .collect();
            for fingerprint in candidates {
                match self.evaluate(&fingerprint) {
                    Validity::Invalid => {
                        self.purge(&fingerprint);
                        outcome.purged.push(fingerprint);
                        purged = true;
                    }
                    Validity::Changed => outcome.updated += 1,
                    Validity::Unchanged => {}
                }
            }

            if !purged {
                break;
            }
        }

        set_subject_count(self.subjects.len());
        if !outcome.purged.is_empty() || outcome.updated > 0 {
            debug!(updated = outcome.updated, purged = outcome.purged.len(), "Refreshed validity");
        }
        outcome
    }

    /// Breadth-first passes over issued edges until nothing changes
    fn propagate(&mut self) -> usize {
        let mut updated = 0;
        loop {
            let mut changed = 0;
            let mut queue = VecDeque::from([self.owner.clone()]);
            let mut visited = HashSet::from([self.owner.clone()]);

            while let Some(current) = queue.pop_front() {
                match self.evaluate(&current) {
                    Validity::Invalid => continue,
                    Validity::Changed => changed += 1,
                    Validity::Unchanged => {}
                }

                if let Some(subject) = self.subjects.get(&current) {
                    for next in &subject.issued {
                        if visited.insert(next.clone()) {
                            queue.push_back(next.clone());
                        }
                    }
                }
            }

            updated += changed;
            if changed == 0 {
                return updated;
            }
        }
    }

    /// Validate one subject, purging it if it has no valid path
    pub fn check_validity(&mut self, fingerprint: &Fingerprint) -> bool {
        match self.evaluate(fingerprint) {
            Validity::Invalid => {
                if self.subjects.contains_key(fingerprint) {
                    self.purge(fingerprint);
                }
                false
            }
            _ => true,
        }
    }

    fn evaluate(&mut self, fingerprint: &Fingerprint) -> Validity {
        if fingerprint == &self.owner {
            return Validity::Unchanged;
        }
        let Some(subject) = self.subjects.get(fingerprint) else {
            return Validity::Invalid;
        };

        let info = TrustInfo::new(
            self.determine_trust_level(subject),
            self.shortest_path_to_owner(fingerprint),
        );
        if !info.is_valid(self.config.max_degree) {
            return Validity::Invalid;
        }

        match self.subjects.get_mut(fingerprint) {
            Some(subject) if subject.trust_info != info => {
                subject.trust_info = info;
                Validity::Changed
            }
            _ => Validity::Unchanged,
        }
    }

    /// Level implied by the subject's known issuers
    ///
    /// Trusted and ultimate subjects keep their level. Otherwise a certificate
    /// from the owner makes a subject trusted, one from a trusted subject
    /// makes it known, and so do `known_required` certificates from known
    /// subjects.
    fn determine_trust_level(&self, subject: &Subject) -> TrustLevel {
        if subject.trust_info.level >= TrustLevel::Trusted {
            return subject.trust_info.level;
        }

        let mut level = TrustLevel::Unknown;
        let mut known = 0;
        for issuer in subject.issuers.keys() {
            if issuer == &subject.fingerprint {
                continue;
            }
            let Some(issuer) = self.subjects.get(issuer) else {
                continue;
            };

            match issuer.trust_info.level {
                TrustLevel::Ultimate => return TrustLevel::Trusted,
                TrustLevel::Trusted => level = TrustLevel::Known,
                TrustLevel::Known => known += 1,
                TrustLevel::Unknown => {}
            }
        }

        if known >= self.config.known_required {
            level = TrustLevel::Known;
        }
        level
    }

    /// Fewest certificate hops from the owner to `target`, or -1
    fn shortest_path_to_owner(&self, target: &Fingerprint) -> i32 {
        let mut queue = VecDeque::from([(target.clone(), 0)]);
        let mut visited = HashSet::from([target.clone()]);

        while let Some((current, distance)) = queue.pop_front() {
            if current == self.owner {
                return distance;
            }
            let Some(subject) = self.subjects.get(&current) else {
                continue;
            };
            for issuer in subject.issuers.keys() {
                if self.subjects.contains_key(issuer) && visited.insert(issuer.clone()) {
                    queue.push_back((issuer.clone(), distance + 1));
                }
            }
        }
        -1
    }

    fn purge(&mut self, fingerprint: &Fingerprint) {
        let Some(subject) = self.subjects.remove(fingerprint) else {
            return;
        };

        for issuer in subject.issuers.keys() {
            if let Some(issuer) = self.subjects.get_mut(issuer) {
                issuer.issued.remove(fingerprint);
            }
        }
        if let Err(e) = self.store.delete_subject(fingerprint) {
            error!(subject = %fingerprint.short(), error = %e, "Failed to delete subject files");
        }

        record_subject_purged();
        warn!(subject = %fingerprint.short(), "Purged subject without valid trust path");
    }

    pub fn owner(&self) -> &Fingerprint {
        &self.owner
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.subjects.contains_key(fingerprint)
    }

    pub fn subject(&self, fingerprint: &Fingerprint) -> Option<&Subject> {
        self.subjects.get(fingerprint)
    }

    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.values()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Trust info of a subject, [`TrustInfo::UNKNOWN`] if not known
    pub fn trust_info(&self, fingerprint: &Fingerprint) -> TrustInfo {
        self.subjects
            .get(fingerprint)
            .map(|s| s.trust_info)
            .unwrap_or(TrustInfo::UNKNOWN)
    }

    /// Trust info of every subject, in fingerprint order
    pub fn trust_table(&self) -> BTreeMap<Fingerprint, TrustInfo> {
        self.subjects
            .iter()
            .map(|(fp, s)| (fp.clone(), s.trust_info))
            .collect()
    }

    pub fn public_key(&self, fingerprint: &Fingerprint) -> Option<&PublicKey> {
        self.subjects.get(fingerprint).map(|s| &s.public_key)
    }

    /// Subjects trusted at least at `level`; empty for `Unknown`
    pub fn subjects_with_trust_level(&self, level: TrustLevel) -> HashSet<Fingerprint> {
        if level == TrustLevel::Unknown {
            return HashSet::new();
        }
        self.subjects
            .values()
            .filter(|s| s.trust_info.level >= level)
            .map(|s| s.fingerprint.clone())
            .collect()
    }

    /// Certificate material a peer trusting `trusted` is missing
    ///
    /// For every subject in `trusted` we know, its certificates and sub-keys.
    /// For every subject it certified that the peer does not trust yet, the
    /// key, its certificates and its sub-keys as well.
    pub fn related_data(&self, trusted: &HashSet<Fingerprint>) -> HashSet<RelatedData> {
        let mut related = HashSet::new();

        for fingerprint in trusted {
            let Some(subject) = self.subjects.get(fingerprint) else {
                continue;
            };
            Self::collect_certificates(subject, &mut related);

            for issued in &subject.issued {
                if trusted.contains(issued) {
                    continue;
                }
                if let Some(target) = self.subjects.get(issued) {
                    related.insert(RelatedData::PublicKey(target.public_key.clone()));
                    Self::collect_certificates(target, &mut related);
                }
            }
        }
        related
    }

    fn collect_certificates(subject: &Subject, related: &mut HashSet<RelatedData>) {
        related.extend(subject.issuers.values().cloned().map(RelatedData::Signature));
        related.extend(subject.subkeys.values().cloned().map(RelatedData::SubKey));
    }

    /// Aliases issuers gave a subject, closest issuer first
    pub fn meta_information(&self, fingerprint: &Fingerprint) -> Option<MetaInformation> {
        let subject = self.subjects.get(fingerprint)?;
        let max_degree = self.config.max_degree.max(0) as usize;

        // bucket per issuer degree, unknown issuers last
        let mut buckets: Vec<Vec<&Signature>> = vec![Vec::new(); max_degree + 2];
        for signature in subject.issuers.values() {
            if signature.alias.is_none() {
                continue;
            }
            let degree = self
                .subjects
                .get(&signature.issuer)
                .map(|issuer| issuer.trust_info.degree)
                .filter(|d| (0..=self.config.max_degree).contains(d))
                .map(|d| d as usize)
                .unwrap_or(max_degree + 1);
            buckets[degree].push(signature);
        }

        let mut aliases: Vec<String> = Vec::new();
        'outer: for mut bucket in buckets {
            bucket.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.alias.cmp(&b.alias)));
            for alias in bucket.into_iter().filter_map(|s| s.alias.as_ref()) {
                if aliases.len() >= self.config.max_meta_aliases {
                    break 'outer;
                }
                if !aliases.contains(alias) {
                    aliases.push(alias.clone());
                }
            }
        }

        Some(MetaInformation {
            aliases,
            last_sync: subject.last_sync,
        })
    }

    /// Key IDs of a subject's sub-keys usable by `app`, optionally filtered by tag
    ///
    /// Unbound sub-keys are open to any requester; bound ones only to a
    /// requester signed with the same certificate.
    pub fn available_subkeys(
        &self,
        fingerprint: &Fingerprint,
        app: &AppDetails,
        tag: Option<&str>,
    ) -> Option<HashSet<KeyId>> {
        let subject = self.subjects.get(fingerprint)?;
        Some(
            subject
                .subkeys
                .iter()
                .filter(|(_, entry)| entry.signature.app.allows(app))
                .filter(|(_, entry)| tag.is_none_or(|t| entry.signature.matches_tag(t)))
                .map(|(id, _)| id.clone())
                .collect(),
        )
    }

    /// Raw sub-key bytes, if `app` may use the key
    pub fn subkey_bytes(&self, fingerprint: &Fingerprint, key_id: &KeyId, app: &AppDetails) -> Option<&[u8]> {
        let entry = self.subjects.get(fingerprint)?.subkeys.get(key_id)?;
        if !entry.signature.app.allows(app) {
            return None;
        }
        Some(&entry.public_key)
    }

    /// Record a successful sync with a subject
    pub fn update_last_sync(&mut self, fingerprint: &Fingerprint) -> bool {
        match self.subjects.get_mut(fingerprint) {
            Some(subject) => {
                subject.last_sync = now_millis();
                true
            }
            None => false,
        }
    }

    pub fn last_sync(&self, fingerprint: &Fingerprint) -> Option<i64> {
        self.subjects.get(fingerprint).map(|s| s.last_sync)
    }
}
