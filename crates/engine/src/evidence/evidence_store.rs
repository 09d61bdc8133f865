//! Evidence Store: fingerprinted records for one case
//!
//! Records live in an arena (`Vec<Evidence>`) indexed by id; derived records point
//! at their parent by id only. All writes go through an `EvidenceTxn`, which stages
//! new records and custody entries and applies them in one step on commit:
//! - content is hashed in full before a record exists
//! - staged blobs are removed again if the transaction is discarded
//! - nothing is visible in the store until `commit`

use super::blob_store::BlobStore;
use mimir_core::{CustodyAction, Evidence, MimirError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

const READ_CHUNK: usize = 64 * 1024;

/// Result of re-hashing stored content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub evidence_id: String,
    pub expected: String,
    /// None when the content could not be read
    pub actual: Option<String>,
    pub intact: bool,
}

pub struct EvidenceStore {
    case_id: String,
    records: Vec<Evidence>,
    index: HashMap<String, usize>,
    blobs: Arc<dyn BlobStore>,
    /// Set while the owning case is closed and refuses new evidence
    sealed: bool,
    /// Highest evidence number ever handed out; ids are never reissued
    issued: u64,
}

/// `E12` -> 12
fn evidence_number(id: &str) -> Option<u64> {
    id.strip_prefix('E')?.parse().ok()
}

impl EvidenceStore {
    pub fn new(case_id: impl Into<String>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            case_id: case_id.into(),
            records: Vec::new(),
            index: HashMap::new(),
            blobs,
            sealed: false,
            issued: 0,
        }
    }

    /// Rebuild a store from persisted records, checking ids and parent links.
    ///
    /// Content found in blob storage without a record (left by a session that
    /// stopped between writing content and saving the case) keeps its id retired.
    pub fn restore(
        case_id: impl Into<String>,
        blobs: Arc<dyn BlobStore>,
        records: Vec<Evidence>,
    ) -> Result<Self> {
        let mut store = Self::new(case_id, blobs);
        for record in records {
            if record.case_id() != store.case_id {
                return Err(MimirError::Integrity(format!(
                    "evidence {} belongs to case {}, not {}",
                    record.id(),
                    record.case_id(),
                    store.case_id
                )));
            }
            if store.index.contains_key(record.id()) {
                return Err(MimirError::conflict("evidence", record.id()));
            }
            if let Some(parent) = record.parent() {
                if !store.index.contains_key(&parent.evidence_id) {
                    return Err(MimirError::Integrity(format!(
                        "evidence {} references unknown parent {}",
                        record.id(),
                        parent.evidence_id
                    )));
                }
            }
            store.index.insert(record.id().to_string(), store.records.len());
            store.issued = store.issued.max(evidence_number(record.id()).unwrap_or(0));
            store.records.push(record);
        }

        let keys = store.blobs.keys().map_err(|e| {
            MimirError::Integrity(format!(
                "cannot list evidence content of case {}: {}",
                store.case_id, e
            ))
        })?;
        let orphans: Vec<&String> = keys
            .iter()
            .filter(|k| !store.index.contains_key(k.as_str()))
            .collect();
        for key in orphans {
            if let Some(n) = evidence_number(key) {
                tracing::warn!(
                    case = %store.case_id,
                    evidence = %key,
                    "content without a record; id retired"
                );
                store.issued = store.issued.max(n);
            }
        }
        Ok(store)
    }

    /// Id the next new record will receive
    pub fn next_evidence_id(&self) -> String {
        self.next_id(0)
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub fn get(&self, id: &str) -> Option<&Evidence> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[Evidence] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn set_sealed(&mut self, sealed: bool) {
        self.sealed = sealed;
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn read_content(&self, id: &str) -> Result<Vec<u8>> {
        if self.get(id).is_none() {
            return Err(MimirError::not_found("evidence", id));
        }
        self.blobs
            .get(id)
            .map_err(|e| MimirError::Integrity(format!("cannot read content of {}: {}", id, e)))
    }

    pub fn begin(&self, actor: impl Into<String>) -> EvidenceTxn {
        EvidenceTxn {
            actor: actor.into(),
            staged: Vec::new(),
            custody: Vec::new(),
        }
    }

    pub fn add_evidence(
        &mut self,
        source: &str,
        content: &[u8],
        actor: &str,
    ) -> Result<Evidence> {
        let mut txn = self.begin(actor);
        let evidence = txn.acquire(self, source, content)?;
        txn.commit(self);
        Ok(evidence)
    }

    pub fn add_evidence_from_reader<R: Read>(
        &mut self,
        source: &str,
        reader: R,
        expected_len: Option<u64>,
        actor: &str,
    ) -> Result<Evidence> {
        let mut txn = self.begin(actor);
        let evidence = txn.acquire_from_reader(self, source, reader, expected_len)?;
        txn.commit(self);
        Ok(evidence)
    }

    pub fn derive_evidence(
        &mut self,
        parent_id: &str,
        transform: &str,
        content: &[u8],
        actor: &str,
    ) -> Result<Evidence> {
        let mut txn = self.begin(actor);
        let evidence = txn.derive(self, parent_id, transform, content)?;
        txn.commit(self);
        Ok(evidence)
    }

    /// Re-hash stored content. Never errors: unknown ids and mismatches are `false`.
    pub fn verify(&mut self, id: &str, actor: &str) -> bool {
        match self.verify_report(id, actor) {
            Ok(report) => report.intact,
            Err(e) => {
                tracing::warn!(case = %self.case_id, evidence = id, "verify failed: {}", e);
                false
            }
        }
    }

    pub fn verify_report(&mut self, id: &str, actor: &str) -> Result<VerifyReport> {
        let mut txn = self.begin(actor);
        let report = txn.verify(self, id)?;
        txn.commit(self);
        Ok(report)
    }

    fn next_id(&self, staged: usize) -> String {
        format!("E{}", self.issued + staged as u64 + 1)
    }
}

struct StagedCustody {
    evidence_id: String,
    action: CustodyAction,
    fingerprint: String,
    note: Option<String>,
}

/// Pending evidence writes for one command execution
pub struct EvidenceTxn {
    actor: String,
    staged: Vec<Evidence>,
    custody: Vec<StagedCustody>,
}

impl EvidenceTxn {
    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn staged(&self) -> &[Evidence] {
        &self.staged
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty() && self.custody.is_empty()
    }

    /// Look up a record among committed and staged evidence
    pub fn lookup<'s>(&'s self, store: &'s EvidenceStore, id: &str) -> Option<&'s Evidence> {
        store
            .get(id)
            .or_else(|| self.staged.iter().find(|e| e.id() == id))
    }

    pub fn acquire(
        &mut self,
        store: &EvidenceStore,
        source: &str,
        content: &[u8],
    ) -> Result<Evidence> {
        let fingerprint = mimir_core::compute_sha256(content);
        self.stage_acquired(store, source, content, fingerprint)
    }

    /// Hash a stream to completion before anything is stored. A read error, or a
    /// length different from `expected_len`, fails with `Integrity` and stages nothing.
    pub fn acquire_from_reader<R: Read>(
        &mut self,
        store: &EvidenceStore,
        source: &str,
        mut reader: R,
        expected_len: Option<u64>,
    ) -> Result<Evidence> {
        ensure_unsealed(store)?;

        let mut hasher = Sha256::new();
        let mut content = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    hasher.update(&chunk[..n]);
                    content.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(MimirError::Integrity(format!(
                        "read of {} failed after {} bytes: {}",
                        source,
                        content.len(),
                        e
                    )));
                }
            }
        }

        if let Some(expected) = expected_len {
            if content.len() as u64 != expected {
                return Err(MimirError::Integrity(format!(
                    "{} truncated: expected {} bytes, read {}",
                    source,
                    expected,
                    content.len()
                )));
            }
        }

        let fingerprint = hex::encode(hasher.finalize());
        self.stage_acquired(store, source, &content, fingerprint)
    }

    fn stage_acquired(
        &mut self,
        store: &EvidenceStore,
        source: &str,
        content: &[u8],
        fingerprint: String,
    ) -> Result<Evidence> {
        ensure_unsealed(store)?;
        let id = store.next_id(self.staged.len());
        store
            .blobs
            .put(&id, content)
            .map_err(|e| MimirError::Integrity(format!("cannot store content of {}: {}", id, e)))?;

        let evidence = Evidence::acquired(
            id,
            store.case_id(),
            source,
            fingerprint,
            content.len() as u64,
            self.actor.as_str(),
        );
        self.staged.push(evidence.clone());
        Ok(evidence)
    }

    pub fn derive(
        &mut self,
        store: &EvidenceStore,
        parent_id: &str,
        transform: &str,
        content: &[u8],
    ) -> Result<Evidence> {
        ensure_unsealed(store)?;
        let parent = self
            .lookup(store, parent_id)
            .cloned()
            .ok_or_else(|| MimirError::not_found("evidence", parent_id))?;

        let id = store.next_id(self.staged.len());
        store
            .blobs
            .put(&id, content)
            .map_err(|e| MimirError::Integrity(format!("cannot store content of {}: {}", id, e)))?;

        let evidence = Evidence::derived(
            id,
            &parent,
            transform,
            mimir_core::compute_sha256(content),
            content.len() as u64,
            self.actor.as_str(),
        );
        self.staged.push(evidence.clone());
        Ok(evidence)
    }

    pub fn verify(&mut self, store: &EvidenceStore, id: &str) -> Result<VerifyReport> {
        let expected = self
            .lookup(store, id)
            .map(|e| e.fingerprint().to_string())
            .ok_or_else(|| MimirError::not_found("evidence", id))?;

        let (actual, note) = match store.blobs.get(id) {
            Ok(bytes) => (Some(mimir_core::compute_sha256(&bytes)), None),
            Err(e) => (None, Some(format!("content unreadable: {}", e))),
        };
        let intact = actual.as_deref() == Some(expected.as_str());
        let action = if intact {
            CustodyAction::Verified
        } else {
            CustodyAction::VerificationFailed
        };
        let observed = actual.clone().unwrap_or_else(|| "unavailable".to_string());

        if let Some(staged) = self.staged.iter_mut().find(|e| e.id() == id) {
            staged.record_custody(self.actor.as_str(), action, observed, note);
        } else {
            self.custody.push(StagedCustody {
                evidence_id: id.to_string(),
                action,
                fingerprint: observed,
                note,
            });
        }

        if !intact {
            tracing::warn!(
                case = %store.case_id,
                evidence = id,
                expected = %expected,
                actual = ?actual,
                "evidence content does not match recorded fingerprint"
            );
        }

        Ok(VerifyReport {
            evidence_id: id.to_string(),
            expected,
            actual,
            intact,
        })
    }

    /// Apply staged records and custody entries. Returns the ids of new records.
    pub fn commit(self, store: &mut EvidenceStore) -> Vec<String> {
        let mut added = Vec::with_capacity(self.staged.len());
        for evidence in self.staged {
            added.push(evidence.id().to_string());
            store.issued = store.issued.max(evidence_number(evidence.id()).unwrap_or(0));
            store
                .index
                .insert(evidence.id().to_string(), store.records.len());
            store.records.push(evidence);
        }
        for entry in self.custody {
            if let Some(&i) = store.index.get(&entry.evidence_id) {
                store.records[i].record_custody(
                    self.actor.as_str(),
                    entry.action,
                    entry.fingerprint,
                    entry.note,
                );
            }
        }
        added
    }

    /// Drop staged work and remove any blobs it wrote
    pub fn discard(self, store: &EvidenceStore) {
        for evidence in &self.staged {
            if let Err(e) = store.blobs.remove(evidence.id()) {
                tracing::warn!(
                    case = %store.case_id,
                    evidence = evidence.id(),
                    "failed to remove staged blob: {}",
                    e
                );
            }
        }
    }
}

fn ensure_unsealed(store: &EvidenceStore) -> Result<()> {
    if store.sealed {
        return Err(MimirError::InvalidState(format!(
            "case {} is closed; evidence cannot be added",
            store.case_id
        )));
    }
    Ok(())
}
