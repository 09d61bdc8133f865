//! Case Registry
//!
//! Owns every case opened in a session together with its evidence store. Each case
//! sits behind its own `tokio::sync::Mutex`; the dispatcher holds that guard from
//! handler execution through history recording, so two commands on the same case
//! never interleave while commands on different cases run in parallel.
//!
//! Case metadata is mirrored in a small `std::sync::RwLock` next to the mutex so
//! listing cases or reading the active case never waits on a running command.
//!
//! Archive-backed registries write `case.json` when a case is opened and after
//! every change made through the registry; the dispatcher persists the case it
//! holds as part of recording each command.

use crate::archive::CaseArchive;
use crate::evidence::{BlobStore, EvidenceStore, EvidenceTxn, MemoryBlobStore};
use mimir_core::{validate_case_id, Case, Evidence, MimirError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry-wide rules for case lifecycle
#[derive(Debug, Clone, Copy)]
pub struct CasePolicy {
    /// Refuse new evidence on closed cases (custody entries are still appended)
    pub forbid_evidence_on_closed: bool,
}

impl Default for CasePolicy {
    fn default() -> Self {
        Self {
            forbid_evidence_on_closed: true,
        }
    }
}

/// Where evidence content for new cases is kept
pub enum CaseStorage {
    Memory,
    Archive(CaseArchive),
}

impl CaseStorage {
    fn blob_store(&self, case_id: &str) -> Result<Arc<dyn BlobStore>> {
        match self {
            CaseStorage::Memory => Ok(Arc::new(MemoryBlobStore::new())),
            CaseStorage::Archive(archive) => {
                let store = archive.blob_store(case_id).map_err(|e| {
                    MimirError::InvalidState(format!(
                        "cannot open evidence directory for {}: {}",
                        case_id, e
                    ))
                })?;
                Ok(Arc::new(store))
            }
        }
    }
}

/// Persistable view of one case: metadata plus evidence records in acquisition order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub case: Case,
    pub evidence: Vec<Evidence>,
}

/// Mutable state of one case, reachable only through its lock
pub struct CaseState {
    meta: Arc<RwLock<Case>>,
    evidence: EvidenceStore,
    policy: CasePolicy,
}

impl CaseState {
    fn new(case: Case, evidence: EvidenceStore, policy: CasePolicy) -> Self {
        let mut state = Self {
            meta: Arc::new(RwLock::new(case)),
            evidence,
            policy,
        };
        state.apply_seal();
        state
    }

    pub fn id(&self) -> &str {
        self.evidence.case_id()
    }

    pub fn case(&self) -> Case {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_open(&self) -> bool {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_open()
    }

    pub fn evidence(&self) -> &EvidenceStore {
        &self.evidence
    }

    pub fn evidence_mut(&mut self) -> &mut EvidenceStore {
        &mut self.evidence
    }

    /// Idempotent; returns whether the status changed
    pub fn close(&mut self) -> bool {
        let changed = self
            .meta
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
        self.apply_seal();
        changed
    }

    pub fn reopen(&mut self) -> bool {
        let changed = self
            .meta
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .reopen();
        self.apply_seal();
        changed
    }

    /// Add content as new evidence. Fails with `InvalidState` on a closed case when
    /// the registry forbids evidence on closed cases.
    pub fn attach_evidence(&mut self, source: &str, content: &[u8], actor: &str) -> Result<Evidence> {
        let mut txn = self.evidence.begin(actor);
        let evidence = txn.acquire(&self.evidence, source, content)?;
        self.commit(txn);
        Ok(evidence)
    }

    /// Apply a staged evidence transaction and list the new ids on the case
    pub fn commit(&mut self, txn: EvidenceTxn) -> Vec<String> {
        let added = txn.commit(&mut self.evidence);
        if !added.is_empty() {
            self.meta
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .evidence
                .extend(added.iter().cloned());
        }
        added
    }

    pub fn snapshot(&self) -> CaseSnapshot {
        CaseSnapshot {
            case: self.case(),
            evidence: self.evidence.records().to_vec(),
        }
    }

    fn apply_seal(&mut self) {
        let sealed = self.policy.forbid_evidence_on_closed && !self.is_open();
        self.evidence.set_sealed(sealed);
    }
}

struct CaseSlot {
    meta: Arc<RwLock<Case>>,
    state: Arc<Mutex<CaseState>>,
}

#[derive(Default)]
struct CaseTable {
    slots: HashMap<String, CaseSlot>,
    order: Vec<String>,
}

pub struct CaseRegistry {
    table: RwLock<CaseTable>,
    active: RwLock<Option<String>>,
    policy: CasePolicy,
    storage: CaseStorage,
}

impl CaseRegistry {
    pub fn new(policy: CasePolicy, storage: CaseStorage) -> Self {
        Self {
            table: RwLock::new(CaseTable::default()),
            active: RwLock::new(None),
            policy,
            storage,
        }
    }

    /// Memory-backed registry with default policy
    pub fn in_memory() -> Self {
        Self::new(CasePolicy::default(), CaseStorage::Memory)
    }

    pub fn policy(&self) -> CasePolicy {
        self.policy
    }

    pub fn archive(&self) -> Option<&CaseArchive> {
        match &self.storage {
            CaseStorage::Archive(archive) => Some(archive),
            CaseStorage::Memory => None,
        }
    }

    pub fn open_case(&self, case_id: &str) -> Result<Case> {
        validate_case_id(case_id)
            .map_err(|e| MimirError::Argument(format!("invalid case id: {}", e)))?;

        if self.contains(case_id) {
            return Err(MimirError::conflict("case", case_id));
        }
        let blobs = self.storage.blob_store(case_id)?;
        let case = Case::new(case_id);
        let state = CaseState::new(case.clone(), EvidenceStore::new(case_id, blobs), self.policy);
        let snapshot = state.snapshot();

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the write lock; another open may have won the race
        if table.slots.contains_key(case_id) {
            return Err(MimirError::conflict("case", case_id));
        }
        table.slots.insert(
            case_id.to_string(),
            CaseSlot {
                meta: state.meta.clone(),
                state: Arc::new(Mutex::new(state)),
            },
        );
        table.order.push(case_id.to_string());
        drop(table);

        if let Err(err) = self.save_snapshot(&snapshot) {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            table.slots.remove(case_id);
            table.order.retain(|id| id != case_id);
            return Err(err);
        }

        tracing::info!(case = case_id, "case opened");
        Ok(case)
    }

    /// Write the current state of a locked case to the archive. A no-op for
    /// memory-backed registries; any failure is a `LedgerWrite`.
    pub fn persist(&self, state: &CaseState) -> Result<()> {
        self.save_snapshot(&state.snapshot())
    }

    fn save_snapshot(&self, snapshot: &CaseSnapshot) -> Result<()> {
        match &self.storage {
            CaseStorage::Memory => Ok(()),
            CaseStorage::Archive(archive) => archive.save(snapshot).map_err(|e| {
                MimirError::LedgerWrite(format!("case {} not saved: {}", snapshot.case.id, e))
            }),
        }
    }

    /// Idempotent. Clears the active case if it was this one.
    pub async fn close_case(&self, case_id: &str) -> Result<bool> {
        let mut state = self.lock_case(case_id).await?;
        let changed = state.close();
        self.persist(&state)?;
        drop(state);
        self.after_close(case_id, changed);
        Ok(changed)
    }

    pub async fn reopen_case(&self, case_id: &str) -> Result<bool> {
        let mut state = self.lock_case(case_id).await?;
        let changed = state.reopen();
        self.persist(&state)?;
        if changed {
            tracing::info!(case = case_id, "case reopened");
        }
        Ok(changed)
    }

    /// Bookkeeping after a case was closed through its state
    pub(crate) fn after_close(&self, case_id: &str, changed: bool) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.as_deref() == Some(case_id) {
            *active = None;
        }
        drop(active);
        if changed {
            tracing::info!(case = case_id, "case closed");
        }
    }

    pub fn get_active_case(&self) -> Option<Case> {
        let id = self.active_case_id()?;
        self.get(&id)
    }

    pub fn active_case_id(&self) -> Option<String> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_active_case(&self, case_id: &str) -> Result<()> {
        if !self.contains(case_id) {
            return Err(MimirError::not_found("case", case_id));
        }
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(case_id.to_string());
        tracing::debug!(case = case_id, "active case set");
        Ok(())
    }

    pub fn clear_active_case(&self) -> Option<String> {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn contains(&self, case_id: &str) -> bool {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .contains_key(case_id)
    }

    /// Current metadata of one case
    pub fn get(&self, case_id: &str) -> Option<Case> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let slot = table.slots.get(case_id)?;
        let case = slot
            .meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Some(case)
    }

    /// Cases in the order they were opened or restored
    pub fn list_cases(&self) -> Vec<Case> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .order
            .iter()
            .filter_map(|id| table.slots.get(id))
            .map(|slot| {
                slot.meta
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
            .collect()
    }

    fn slot_state(&self, case_id: &str) -> Result<Arc<Mutex<CaseState>>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .get(case_id)
            .map(|slot| slot.state.clone())
            .ok_or_else(|| MimirError::not_found("case", case_id))
    }

    /// Exclusive access to one case, waiting for any running command on it
    pub async fn lock_case(&self, case_id: &str) -> Result<OwnedMutexGuard<CaseState>> {
        let state = self.slot_state(case_id)?;
        Ok(state.lock_owned().await)
    }

    /// Exclusive access without waiting; `InvalidState` if the case is busy
    pub fn try_lock_case(&self, case_id: &str) -> Result<OwnedMutexGuard<CaseState>> {
        let state = self.slot_state(case_id)?;
        state
            .try_lock_owned()
            .map_err(|_| MimirError::InvalidState(format!("case {} is busy", case_id)))
    }

    pub async fn attach_evidence(
        &self,
        case_id: &str,
        source: &str,
        content: &[u8],
        actor: &str,
    ) -> Result<Evidence> {
        let mut state = self.lock_case(case_id).await?;
        let evidence = state.attach_evidence(source, content, actor)?;
        self.persist(&state)?;
        Ok(evidence)
    }

    pub async fn snapshot(&self, case_id: &str) -> Result<CaseSnapshot> {
        let state = self.lock_case(case_id).await?;
        Ok(state.snapshot())
    }

    /// Re-register a persisted case. Evidence content is expected in this registry's
    /// storage under the same ids.
    pub fn restore(&self, snapshot: CaseSnapshot) -> Result<()> {
        let case_id = snapshot.case.id.clone();
        validate_case_id(&case_id)
            .map_err(|e| MimirError::Integrity(format!("invalid case id in snapshot: {}", e)))?;
        if self.contains(&case_id) {
            return Err(MimirError::conflict("case", case_id));
        }

        let listed: Vec<&str> = snapshot.evidence.iter().map(|e| e.id()).collect();
        if listed != snapshot.case.evidence.iter().map(String::as_str).collect::<Vec<_>>() {
            return Err(MimirError::Integrity(format!(
                "case {} evidence list does not match its records",
                case_id
            )));
        }

        let blobs = self.storage.blob_store(&case_id)?;
        let evidence = EvidenceStore::restore(&case_id, blobs, snapshot.evidence)?;
        let state = CaseState::new(snapshot.case, evidence, self.policy);

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.slots.contains_key(&case_id) {
            return Err(MimirError::conflict("case", case_id));
        }
        table.slots.insert(
            case_id.clone(),
            CaseSlot {
                meta: state.meta.clone(),
                state: Arc::new(Mutex::new(state)),
            },
        );
        table.order.push(case_id.clone());
        drop(table);

        tracing::debug!(case = %case_id, "case restored");
        Ok(())
    }
}
