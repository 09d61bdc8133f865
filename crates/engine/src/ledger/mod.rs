//! History/Session Ledger
//!
//! Append-only, per-scope history of dispatched commands. Each scope keeps its
//! entries in an `Arc<Vec<_>>`; appends copy-on-write through `Arc::make_mut`, so
//! a replay holds a cheap snapshot that later appends never disturb.
//!
//! An entry counts as recorded only once the sink accepted it. A failed sink write
//! does not consume the sequence number.

pub mod export;
pub mod sink;

pub use export::{CaseAuditBundle, ExportFormat, LedgerExport, EXPORT_FORMAT_VERSION};
pub use sink::{JsonlSink, LedgerSink, MemorySink};

use mimir_core::{HistoryEntry, MimirError, PendingEntry, Result, Scope};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type ScopeLog = Arc<Mutex<Arc<Vec<HistoryEntry>>>>;

pub struct Ledger {
    scopes: RwLock<HashMap<Scope, ScopeLog>>,
    sink: Arc<dyn LedgerSink>,
}

impl Ledger {
    pub fn new(sink: Arc<dyn LedgerSink>) -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            sink,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySink::new()))
    }

    fn log(&self, scope: &Scope) -> ScopeLog {
        if let Some(log) = self
            .scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
        {
            return log.clone();
        }
        self.scopes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(scope.clone())
            .or_default()
            .clone()
    }

    fn existing(&self, scope: &Scope) -> Option<ScopeLog> {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned()
    }

    /// Assign the next sequence number in `scope` and persist. Appends to one scope
    /// are serialized; different scopes do not contend.
    pub fn append(&self, scope: &Scope, pending: PendingEntry) -> Result<HistoryEntry> {
        let log = self.log(scope);
        let mut entries = log.lock().unwrap_or_else(PoisonError::into_inner);

        let sequence = entries.len() as u64 + 1;
        let entry = pending.into_entry(scope.clone(), sequence);
        if let Err(e) = self.sink.append(&entry) {
            tracing::error!(scope = %scope, sequence, "ledger sink rejected entry: {}", e);
            return Err(MimirError::LedgerWrite(e));
        }

        Arc::make_mut(&mut *entries).push(entry.clone());
        Ok(entry)
    }

    /// Snapshot iterator over the entries recorded so far
    pub fn replay(&self, scope: &Scope) -> Replay {
        let entries = self
            .existing(scope)
            .map(|log| log.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default();
        Replay { entries, pos: 0 }
    }

    pub fn export(&self, scope: &Scope, format: ExportFormat) -> Result<Vec<u8>> {
        let replay = self.replay(scope);
        export::render(scope, replay.as_slice(), format)
    }

    /// Install previously persisted entries for an empty scope. Sequence numbers must
    /// run 1, 2, 3, ... and every entry must carry `scope`.
    pub fn load(&self, scope: &Scope, entries: Vec<HistoryEntry>) -> Result<()> {
        for (i, entry) in entries.iter().enumerate() {
            if entry.scope != *scope {
                return Err(MimirError::Integrity(format!(
                    "entry {} belongs to {}, not {}",
                    entry.sequence, entry.scope, scope
                )));
            }
            let expected = i as u64 + 1;
            if entry.sequence != expected {
                return Err(MimirError::Integrity(format!(
                    "{} history out of sequence: expected {}, found {}",
                    scope, expected, entry.sequence
                )));
            }
        }

        let log = self.log(scope);
        let mut current = log.lock().unwrap_or_else(PoisonError::into_inner);
        if !current.is_empty() {
            return Err(MimirError::conflict("ledger scope", scope.to_string()));
        }
        *current = Arc::new(entries);
        Ok(())
    }

    pub fn len(&self, scope: &Scope) -> usize {
        self.existing(scope)
            .map(|log| log.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    /// Scopes with at least one entry, sorted
    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self
            .scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, log)| !log.lock().unwrap_or_else(PoisonError::into_inner).is_empty())
            .map(|(scope, _)| scope.clone())
            .collect();
        scopes.sort();
        scopes
    }

    pub fn flush(&self) -> Result<()> {
        self.sink.flush().map_err(MimirError::LedgerWrite)
    }
}

/// Finite, restartable iterator over a ledger snapshot
#[derive(Debug, Clone)]
pub struct Replay {
    entries: Arc<Vec<HistoryEntry>>,
    pos: usize,
}

impl Replay {
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[HistoryEntry] {
        &self.entries
    }
}

impl Iterator for Replay {
    type Item = HistoryEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.pos)?.clone();
        self.pos += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.entries.len() - self.pos;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Replay {}
