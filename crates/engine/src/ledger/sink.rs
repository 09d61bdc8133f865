//! Durable destinations for history entries

use crate::archive::CaseArchive;
use mimir_core::HistoryEntry;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, PoisonError};

pub trait LedgerSink: Send + Sync {
    /// Persist one entry. An error means the entry was not recorded.
    fn append(&self, entry: &HistoryEntry) -> Result<(), String>;

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

/// In-memory sink for tests and scratch sessions
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LedgerSink for MemorySink {
    fn append(&self, entry: &HistoryEntry) -> Result<(), String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}

/// One JSONL file per scope inside the case archive, synced after every line
pub struct JsonlSink {
    archive: CaseArchive,
}

impl JsonlSink {
    pub fn new(archive: CaseArchive) -> Self {
        Self { archive }
    }
}

impl LedgerSink for JsonlSink {
    fn append(&self, entry: &HistoryEntry) -> Result<(), String> {
        let path = self
            .archive
            .history_path(&entry.scope)
            .map_err(|e| e.to_string())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
        }

        let mut line = serde_json::to_vec(entry).map_err(|e| e.to_string())?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
        file.write_all(&line)
            .and_then(|_| file.sync_data())
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_core::{Outcome, PendingEntry, Scope};
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_sink_appends_per_scope() {
        let tmp = TempDir::new().unwrap();
        let archive = CaseArchive::new(tmp.path());
        let sink = JsonlSink::new(archive.clone());

        for seq in 1..=2 {
            let entry = PendingEntry::new("evidence-list", "alice", Outcome::ok("0 items"))
                .into_entry(Scope::case("C1"), seq);
            sink.append(&entry).unwrap();
        }
        sink.append(
            &PendingEntry::new("case-list", "alice", Outcome::ok("none"))
                .into_entry(Scope::Session, 1),
        )
        .unwrap();

        let case_log = fs::read_to_string(archive.history_path(&Scope::case("C1")).unwrap()).unwrap();
        assert_eq!(case_log.lines().count(), 2);
        let session_log = fs::read_to_string(archive.history_path(&Scope::Session).unwrap()).unwrap();
        assert_eq!(session_log.lines().count(), 1);
    }
}
