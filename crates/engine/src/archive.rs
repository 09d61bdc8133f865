//! On-disk case archive
//!
//! ```text
//! <root>/
//!   session.jsonl                     history of commands run with no active case
//!   Investigations/<case_id>/
//!     case.json                       case metadata + evidence records
//!     history.jsonl                   case history, one entry per line
//!     evidence/<evidence_id>.bin      evidence content
//! ```

use crate::case_registry::{CaseRegistry, CaseSnapshot};
use crate::evidence::FsBlobStore;
use crate::ledger::Ledger;
use mimir_core::path_safety::safe_join;
use mimir_core::{HistoryEntry, MimirError, Result, Scope};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const INVESTIGATIONS_DIR: &str = "Investigations";
const CASE_FILE: &str = "case.json";
const HISTORY_FILE: &str = "history.jsonl";
const SESSION_HISTORY_FILE: &str = "session.jsonl";
const EVIDENCE_DIR: &str = "evidence";

fn invalid_path(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}

fn io_failure(action: &str, path: &Path, err: impl std::fmt::Display) -> MimirError {
    MimirError::Integrity(format!("cannot {} {}: {}", action, path.display(), err))
}

#[derive(Debug, Clone)]
pub struct CaseArchive {
    root: PathBuf,
}

impl CaseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn investigations_dir(&self) -> PathBuf {
        self.root.join(INVESTIGATIONS_DIR)
    }

    pub fn case_dir(&self, case_id: &str) -> io::Result<PathBuf> {
        safe_join(&self.investigations_dir(), case_id).map_err(invalid_path)
    }

    pub fn blob_store(&self, case_id: &str) -> io::Result<FsBlobStore> {
        FsBlobStore::open(self.case_dir(case_id)?.join(EVIDENCE_DIR))
    }

    pub fn history_path(&self, scope: &Scope) -> io::Result<PathBuf> {
        match scope {
            Scope::Session => Ok(self.root.join(SESSION_HISTORY_FILE)),
            Scope::Case(id) => Ok(self.case_dir(id)?.join(HISTORY_FILE)),
        }
    }

    /// Write `case.json` through a temp file and rename
    pub fn save(&self, snapshot: &CaseSnapshot) -> Result<()> {
        let dir = self
            .case_dir(&snapshot.case.id)
            .map_err(|e| MimirError::Argument(e.to_string()))?;
        fs::create_dir_all(&dir).map_err(|e| io_failure("create", &dir, e))?;

        let path = dir.join(CASE_FILE);
        let tmp = dir.join(format!(".{}.tmp", CASE_FILE));
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| io_failure("serialize", &path, e))?;
        {
            let mut file = fs::File::create(&tmp).map_err(|e| io_failure("create", &tmp, e))?;
            file.write_all(&json)
                .and_then(|_| file.sync_all())
                .map_err(|e| io_failure("write", &tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| io_failure("replace", &path, e))?;

        tracing::debug!(case = %snapshot.case.id, path = %path.display(), "case saved");
        Ok(())
    }

    pub fn load(&self, case_id: &str) -> Result<CaseSnapshot> {
        let path = self
            .case_dir(case_id)
            .map_err(|e| MimirError::Argument(e.to_string()))?
            .join(CASE_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MimirError::not_found("case", case_id));
            }
            Err(e) => return Err(io_failure("read", &path, e)),
        };
        let snapshot: CaseSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| io_failure("parse", &path, e))?;
        if snapshot.case.id != case_id {
            return Err(MimirError::Integrity(format!(
                "{} describes case {}",
                path.display(),
                snapshot.case.id
            )));
        }
        Ok(snapshot)
    }

    /// Entries of one scope in file order; a missing file is an empty history
    pub fn load_history(&self, scope: &Scope) -> Result<Vec<HistoryEntry>> {
        let path = self
            .history_path(scope)
            .map_err(|e| MimirError::Argument(e.to_string()))?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_failure("read", &path, e)),
        };

        let mut entries = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: HistoryEntry = serde_json::from_str(line).map_err(|e| {
                MimirError::Integrity(format!("{} line {}: {}", path.display(), n + 1, e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Ids of archived cases (directories holding a `case.json`), sorted
    pub fn case_ids(&self) -> Result<Vec<String>> {
        let dir = self.investigations_dir();
        let read = match fs::read_dir(&dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_failure("list", &dir, e)),
        };

        let mut ids: Vec<String> = read
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(CASE_FILE).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Load every archived case and its history, plus the session history.
    /// Cases register in creation order. Returns the number of cases restored.
    pub fn restore_all(&self, registry: &CaseRegistry, ledger: &Ledger) -> Result<usize> {
        let mut snapshots = self
            .case_ids()?
            .iter()
            .map(|id| self.load(id))
            .collect::<Result<Vec<_>>>()?;
        snapshots.sort_by(|a, b| {
            (a.case.created_at, &a.case.id).cmp(&(b.case.created_at, &b.case.id))
        });

        let count = snapshots.len();
        for snapshot in snapshots {
            let scope = Scope::case(snapshot.case.id.as_str());
            registry.restore(snapshot)?;
            ledger.load(&scope, self.load_history(&scope)?)?;
        }
        ledger.load(&Scope::Session, self.load_history(&Scope::Session)?)?;

        tracing::info!(root = %self.root.display(), cases = count, "archive restored");
        Ok(count)
    }
}
