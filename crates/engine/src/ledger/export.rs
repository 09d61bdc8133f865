// engine/ledger/export.rs
// Deterministic history exports - JSON envelope, JSONL, Markdown

use crate::case_registry::CaseSnapshot;
use mimir_core::{compute_sha256, Case, Evidence, HistoryEntry, MimirError, Outcome, Result, Scope};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const EXPORT_FORMAT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Jsonl,
    Markdown,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Jsonl => "jsonl",
            ExportFormat::Markdown => "markdown",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Jsonl => "jsonl",
            ExportFormat::Markdown => "md",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = MimirError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "jsonl" => Ok(ExportFormat::Jsonl),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            other => Err(MimirError::Argument(format!(
                "unknown export format {:?} (expected json, jsonl or markdown)",
                other
            ))),
        }
    }
}

/// Versioned JSON export of one ledger scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerExport {
    pub format_version: String,
    pub scope: Scope,
    pub entry_count: usize,
    /// SHA-256 over the compact JSON encoding of `entries`
    pub payload_sha256: String,
    pub entries: Vec<HistoryEntry>,
}

impl LedgerExport {
    pub fn new(scope: Scope, entries: Vec<HistoryEntry>) -> Result<Self> {
        Ok(Self {
            format_version: EXPORT_FORMAT_VERSION.to_string(),
            payload_sha256: payload_digest(&entries)?,
            entry_count: entries.len(),
            scope,
            entries,
        })
    }

    /// Recompute the payload checksum
    pub fn verify(&self) -> bool {
        self.entry_count == self.entries.len()
            && payload_digest(&self.entries).map_or(false, |d| d == self.payload_sha256)
    }
}

/// Case metadata, evidence manifest and full history in one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseAuditBundle {
    pub format_version: String,
    pub case: Case,
    pub evidence: Vec<Evidence>,
    pub history: Vec<HistoryEntry>,
    /// SHA-256 over the compact JSON encoding of `(case, evidence, history)`
    pub payload_sha256: String,
}

impl CaseAuditBundle {
    pub fn build(snapshot: CaseSnapshot, history: Vec<HistoryEntry>) -> Result<Self> {
        let payload_sha256 = bundle_digest(&snapshot.case, &snapshot.evidence, &history)?;
        Ok(Self {
            format_version: EXPORT_FORMAT_VERSION.to_string(),
            case: snapshot.case,
            evidence: snapshot.evidence,
            history,
            payload_sha256,
        })
    }

    pub fn verify(&self) -> bool {
        bundle_digest(&self.case, &self.evidence, &self.history)
            .map_or(false, |d| d == self.payload_sha256)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(serialize_error)
    }
}

fn serialize_error(err: serde_json::Error) -> MimirError {
    MimirError::Integrity(format!("cannot serialize export: {}", err))
}

pub fn payload_digest(entries: &[HistoryEntry]) -> Result<String> {
    let bytes = serde_json::to_vec(entries).map_err(serialize_error)?;
    Ok(compute_sha256(&bytes))
}

fn bundle_digest(case: &Case, evidence: &[Evidence], history: &[HistoryEntry]) -> Result<String> {
    let bytes = serde_json::to_vec(&(case, evidence, history)).map_err(serialize_error)?;
    Ok(compute_sha256(&bytes))
}

/// Render entries of one scope. Same entries, same bytes.
pub fn render(scope: &Scope, entries: &[HistoryEntry], format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => {
            let export = LedgerExport::new(scope.clone(), entries.to_vec())?;
            serde_json::to_vec_pretty(&export).map_err(serialize_error)
        }
        ExportFormat::Jsonl => {
            let mut out = Vec::new();
            for entry in entries {
                serde_json::to_writer(&mut out, entry).map_err(serialize_error)?;
                out.push(b'\n');
            }
            Ok(out)
        }
        ExportFormat::Markdown => Ok(to_markdown(scope, entries).into_bytes()),
    }
}

fn to_markdown(scope: &Scope, entries: &[HistoryEntry]) -> String {
    let mut md = format!("# History: {}\n\n", scope);
    if entries.is_empty() {
        md.push_str("_No commands recorded._\n");
        return md;
    }

    md.push_str("| # | Time (UTC) | Actor | Command | Arguments | Outcome |\n");
    md.push_str("|---|---|---|---|---|---|\n");
    for entry in entries {
        let args = entry
            .args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        let outcome = match &entry.outcome {
            Outcome::Ok { summary } => format!("ok: {}", summary),
            Outcome::Error(report) => format!("error ({}): {}", report.code, report.message),
        };
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            entry.sequence,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            cell(&entry.actor),
            cell(&entry.command),
            cell(&args),
            cell(&outcome),
        ));
    }
    md
}

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_core::PendingEntry;

    fn entries() -> Vec<HistoryEntry> {
        vec![
            PendingEntry::new("verify", "alice", Outcome::ok("E1 intact"))
                .into_entry(Scope::case("C1"), 1),
            PendingEntry::new(
                "foo",
                "alice",
                Outcome::from_error(&MimirError::not_found("command", "foo")),
            )
            .into_entry(Scope::case("C1"), 2),
        ]
    }

    #[test]
    fn test_json_envelope_verifies() {
        let scope = Scope::case("C1");
        let bytes = render(&scope, &entries(), ExportFormat::Json).unwrap();
        let mut export: LedgerExport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(export.format_version, "1.0.0");
        assert_eq!(export.entry_count, 2);
        assert!(export.verify());

        export.entries[0].actor = "mallory".into();
        assert!(!export.verify());
    }

    #[test]
    fn test_render_is_deterministic() {
        let scope = Scope::case("C1");
        let entries = entries();
        for format in [ExportFormat::Json, ExportFormat::Jsonl, ExportFormat::Markdown] {
            assert_eq!(
                render(&scope, &entries, format).unwrap(),
                render(&scope, &entries, format).unwrap()
            );
        }
    }

    #[test]
    fn test_jsonl_and_markdown_shape() {
        let scope = Scope::case("C1");
        let jsonl = String::from_utf8(render(&scope, &entries(), ExportFormat::Jsonl).unwrap()).unwrap();
        assert_eq!(jsonl.lines().count(), 2);

        let md = String::from_utf8(render(&scope, &entries(), ExportFormat::Markdown).unwrap()).unwrap();
        assert!(md.starts_with("# History: case:C1"));
        assert!(md.contains("error (not_found)"));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("MD".parse::<ExportFormat>().unwrap(), ExportFormat::Markdown);
        assert!("pdf".parse::<ExportFormat>().is_err());
    }
}
