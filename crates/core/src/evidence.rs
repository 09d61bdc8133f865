//! Evidence records and their chain of custody
//!
//! Properties:
//! - The fingerprint recorded at acquisition has no setter; records only grow by
//!   appending custody entries
//! - Derived evidence is a new record holding a one-way link to its parent
//! - Custody order is insertion order and survives serialization unchanged

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 of content bytes, lowercase hex
pub fn compute_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// True when `value` is a 64-char hex SHA-256 digest
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CustodyAction {
    /// Content hashed and recorded for the first time
    Acquired,
    /// Record produced by transforming a parent's content
    Derived,
    /// Content re-hashed and matched the recorded fingerprint
    Verified,
    /// Content re-hashed and did not match (or could not be read)
    VerificationFailed,
}

impl CustodyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustodyAction::Acquired => "acquired",
            CustodyAction::Derived => "derived",
            CustodyAction::Verified => "verified",
            CustodyAction::VerificationFailed => "verification_failed",
        }
    }
}

/// One (actor, action, timestamp, resulting-fingerprint) tuple
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustodyEntry {
    pub actor: String,
    pub action: CustodyAction,
    pub timestamp: DateTime<Utc>,
    /// Digest observed when the action completed
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One-way reference from a derived record to the record it came from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentLink {
    pub evidence_id: String,
    /// Parent's final fingerprint at derivation time
    pub fingerprint: String,
    pub transform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Evidence {
    id: String,
    case_id: String,
    source: String,
    fingerprint: String,
    size_bytes: u64,
    acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<ParentLink>,
    custody: Vec<CustodyEntry>,
}

impl Evidence {
    /// New record for freshly acquired content
    pub fn acquired(
        id: impl Into<String>,
        case_id: impl Into<String>,
        source: impl Into<String>,
        fingerprint: impl Into<String>,
        size_bytes: u64,
        actor: impl Into<String>,
    ) -> Self {
        let fingerprint = fingerprint.into();
        let now = Utc::now();
        Self {
            id: id.into(),
            case_id: case_id.into(),
            source: source.into(),
            size_bytes,
            acquired_at: now,
            parent: None,
            custody: vec![CustodyEntry {
                actor: actor.into(),
                action: CustodyAction::Acquired,
                timestamp: now,
                fingerprint: fingerprint.clone(),
                note: None,
            }],
            fingerprint,
        }
    }

    /// New record produced from `parent` by `transform`
    pub fn derived(
        id: impl Into<String>,
        parent: &Evidence,
        transform: impl Into<String>,
        fingerprint: impl Into<String>,
        size_bytes: u64,
        actor: impl Into<String>,
    ) -> Self {
        let fingerprint = fingerprint.into();
        let transform = transform.into();
        let now = Utc::now();
        let parent_fingerprint = parent.final_fingerprint().to_string();
        Self {
            id: id.into(),
            case_id: parent.case_id.clone(),
            source: format!("{}#{}", parent.source, transform),
            size_bytes,
            acquired_at: now,
            custody: vec![CustodyEntry {
                actor: actor.into(),
                action: CustodyAction::Derived,
                timestamp: now,
                fingerprint: fingerprint.clone(),
                note: Some(format!(
                    "from {} ({}) via {}",
                    parent.id, parent_fingerprint, transform
                )),
            }],
            parent: Some(ParentLink {
                evidence_id: parent.id.clone(),
                fingerprint: parent_fingerprint,
                transform,
            }),
            fingerprint,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fingerprint recorded at acquisition; never changes
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    pub fn custody(&self) -> &[CustodyEntry] {
        &self.custody
    }

    /// Fingerprint of the last custody step that did not report a mismatch
    pub fn final_fingerprint(&self) -> &str {
        self.custody
            .iter()
            .rev()
            .find(|e| e.action != CustodyAction::VerificationFailed)
            .map(|e| e.fingerprint.as_str())
            .unwrap_or(&self.fingerprint)
    }

    /// Append a custody entry. Entries are never edited or removed.
    pub fn record_custody(
        &mut self,
        actor: impl Into<String>,
        action: CustodyAction,
        fingerprint: impl Into<String>,
        note: Option<String>,
    ) -> &CustodyEntry {
        self.custody.push(CustodyEntry {
            actor: actor.into(),
            action,
            timestamp: Utc::now(),
            fingerprint: fingerprint.into(),
            note,
        });
        &self.custody[self.custody.len() - 1]
    }

    /// Check content bytes against the acquisition fingerprint
    pub fn matches(&self, content: &[u8]) -> bool {
        compute_sha256(content) == self.fingerprint
    }
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} sha256:{} ({} bytes)",
            self.id, self.source, self.fingerprint, self.size_bytes
        )?;
        if let Some(parent) = &self.parent {
            write!(f, " <- {} [{}]", parent.evidence_id, parent.transform)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            compute_sha256(b"\x00\x01"),
            "b413f47d13ee2fe6c845b2ee141af81de858df4ec549a58b7970bb96645bc8d2"
        );
        assert!(is_sha256_hex(&compute_sha256(b"abc")));
        assert!(!is_sha256_hex("abc"));
    }

    #[test]
    fn test_acquired_record() {
        let fp = compute_sha256(b"disk");
        let ev = Evidence::acquired("E1", "C1", "disk0.img", fp.clone(), 4, "alice");

        assert_eq!(ev.fingerprint(), fp);
        assert_eq!(ev.custody().len(), 1);
        assert_eq!(ev.custody()[0].action, CustodyAction::Acquired);
        assert!(ev.matches(b"disk"));
        assert!(!ev.matches(b"DISK"));
    }

    #[test]
    fn test_derived_links_parent_final_fingerprint() {
        let parent = Evidence::acquired("E1", "C1", "mail.eml", compute_sha256(b"raw"), 3, "alice");
        let child = Evidence::derived(
            "E2",
            &parent,
            "base64-decode",
            compute_sha256(b"decoded"),
            7,
            "alice",
        );

        let link = child.parent().unwrap();
        assert_eq!(link.evidence_id, "E1");
        assert_eq!(link.fingerprint, parent.fingerprint());
        assert_eq!(child.case_id(), "C1");
        assert_eq!(child.custody()[0].action, CustodyAction::Derived);
    }

    #[test]
    fn test_failed_verification_does_not_move_final_fingerprint() {
        let fp = compute_sha256(b"x");
        let mut ev = Evidence::acquired("E1", "C1", "x", fp.clone(), 1, "alice");
        ev.record_custody("bob", CustodyAction::VerificationFailed, compute_sha256(b"y"), None);

        assert_eq!(ev.custody().len(), 2);
        assert_eq!(ev.final_fingerprint(), fp);
        assert_eq!(ev.fingerprint(), fp);
    }

    #[test]
    fn test_serde_preserves_custody_order() {
        let mut ev = Evidence::acquired("E1", "C1", "x", compute_sha256(b"x"), 1, "alice");
        ev.record_custody("bob", CustodyAction::Verified, ev.fingerprint().to_string(), None);
        ev.record_custody("carol", CustodyAction::Verified, ev.fingerprint().to_string(), None);

        let json = serde_json::to_string(&ev).unwrap();
        let back: Evidence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
        assert_eq!(back.custody()[2].actor, "carol");
    }
}
