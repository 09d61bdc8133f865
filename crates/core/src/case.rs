//! Case model: a named investigative context grouping evidence and history.

use crate::path_safety::{validate_path_component, PathValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Open,
    Closed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Open => "open",
            CaseStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Case {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reopened_count: u32,
    /// Evidence ids in acquisition order
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl Case {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            status: CaseStatus::Open,
            closed_at: None,
            reopened_count: 0,
            evidence: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == CaseStatus::Open
    }

    /// Returns false when the case was already closed
    pub fn close(&mut self) -> bool {
        if self.status == CaseStatus::Closed {
            return false;
        }
        self.status = CaseStatus::Closed;
        self.closed_at = Some(Utc::now());
        true
    }

    /// Returns false when the case was already open
    pub fn reopen(&mut self) -> bool {
        if self.status == CaseStatus::Open {
            return false;
        }
        self.status = CaseStatus::Open;
        self.closed_at = None;
        self.reopened_count += 1;
        true
    }
}

/// Case ids double as directory names, so they follow path component rules
pub fn validate_case_id(id: &str) -> Result<(), PathValidationError> {
    validate_path_component(id)
}

/// Generated id for cases opened without an analyst-assigned name
pub fn generate_case_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("case-{}", &uuid[..8])
}
