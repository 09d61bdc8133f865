//! Runtime configuration
//!
//! Defaults, then environment variables:
//! - `MIMIR_PATH`: archive root (default `~/Mimir`)
//! - `MIMIR_ACTOR`: analyst name recorded in custody and history
//! - `MIMIR_INTEGRATION_TIMEOUT_MS`: deadline for each integration call
//! - `MIMIR_ALLOW_CLOSED_EVIDENCE`: `true` lets closed cases take new evidence
//!
//! Command-line flags are applied on top by the binary.

use crate::archive::CaseArchive;
use crate::case_registry::{CasePolicy, CaseRegistry, CaseStorage};
use crate::commands::CommandRegistry;
use crate::dispatcher::{Dispatcher, DEFAULT_INTEGRATION_TIMEOUT};
use crate::integrations::IntegrationHub;
use crate::ledger::{JsonlSink, Ledger};
use mimir_core::{MimirError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const ENV_PATH: &str = "MIMIR_PATH";
pub const ENV_ACTOR: &str = "MIMIR_ACTOR";
pub const ENV_INTEGRATION_TIMEOUT_MS: &str = "MIMIR_INTEGRATION_TIMEOUT_MS";
pub const ENV_ALLOW_CLOSED_EVIDENCE: &str = "MIMIR_ALLOW_CLOSED_EVIDENCE";

const DEFAULT_ACTOR: &str = "analyst";

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Mimir")
}

fn default_timeout_ms() -> u64 {
    DEFAULT_INTEGRATION_TIMEOUT.as_millis() as u64
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MimirConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default)]
    pub actor: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub integration_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub forbid_evidence_on_closed: bool,

    /// Daily-rotated log files go here when set
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for MimirConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            actor: None,
            integration_timeout_ms: default_timeout_ms(),
            forbid_evidence_on_closed: true,
            log_dir: None,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("{}: expected a boolean, got {:?}", key, other)),
    }
}

impl MimirConfig {
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup` (normally the process environment)
    pub fn apply_env<F>(mut self, lookup: F) -> std::result::Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_PATH).filter(|v| !v.trim().is_empty()) {
            self.root = PathBuf::from(path);
        }
        if let Some(actor) = lookup(ENV_ACTOR).filter(|v| !v.trim().is_empty()) {
            self.actor = Some(actor);
        }
        if let Some(timeout) = lookup(ENV_INTEGRATION_TIMEOUT_MS) {
            self.integration_timeout_ms = timeout.trim().parse().map_err(|e| {
                format!("{}: invalid timeout {:?}: {}", ENV_INTEGRATION_TIMEOUT_MS, timeout, e)
            })?;
        }
        if let Some(allow) = lookup(ENV_ALLOW_CLOSED_EVIDENCE) {
            self.forbid_evidence_on_closed = !parse_bool(ENV_ALLOW_CLOSED_EVIDENCE, &allow)?;
        }
        Ok(self)
    }

    /// Configured actor, else the login name, else `analyst`
    pub fn actor(&self) -> String {
        self.actor
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| DEFAULT_ACTOR.to_string())
    }

    pub fn integration_timeout(&self) -> Duration {
        Duration::from_millis(self.integration_timeout_ms)
    }

    pub fn policy(&self) -> CasePolicy {
        CasePolicy {
            forbid_evidence_on_closed: self.forbid_evidence_on_closed,
        }
    }

    pub fn archive(&self) -> CaseArchive {
        CaseArchive::new(&self.root)
    }

    /// Archive-backed dispatcher with built-ins registered and previous cases restored
    pub fn open_dispatcher(&self) -> Result<Dispatcher> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            MimirError::InvalidState(format!("cannot create {}: {}", self.root.display(), e))
        })?;

        let archive = self.archive();
        let cases = Arc::new(CaseRegistry::new(
            self.policy(),
            CaseStorage::Archive(archive.clone()),
        ));
        let ledger = Arc::new(Ledger::new(Arc::new(JsonlSink::new(archive.clone()))));
        let restored = archive.restore_all(&cases, &ledger)?;

        let dispatcher = Dispatcher::new(
            cases,
            Arc::new(CommandRegistry::new()),
            Arc::new(IntegrationHub::new()),
            ledger,
        )
        .with_integration_timeout(self.integration_timeout());
        dispatcher.register_builtins()?;

        tracing::info!(
            root = %self.root.display(),
            restored,
            "mimir workspace ready"
        );
        Ok(dispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MimirConfig::default();
        assert!(config.root.ends_with("Mimir"));
        assert_eq!(config.integration_timeout(), Duration::from_secs(10));
        assert!(config.policy().forbid_evidence_on_closed);
    }

    #[test]
    fn test_env_overrides() {
        let config = MimirConfig::default()
            .apply_env(env(&[
                (ENV_PATH, "/cases"),
                (ENV_ACTOR, "alice"),
                (ENV_INTEGRATION_TIMEOUT_MS, "250"),
                (ENV_ALLOW_CLOSED_EVIDENCE, "yes"),
            ]))
            .unwrap();
        assert_eq!(config.root, PathBuf::from("/cases"));
        assert_eq!(config.actor(), "alice");
        assert_eq!(config.integration_timeout_ms, 250);
        assert!(!config.forbid_evidence_on_closed);
    }

    #[test]
    fn test_bad_env_values() {
        assert!(MimirConfig::default()
            .apply_env(env(&[(ENV_INTEGRATION_TIMEOUT_MS, "soon")]))
            .is_err());
        assert!(MimirConfig::default()
            .apply_env(env(&[(ENV_ALLOW_CLOSED_EVIDENCE, "maybe")]))
            .is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MimirConfig = serde_json::from_str(r#"{"root": "/tmp/m"}"#).unwrap();
        assert_eq!(config.integration_timeout_ms, 10_000);
        assert!(config.forbid_evidence_on_closed);
    }
}
