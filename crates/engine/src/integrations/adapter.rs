//! Integration adapter interface
//!
//! An adapter wraps one external analysis service (reputation lookups, sandbox,
//! malware databases). Concrete adapters live outside this crate; the engine only
//! sees this trait.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrationError {
    /// Diagnostic from the external service
    #[error("{0}")]
    Upstream(String),

    #[error("integration unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("cancelled")]
    Cancelled,
}

#[async_trait]
pub trait IntegrationAdapter: Send + Sync {
    /// Registry key, e.g. `abuseipdb`
    fn name(&self) -> &str;

    /// Cheap, non-blocking readiness check (credentials present, binary on PATH, ...)
    fn is_available(&self) -> bool;

    /// Run one operation. Deadlines and cancellation are enforced by the caller.
    async fn invoke(
        &self,
        operation: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, IntegrationError>;
}
