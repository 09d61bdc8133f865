//! What a running handler can see and touch
//!
//! Evidence writes go to the staged transaction of the dispatch and become visible
//! in the case only after the history entry is recorded.

use super::args::BoundArgs;
use super::registry::CommandRegistry;
use crate::case_registry::{CaseRegistry, CaseState};
use crate::evidence::{EvidenceTxn, VerifyReport};
use crate::integrations::IntegrationHub;
use crate::ledger::{Ledger, Replay};
use mimir_core::{Evidence, MimirError, Result, Scope};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct HandlerContext<'a> {
    pub(crate) command: &'a str,
    pub(crate) actor: &'a str,
    pub(crate) args: &'a BoundArgs,
    pub(crate) scope: &'a Scope,
    pub(crate) case: Option<&'a mut CaseState>,
    pub(crate) txn: Option<EvidenceTxn>,
    pub(crate) cases: &'a CaseRegistry,
    pub(crate) commands: &'a CommandRegistry,
    pub(crate) integrations: &'a IntegrationHub,
    pub(crate) ledger: &'a Ledger,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) integration_timeout: Duration,
    /// Set when a change outside the held case could not be persisted
    pub(crate) fatal: Option<MimirError>,
}

impl<'a> HandlerContext<'a> {
    pub fn command(&self) -> &str {
        self.command
    }

    pub fn actor(&self) -> &str {
        self.actor
    }

    pub fn args(&self) -> &BoundArgs {
        self.args
    }

    /// Ledger scope the running command is recorded in
    pub fn scope(&self) -> &Scope {
        self.scope
    }

    pub fn case_id(&self) -> Option<&str> {
        self.scope.case_id()
    }

    /// Locked state of the case this command runs against
    pub fn case(&self) -> Result<&CaseState> {
        self.case.as_deref().ok_or_else(no_active_case)
    }

    pub fn cases(&self) -> &CaseRegistry {
        self.cases
    }

    pub fn commands(&self) -> &CommandRegistry {
        self.commands
    }

    pub fn integrations(&self) -> &IntegrationHub {
        self.integrations
    }

    pub fn ledger(&self) -> &Ledger {
        self.ledger
    }

    pub fn history(&self) -> Replay {
        self.ledger.replay(self.scope)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with `Cancelled` if the dispatch was withdrawn
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MimirError::Cancelled {
                stage: "executing".to_string(),
            });
        }
        Ok(())
    }

    fn staging(&mut self) -> Result<(&CaseState, &mut EvidenceTxn)> {
        let case = self.case.as_deref().ok_or_else(no_active_case)?;
        let txn = self.txn.as_mut().ok_or_else(no_active_case)?;
        Ok((case, txn))
    }

    pub fn add_evidence(&mut self, source: &str, content: &[u8]) -> Result<Evidence> {
        self.checkpoint()?;
        let (case, txn) = self.staging()?;
        txn.acquire(case.evidence(), source, content)
    }

    pub fn add_evidence_from_reader<R: std::io::Read>(
        &mut self,
        source: &str,
        reader: R,
        expected_len: Option<u64>,
    ) -> Result<Evidence> {
        self.checkpoint()?;
        let (case, txn) = self.staging()?;
        txn.acquire_from_reader(case.evidence(), source, reader, expected_len)
    }

    pub fn derive_evidence(
        &mut self,
        parent_id: &str,
        transform: &str,
        content: &[u8],
    ) -> Result<Evidence> {
        self.checkpoint()?;
        let (case, txn) = self.staging()?;
        txn.derive(case.evidence(), parent_id, transform, content)
    }

    pub fn verify(&mut self, evidence_id: &str) -> Result<VerifyReport> {
        let (case, txn) = self.staging()?;
        txn.verify(case.evidence(), evidence_id)
    }

    /// Committed and staged evidence of the current case, in id order
    pub fn list_evidence(&self) -> Result<Vec<Evidence>> {
        let case = self.case()?;
        let mut all = case.evidence().records().to_vec();
        if let Some(txn) = &self.txn {
            all.extend(txn.staged().iter().cloned());
        }
        Ok(all)
    }

    pub fn evidence(&self, evidence_id: &str) -> Result<Evidence> {
        let case = self.case()?;
        self.txn
            .as_ref()
            .and_then(|txn| txn.lookup(case.evidence(), evidence_id))
            .or_else(|| case.evidence().get(evidence_id))
            .cloned()
            .ok_or_else(|| MimirError::not_found("evidence", evidence_id))
    }

    pub fn read_evidence(&self, evidence_id: &str) -> Result<Vec<u8>> {
        let case = self.case()?;
        self.evidence(evidence_id)?;
        case.evidence()
            .blobs()
            .get(evidence_id)
            .map_err(|e| MimirError::Integrity(format!("cannot read {}: {}", evidence_id, e)))
    }

    /// Close a case. The current case is closed through the held lock and saved when
    /// the command is recorded; any other case must not be busy and is saved here.
    pub fn close_case(&mut self, case_id: &str) -> Result<bool> {
        let changed = match self.case.as_deref_mut() {
            Some(state) if state.id() == case_id => state.close(),
            _ => {
                let mut other = self.cases.try_lock_case(case_id)?;
                let changed = other.close();
                self.persist_other(&other)?;
                changed
            }
        };
        self.cases.after_close(case_id, changed);
        Ok(changed)
    }

    pub fn reopen_case(&mut self, case_id: &str) -> Result<bool> {
        let changed = match self.case.as_deref_mut() {
            Some(state) if state.id() == case_id => state.reopen(),
            _ => {
                let mut other = self.cases.try_lock_case(case_id)?;
                let changed = other.reopen();
                self.persist_other(&other)?;
                changed
            }
        };
        if changed {
            tracing::info!(case = case_id, "case reopened");
        }
        Ok(changed)
    }

    fn persist_other(&mut self, state: &CaseState) -> Result<()> {
        self.cases.persist(state).map_err(|err| {
            self.fatal = Some(err.clone());
            err
        })
    }

    /// Call an integration under the dispatch's deadline and cancellation token
    pub async fn invoke(
        &self,
        integration: &str,
        operation: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.integrations
            .call(
                integration,
                operation,
                args,
                self.integration_timeout,
                self.cancel,
            )
            .await
    }

    pub(crate) fn take_txn(&mut self) -> Option<EvidenceTxn> {
        self.txn.take()
    }

    pub(crate) fn take_fatal(&mut self) -> Option<MimirError> {
        self.fatal.take()
    }
}

fn no_active_case() -> MimirError {
    MimirError::Capability("no active case".to_string())
}
