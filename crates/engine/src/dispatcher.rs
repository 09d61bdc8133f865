//! Dispatcher
//!
//! Runs one analyst command through
//! `Resolving → ValidatingArgs → CheckingCapabilities → Executing → Recording → Done`,
//! with `Aborted` reachable from every stage before `Recording`. Every dispatch,
//! whatever its fate, ends in exactly one history entry.
//!
//! ## Locking
//!
//! A dispatch targeting a case takes that case's lock before resolution and keeps
//! it until the history entry is written. Evidence the handler stages is committed
//! only after the entry is recorded and is discarded on any failure. `Recording`
//! then saves the held case's state, so history and case state move together.
//!
//! ## Fatal errors
//!
//! Only a ledger failure or a failed case save escapes as `Err`, always as
//! `LedgerWrite`. It poisons the dispatcher: every later dispatch fails with
//! `LedgerWrite` without running anything.

use crate::case_registry::{CaseRegistry, CaseState};
use crate::commands::{
    bind_args, register_builtins, Capability, CommandDescriptor, CommandOrigin, CommandRegistry,
    HandlerContext,
};
use crate::evidence::EvidenceTxn;
use crate::integrations::{IntegrationAdapter, IntegrationHub};
use crate::ledger::Ledger;
use futures::FutureExt;
use mimir_core::{ArgList, ArgValue, ErrorCode, MimirError, Outcome, PendingEntry, Result, Scope};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INTEGRATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Resolving,
    ValidatingArgs,
    CheckingCapabilities,
    Executing,
    Recording,
    Done,
    Aborted,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Resolving => "resolving",
            DispatchState::ValidatingArgs => "validating_args",
            DispatchState::CheckingCapabilities => "checking_capabilities",
            DispatchState::Executing => "executing",
            DispatchState::Recording => "recording",
            DispatchState::Done => "done",
            DispatchState::Aborted => "aborted",
        }
    }
}

/// One command as issued by an analyst
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub command: String,
    pub args: Vec<String>,
    pub actor: String,
    /// Run against this case instead of the registry's active case
    pub case_id: Option<String>,
}

impl DispatchRequest {
    pub fn new(command: impl Into<String>, args: &[String], actor: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: args.to_vec(),
            actor: actor.into(),
            case_id: None,
        }
    }

    pub fn in_case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub command: String,
    pub scope: Scope,
    /// Sequence number of the history entry written for this dispatch
    pub sequence: u64,
    /// `Done` or `Aborted`
    pub state: DispatchState,
    /// Stage an aborted dispatch stopped at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<DispatchState>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    pub duration_ms: u64,
}

impl DispatchResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.outcome.error_code()
    }

    /// Summary on success, error message otherwise
    pub fn message(&self) -> &str {
        match &self.outcome {
            Outcome::Ok { summary } => summary,
            Outcome::Error(report) => &report.message,
        }
    }
}

struct Finished {
    state: DispatchState,
    aborted_at: Option<DispatchState>,
    outcome: Outcome,
    data: serde_json::Value,
    args: ArgList,
    txn: Option<EvidenceTxn>,
    /// Persistence failure raised while the handler ran
    fatal: Option<MimirError>,
}

impl Finished {
    fn aborted(stage: DispatchState, err: &MimirError, args: ArgList) -> Self {
        Self {
            state: DispatchState::Aborted,
            aborted_at: Some(stage),
            outcome: Outcome::from_error(err),
            data: serde_json::Value::Null,
            args,
            txn: None,
            fatal: None,
        }
    }
}

/// Unbound tokens as recorded when argument binding never succeeded
fn raw_args(raw: &[String]) -> ArgList {
    raw.iter()
        .enumerate()
        .map(|(i, v)| (format!("${}", i + 1), ArgValue::Text(v.clone())))
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

pub struct Dispatcher {
    cases: Arc<CaseRegistry>,
    commands: Arc<CommandRegistry>,
    integrations: Arc<IntegrationHub>,
    ledger: Arc<Ledger>,
    integration_timeout: Duration,
    poisoned: RwLock<Option<String>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("integration_timeout", &self.integration_timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        cases: Arc<CaseRegistry>,
        commands: Arc<CommandRegistry>,
        integrations: Arc<IntegrationHub>,
        ledger: Arc<Ledger>,
    ) -> Self {
        Self {
            cases,
            commands,
            integrations,
            ledger,
            integration_timeout: DEFAULT_INTEGRATION_TIMEOUT,
            poisoned: RwLock::new(None),
        }
    }

    /// Memory-backed dispatcher with no commands registered
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(CaseRegistry::in_memory()),
            Arc::new(CommandRegistry::new()),
            Arc::new(IntegrationHub::new()),
            Arc::new(Ledger::in_memory()),
        )
    }

    pub fn with_integration_timeout(mut self, timeout: Duration) -> Self {
        self.integration_timeout = timeout;
        self
    }

    pub fn register_builtins(&self) -> Result<()> {
        register_builtins(&self.commands)
    }

    pub fn cases(&self) -> &Arc<CaseRegistry> {
        &self.cases
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn integrations(&self) -> &Arc<IntegrationHub> {
        &self.integrations
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn integration_timeout(&self) -> Duration {
        self.integration_timeout
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Install an adapter and the commands it serves. Each descriptor is tagged with
    /// the integration's origin and capability. Nothing is registered on conflict,
    /// including two descriptors sharing a name.
    pub fn register_integration(
        &self,
        adapter: Arc<dyn IntegrationAdapter>,
        descriptors: Vec<CommandDescriptor>,
        overwrite: bool,
    ) -> Result<()> {
        let name = adapter.name().to_string();
        let mut seen = HashSet::new();
        if let Some(repeated) = descriptors.iter().find(|d| !seen.insert(d.name.as_str())) {
            return Err(MimirError::conflict("command", repeated.name.clone()));
        }
        if !overwrite {
            if let Some(taken) = descriptors.iter().find(|d| self.commands.contains(&d.name)) {
                return Err(MimirError::conflict("command", taken.name.clone()));
            }
        }

        if overwrite {
            self.integrations.replace(adapter);
        } else {
            self.integrations.register(adapter)?;
        }
        for descriptor in descriptors {
            let descriptor = descriptor
                .requires(Capability::Integration(name.clone()))
                .origin(CommandOrigin::Integration(name.clone()));
            self.commands.register_with(descriptor, overwrite)?;
        }
        Ok(())
    }

    /// Remove an adapter and every command it contributed. History keeps the names.
    pub fn unregister_integration(&self, name: &str) -> Result<()> {
        self.integrations.unregister(name)?;
        let origin = CommandOrigin::Integration(name.to_string());
        for descriptor in self.commands.list() {
            if descriptor.origin == origin {
                self.commands.unregister(&descriptor.name)?;
            }
        }
        Ok(())
    }

    pub async fn dispatch(
        &self,
        command: &str,
        args: &[String],
        actor: &str,
    ) -> Result<DispatchResult> {
        self.dispatch_with_cancel(DispatchRequest::new(command, args, actor), CancellationToken::new())
            .await
    }

    /// Dispatch against a specific case rather than the active one
    pub async fn dispatch_in(
        &self,
        case_id: &str,
        command: &str,
        args: &[String],
        actor: &str,
    ) -> Result<DispatchResult> {
        self.dispatch_with_cancel(
            DispatchRequest::new(command, args, actor).in_case(case_id),
            CancellationToken::new(),
        )
        .await
    }

    pub async fn dispatch_with_cancel(
        &self,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchResult> {
        if let Some(reason) = self
            .poisoned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(MimirError::LedgerWrite(format!(
                "session halted after ledger failure: {}",
                reason
            )));
        }

        let started = Instant::now();
        let target = request.case_id.clone().or_else(|| self.cases.active_case_id());

        let mut guard: Option<OwnedMutexGuard<CaseState>> = None;
        let scope = match target {
            None => Scope::Session,
            Some(id) if !self.cases.contains(&id) => {
                let err = MimirError::not_found("case", id);
                let finished =
                    Finished::aborted(DispatchState::Resolving, &err, raw_args(&request.args));
                return self.record(&request, Scope::Session, None, finished, started);
            }
            Some(id) => {
                let locked = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(MimirError::Cancelled {
                        stage: "waiting for case".to_string(),
                    }),
                    res = self.cases.lock_case(&id) => res,
                };
                let scope = Scope::Case(id);
                match locked {
                    Ok(locked) => guard = Some(locked),
                    Err(err) => {
                        let finished = Finished::aborted(
                            DispatchState::Resolving,
                            &err,
                            raw_args(&request.args),
                        );
                        return self.record(&request, scope, None, finished, started);
                    }
                }
                scope
            }
        };

        let finished = self.run(&request, &scope, guard.as_deref_mut(), &cancel).await;
        self.record(&request, scope, guard.as_deref_mut(), finished, started)
    }

    async fn run(
        &self,
        request: &DispatchRequest,
        scope: &Scope,
        mut case: Option<&mut CaseState>,
        cancel: &CancellationToken,
    ) -> Finished {
        // Resolving
        let descriptor = match self.commands.resolve(&request.command) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                return Finished::aborted(DispatchState::Resolving, &err, raw_args(&request.args))
            }
        };

        // ValidatingArgs
        let args = match bind_args(&descriptor.args, &request.args) {
            Ok(args) => args,
            Err(err) => {
                return Finished::aborted(
                    DispatchState::ValidatingArgs,
                    &err,
                    raw_args(&request.args),
                )
            }
        };

        // CheckingCapabilities
        for capability in &descriptor.capabilities {
            let unmet = match capability {
                Capability::ActiveCase if case.is_none() => Some(format!(
                    "{} requires an active case",
                    descriptor.name
                )),
                Capability::Integration(name) if !self.integrations.is_available(name) => {
                    Some(format!("integration {} is not available", name))
                }
                _ => None,
            };
            if let Some(message) = unmet {
                let err = MimirError::Capability(message);
                return Finished::aborted(
                    DispatchState::CheckingCapabilities,
                    &err,
                    args.into_list(),
                );
            }
        }
        if cancel.is_cancelled() {
            let err = MimirError::Cancelled {
                stage: DispatchState::CheckingCapabilities.as_str().to_string(),
            };
            return Finished::aborted(DispatchState::CheckingCapabilities, &err, args.into_list());
        }

        // Executing
        let txn = case
            .as_deref()
            .map(|state| state.evidence().begin(request.actor.as_str()));
        let mut ctx = HandlerContext {
            command: &request.command,
            actor: &request.actor,
            args: &args,
            scope,
            case: case.as_deref_mut(),
            txn,
            cases: &self.cases,
            commands: &self.commands,
            integrations: &self.integrations,
            ledger: &self.ledger,
            cancel,
            integration_timeout: self.integration_timeout,
            fatal: None,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MimirError::Cancelled {
                stage: DispatchState::Executing.as_str().to_string(),
            }),
            res = AssertUnwindSafe(descriptor.handler.execute(&mut ctx)).catch_unwind() => {
                match res {
                    Ok(res) => res,
                    Err(payload) => Err(MimirError::handler(panic_message(payload))),
                }
            }
        };
        let txn = ctx.take_txn();
        let fatal = ctx.take_fatal();
        drop(ctx);

        let mut finished = match result {
            Ok(output) => Finished {
                state: DispatchState::Done,
                aborted_at: None,
                outcome: Outcome::ok(output.summary),
                data: output.data,
                args: args.into_list(),
                txn,
                fatal: None,
            },
            Err(err) => {
                if let (Some(txn), Some(state)) = (txn, case.as_deref()) {
                    txn.discard(state.evidence());
                }
                match err {
                    MimirError::Cancelled { .. } => {
                        Finished::aborted(DispatchState::Executing, &err, args.into_list())
                    }
                    other => {
                        let err = other.into_handler_failure();
                        Finished {
                            state: DispatchState::Done,
                            aborted_at: None,
                            outcome: Outcome::from_error(&err),
                            data: serde_json::Value::Null,
                            args: args.into_list(),
                            txn: None,
                            fatal: None,
                        }
                    }
                }
            }
        };
        finished.fatal = fatal;
        finished
    }

    fn record(
        &self,
        request: &DispatchRequest,
        scope: Scope,
        case: Option<&mut CaseState>,
        finished: Finished,
        started: Instant,
    ) -> Result<DispatchResult> {
        let duration_ms = started.elapsed().as_millis() as u64;
        let pending = PendingEntry::new(&request.command, &request.actor, finished.outcome.clone())
            .with_args(finished.args)
            .with_duration_ms(duration_ms);

        let entry = match self.ledger.append(&scope, pending) {
            Ok(entry) => entry,
            Err(err) => {
                if let (Some(txn), Some(state)) = (finished.txn, case) {
                    txn.discard(state.evidence());
                }
                return Err(self.halt(request, &scope, err));
            }
        };

        let mut fatal = finished.fatal;
        if let Some(state) = case {
            if let Some(txn) = finished.txn {
                state.commit(txn);
            }
            if let Err(err) = self.cases.persist(state) {
                fatal.get_or_insert(err);
            }
        }
        if let Some(err) = fatal {
            return Err(self.halt(request, &scope, err));
        }

        match &finished.outcome {
            Outcome::Ok { .. } => tracing::debug!(
                command = %request.command,
                scope = %scope,
                sequence = entry.sequence,
                duration_ms,
                "command done"
            ),
            Outcome::Error(report) => tracing::warn!(
                command = %request.command,
                scope = %scope,
                sequence = entry.sequence,
                state = finished.state.as_str(),
                code = %report.code,
                "command failed: {}",
                report.message
            ),
        }
        Ok(DispatchResult {
            command: request.command.clone(),
            scope,
            sequence: entry.sequence,
            state: finished.state,
            aborted_at: finished.aborted_at,
            outcome: finished.outcome,
            data: finished.data,
            duration_ms,
        })
    }

    /// Poison the dispatcher after a history entry or case state was lost
    fn halt(&self, request: &DispatchRequest, scope: &Scope, err: MimirError) -> MimirError {
        let err = match err {
            MimirError::LedgerWrite(_) => err,
            other => MimirError::LedgerWrite(other.to_string()),
        };
        tracing::error!(
            command = %request.command,
            scope = %scope,
            "audit state lost, halting dispatcher: {}",
            err
        );
        *self.poisoned.write().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        err
    }
}
