//! End-to-end dispatch behaviour against in-memory registries

use async_trait::async_trait;
use mimir_core::{compute_sha256, ErrorCode, HistoryEntry, MimirError, Scope};
use mimir_engine::commands::{handler_fn, verify_descriptor};
use mimir_engine::integrations::commands::{hash_lookup, ipcheck};
use mimir_engine::{
    ArgSpec, ArgType, Capability, CaseRegistry, CommandDescriptor, CommandHandler, CommandOutput,
    CommandRegistry, DispatchRequest, DispatchState, Dispatcher, ExportFormat, HandlerContext,
    IntegrationAdapter, IntegrationError, IntegrationHub, Ledger, LedgerSink,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

fn args(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|s| s.to_string()).collect()
}

fn dispatcher() -> Dispatcher {
    let dispatcher = Dispatcher::in_memory();
    dispatcher.register_builtins().unwrap();
    dispatcher
}

fn open_active(dispatcher: &Dispatcher, id: &str) {
    dispatcher.cases().open_case(id).unwrap();
    dispatcher.cases().set_active_case(id).unwrap();
}

/// Records how many history entries it saw when it started, then yields for a while
struct SequenceWatcher;

#[async_trait]
impl CommandHandler for SequenceWatcher {
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> mimir_core::Result<CommandOutput> {
        let seen = ctx.history().len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after = ctx.history().len();
        Ok(CommandOutput::new(format!("saw {}", seen)).with_data(json!({ "seen": seen, "after": after })))
    }
}

/// Waits until a peer dispatch on another case reaches the same point
struct Rendezvous(Arc<Barrier>);

#[async_trait]
impl CommandHandler for Rendezvous {
    async fn execute(&self, _ctx: &mut HandlerContext<'_>) -> mimir_core::Result<CommandOutput> {
        self.0.wait().await;
        Ok(CommandOutput::new("met"))
    }
}

/// Stages derived evidence, then never finishes on its own
struct StageThenHang;

#[async_trait]
impl CommandHandler for StageThenHang {
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> mimir_core::Result<CommandOutput> {
        ctx.derive_evidence("E1", "carve", b"partial")?;
        std::future::pending::<()>().await;
        Ok(CommandOutput::new("unreachable"))
    }
}

struct Reputation {
    available: bool,
}

#[async_trait]
impl IntegrationAdapter for Reputation {
    fn name(&self) -> &str {
        "abuseipdb"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn invoke(
        &self,
        operation: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, IntegrationError> {
        assert_eq!(operation, "check_ip");
        match args["ip"].as_str() {
            Some("10.9.9.9") => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!(null))
            }
            Some("192.0.2.1") => Err(IntegrationError::Upstream("rate limited".into())),
            Some(ip) => Ok(json!({ "summary": format!("{} score 97", ip), "score": 97 })),
            None => Err(IntegrationError::Upstream("missing ip".into())),
        }
    }
}

struct BrokenSink {
    broken: AtomicBool,
}

impl LedgerSink for BrokenSink {
    fn append(&self, _entry: &HistoryEntry) -> Result<(), String> {
        if self.broken.load(Ordering::SeqCst) {
            Err("audit volume is read-only".to_string())
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_unknown_command_then_hash_check() {
    let dispatcher = Dispatcher::in_memory();
    open_active(&dispatcher, "C1");
    let evidence = dispatcher
        .cases()
        .attach_evidence("C1", "disk0.img", b"\x00\x01", "alice")
        .await
        .unwrap();
    assert_eq!(evidence.fingerprint(), compute_sha256(b"\x00\x01"));

    let result = dispatcher.dispatch("foo", &[], "alice").await.unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::NotFound));
    assert_eq!(result.state, DispatchState::Aborted);
    assert_eq!(result.aborted_at, Some(DispatchState::Resolving));
    assert_eq!(result.scope, Scope::case("C1"));
    assert_eq!(result.sequence, 1);

    dispatcher
        .commands()
        .register(verify_descriptor("hash-check"))
        .unwrap();
    let desc = dispatcher.commands().resolve("hash-check").unwrap();
    assert_eq!(desc.capabilities, vec![Capability::ActiveCase]);

    let result = dispatcher
        .dispatch("hash-check", &args(&[evidence.id()]), "alice")
        .await
        .unwrap();
    assert!(result.is_ok(), "{}", result.message());
    assert_eq!(result.state, DispatchState::Done);
    assert_eq!(result.data["intact"], true);
    assert_eq!(result.sequence, 2);

    let history: Vec<HistoryEntry> = dispatcher.ledger().replay(&Scope::case("C1")).collect();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].command, "foo");
    assert!(!history[0].outcome.is_ok());
    assert_eq!(history[1].command, "hash-check");
    assert!(history[1].outcome.is_ok());
    assert_eq!(history[1].args["evidence"].as_str(), Some("E1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_case_dispatches_are_serialized() {
    let dispatcher = Arc::new(Dispatcher::in_memory());
    open_active(&dispatcher, "C1");
    dispatcher
        .commands()
        .register(CommandDescriptor::new("watch-seq", SequenceWatcher).requires(Capability::ActiveCase))
        .unwrap();

    let a = {
        let d = dispatcher.clone();
        tokio::spawn(async move { d.dispatch("watch-seq", &[], "alice").await })
    };
    let b = {
        let d = dispatcher.clone();
        tokio::spawn(async move { d.dispatch("watch-seq", &[], "bob").await })
    };
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    let mut seqs = vec![a.sequence, b.sequence];
    seqs.sort();
    assert_eq!(seqs, vec![1, 2]);

    // Each handler saw exactly the entries recorded before it, and nothing landed
    // while it was running.
    for result in [&a, &b] {
        let seen = result.data["seen"].as_u64().unwrap();
        assert_eq!(seen, result.sequence - 1);
        assert_eq!(result.data["after"].as_u64().unwrap(), seen);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_cases_run_in_parallel() {
    let dispatcher = Arc::new(Dispatcher::in_memory());
    dispatcher.cases().open_case("C1").unwrap();
    dispatcher.cases().open_case("C2").unwrap();
    let barrier = Arc::new(Barrier::new(2));
    dispatcher
        .commands()
        .register(CommandDescriptor::new("meet", Rendezvous(barrier)))
        .unwrap();

    let run = |case: &'static str| {
        let d = dispatcher.clone();
        tokio::spawn(async move { d.dispatch_in(case, "meet", &[], "alice").await })
    };
    let both = async {
        let (a, b) = tokio::join!(run("C1"), run("C2"));
        (a.unwrap().unwrap(), b.unwrap().unwrap())
    };
    let (a, b) = tokio::time::timeout(Duration::from_secs(5), both)
        .await
        .expect("dispatches on different cases must not block each other");

    assert_eq!((a.scope.clone(), a.sequence), (Scope::case("C1"), 1));
    assert_eq!((b.scope.clone(), b.sequence), (Scope::case("C2"), 1));
}

#[tokio::test]
async fn test_unregistered_command_has_no_side_effects() {
    let dispatcher = dispatcher();
    open_active(&dispatcher, "C1");
    dispatcher
        .cases()
        .attach_evidence("C1", "mem.raw", b"abc", "alice")
        .await
        .unwrap();
    let before = dispatcher.cases().snapshot("C1").await.unwrap();

    let result = dispatcher
        .dispatch("evidence-nuke", &args(&["E1"]), "alice")
        .await
        .unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::NotFound));

    assert_eq!(dispatcher.cases().snapshot("C1").await.unwrap(), before);
    let entry = dispatcher
        .ledger()
        .replay(&Scope::case("C1"))
        .next()
        .unwrap();
    assert_eq!(entry.command, "evidence-nuke");
    assert_eq!(entry.args["$1"].as_str(), Some("E1"));
}

#[tokio::test]
async fn test_argument_and_capability_failures_are_recorded() {
    let dispatcher = dispatcher();

    // No active case: recorded in the session scope
    let result = dispatcher
        .dispatch("evidence-list", &[], "alice")
        .await
        .unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::Capability));
    assert_eq!(result.aborted_at, Some(DispatchState::CheckingCapabilities));
    assert_eq!(result.scope, Scope::Session);

    open_active(&dispatcher, "C1");
    let result = dispatcher
        .dispatch("verify", &args(&["not-an-id"]), "alice")
        .await
        .unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::Argument));
    assert_eq!(result.aborted_at, Some(DispatchState::ValidatingArgs));

    let result = dispatcher
        .dispatch("verify", &args(&["E1", "E2"]), "alice")
        .await
        .unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::Argument));

    assert_eq!(dispatcher.ledger().len(&Scope::Session), 1);
    assert_eq!(dispatcher.ledger().len(&Scope::case("C1")), 2);
}

#[tokio::test]
async fn test_handler_errors_and_panics_become_handler_errors() {
    let dispatcher = dispatcher();
    open_active(&dispatcher, "C1");
    dispatcher
        .commands()
        .register(
            CommandDescriptor::new(
                "stage-and-fail",
                handler_fn(|ctx| {
                    ctx.add_evidence("scratch", b"temp")?;
                    Err(MimirError::Integrity("checksum mismatch in carve".into()))
                }),
            )
            .requires(Capability::ActiveCase),
        )
        .unwrap();
    dispatcher
        .commands()
        .register(CommandDescriptor::new(
            "explode",
            handler_fn(|_| panic!("parser bug")),
        ))
        .unwrap();

    let result = dispatcher.dispatch("stage-and-fail", &[], "alice").await.unwrap();
    assert_eq!(result.state, DispatchState::Done);
    assert_eq!(result.error_code(), Some(ErrorCode::Handler));
    match &result.outcome {
        mimir_core::Outcome::Error(report) => assert_eq!(report.cause, Some(ErrorCode::Integrity)),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(dispatcher.cases().get("C1").unwrap().evidence.is_empty());

    let result = dispatcher.dispatch("explode", &[], "alice").await.unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::Handler));
    assert!(result.message().contains("parser bug"));

    // Verifying unknown evidence is a handler failure caused by NotFound
    let result = dispatcher.dispatch("verify", &args(&["E7"]), "alice").await.unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::Handler));

    let seqs: Vec<u64> = dispatcher
        .ledger()
        .replay(&Scope::case("C1"))
        .map(|e| e.sequence)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_cancel_discards_staged_evidence() {
    let dispatcher = Arc::new(dispatcher());
    open_active(&dispatcher, "C1");
    dispatcher
        .cases()
        .attach_evidence("C1", "mail.eml", b"raw", "alice")
        .await
        .unwrap();
    dispatcher
        .commands()
        .register(CommandDescriptor::new("carve", StageThenHang).requires(Capability::ActiveCase))
        .unwrap();

    let cancel = CancellationToken::new();
    let task = {
        let d = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            d.dispatch_with_cancel(DispatchRequest::new("carve", &[], "alice"), cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let result = task.await.unwrap().unwrap();

    assert_eq!(result.state, DispatchState::Aborted);
    assert_eq!(result.aborted_at, Some(DispatchState::Executing));
    assert_eq!(result.error_code(), Some(ErrorCode::Cancelled));

    let snapshot = dispatcher.cases().snapshot("C1").await.unwrap();
    assert_eq!(snapshot.evidence.len(), 1);
    assert_eq!(snapshot.case.evidence, vec!["E1"]);

    // The case is usable again and the next id is not burnt
    let result = dispatcher.dispatch("verify", &args(&["E1"]), "alice").await.unwrap();
    assert!(result.is_ok());
    assert_eq!(result.sequence, 2);
}

#[tokio::test]
async fn test_integration_commands() {
    let dispatcher = dispatcher().with_integration_timeout(Duration::from_millis(50));
    dispatcher
        .register_integration(
            Arc::new(Reputation { available: true }),
            vec![ipcheck()],
            false,
        )
        .unwrap();

    let result = dispatcher.dispatch("ipcheck", &args(&["8.8.8.8"]), "alice").await.unwrap();
    assert!(result.is_ok(), "{}", result.message());
    assert_eq!(result.message(), "abuseipdb 8.8.8.8: 8.8.8.8 score 97");
    assert_eq!(result.data["score"], 97);

    let result = dispatcher.dispatch("ipcheck", &args(&["10.9.9.9"]), "alice").await.unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::Handler));
    match &result.outcome {
        mimir_core::Outcome::Error(report) => assert_eq!(report.cause, Some(ErrorCode::Timeout)),
        other => panic!("unexpected outcome {:?}", other),
    }

    let result = dispatcher.dispatch("ipcheck", &args(&["192.0.2.1"]), "alice").await.unwrap();
    match &result.outcome {
        mimir_core::Outcome::Error(report) => {
            assert_eq!(report.cause, Some(ErrorCode::Integration));
            assert!(report.message.contains("rate limited"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    // Conflicting registration leaves nothing behind
    assert!(matches!(
        dispatcher.register_integration(
            Arc::new(Reputation { available: true }),
            vec![ipcheck()],
            false
        ),
        Err(MimirError::Conflict { .. })
    ));

    dispatcher.unregister_integration("abuseipdb").unwrap();
    let result = dispatcher.dispatch("ipcheck", &args(&["8.8.8.8"]), "alice").await.unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::NotFound));

    let names: Vec<String> = dispatcher
        .ledger()
        .replay(&Scope::Session)
        .map(|e| e.command)
        .collect();
    assert_eq!(names, vec!["ipcheck"; 4]);
}

#[test]
fn test_duplicate_descriptors_register_nothing() {
    let dispatcher = dispatcher();
    let err = dispatcher
        .register_integration(
            Arc::new(Reputation { available: true }),
            vec![ipcheck(), ipcheck()],
            false,
        )
        .unwrap_err();
    assert!(matches!(err, MimirError::Conflict { .. }));
    assert!(dispatcher.integrations().get("abuseipdb").is_none());
    assert!(!dispatcher.commands().contains("ipcheck"));

    // Overwriting does not excuse a repeated name either
    assert!(dispatcher
        .register_integration(
            Arc::new(Reputation { available: true }),
            vec![ipcheck(), ipcheck()],
            true,
        )
        .is_err());
    assert!(dispatcher.integrations().names().is_empty());
}

#[tokio::test]
async fn test_unavailable_integration_fails_capability_check() {
    let dispatcher = dispatcher();
    dispatcher
        .register_integration(
            Arc::new(Reputation { available: false }),
            vec![ipcheck()],
            false,
        )
        .unwrap();
    let result = dispatcher.dispatch("ipcheck", &args(&["8.8.8.8"]), "alice").await.unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::Capability));

    // A descriptor for an integration that was never registered
    dispatcher.commands().register(hash_lookup()).unwrap();
    let digest = compute_sha256(b"sample");
    let result = dispatcher.dispatch("hash-lookup", &args(&[&digest]), "alice").await.unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::Capability));
}

#[tokio::test]
async fn test_ledger_failure_poisons_dispatcher() {
    let sink = Arc::new(BrokenSink {
        broken: AtomicBool::new(false),
    });
    let dispatcher = Dispatcher::new(
        Arc::new(CaseRegistry::in_memory()),
        Arc::new(CommandRegistry::new()),
        Arc::new(IntegrationHub::new()),
        Arc::new(Ledger::new(sink.clone())),
    );
    dispatcher.register_builtins().unwrap();
    dispatcher
        .commands()
        .register(
            CommandDescriptor::new(
                "stage",
                handler_fn(|ctx| {
                    let ev = ctx.add_evidence("note.txt", b"n")?;
                    Ok(CommandOutput::new(ev.id().to_string()))
                }),
            )
            .requires(Capability::ActiveCase),
        )
        .unwrap();
    open_active(&dispatcher, "C1");

    sink.broken.store(true, Ordering::SeqCst);
    let err = dispatcher.dispatch("stage", &[], "alice").await.unwrap_err();
    assert!(matches!(err, MimirError::LedgerWrite(_)));
    assert!(dispatcher.is_poisoned());
    assert!(dispatcher.cases().get("C1").unwrap().evidence.is_empty());

    // Even once storage recovers, the session stays halted
    sink.broken.store(false, Ordering::SeqCst);
    let err = dispatcher.dispatch("case-list", &[], "alice").await.unwrap_err();
    assert!(matches!(err, MimirError::LedgerWrite(_)));
    assert_eq!(dispatcher.ledger().len(&Scope::case("C1")), 0);
}

#[tokio::test]
async fn test_case_close_is_idempotent_through_dispatch() {
    let dispatcher = dispatcher();
    let opened = dispatcher.dispatch("case-open", &args(&["C1"]), "alice").await.unwrap();
    assert!(opened.is_ok());
    assert_eq!(opened.scope, Scope::Session);
    assert_eq!(dispatcher.cases().active_case_id().as_deref(), Some("C1"));

    let first = dispatcher.dispatch("case-close", &[], "alice").await.unwrap();
    assert!(first.is_ok());
    assert_eq!(first.scope, Scope::case("C1"));
    let after_first = dispatcher.cases().get("C1").unwrap();
    assert!(dispatcher.cases().active_case_id().is_none());

    let second = dispatcher
        .dispatch("case-close", &args(&["C1"]), "alice")
        .await
        .unwrap();
    assert!(second.is_ok());
    assert_eq!(second.message(), "Case C1 already closed");
    assert_eq!(dispatcher.cases().get("C1").unwrap(), after_first);

    // Closed cases still accept history but refuse evidence
    dispatcher
        .commands()
        .register(
            CommandDescriptor::new(
                "stage",
                handler_fn(|ctx| {
                    ctx.add_evidence("late.bin", b"late")?;
                    Ok(CommandOutput::new("staged"))
                }),
            )
            .requires(Capability::ActiveCase),
        )
        .unwrap();
    let late = dispatcher.dispatch_in("C1", "stage", &[], "alice").await.unwrap();
    match &late.outcome {
        mimir_core::Outcome::Error(report) => assert_eq!(report.cause, Some(ErrorCode::InvalidState)),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(dispatcher.ledger().len(&Scope::case("C1")), 2);
}

#[tokio::test]
async fn test_dispatch_in_unknown_case() {
    let dispatcher = dispatcher();
    let result = dispatcher.dispatch_in("C404", "case-list", &[], "alice").await.unwrap();
    assert_eq!(result.error_code(), Some(ErrorCode::NotFound));
    assert_eq!(result.scope, Scope::Session);
}

#[tokio::test]
async fn test_overwrite_replaces_handler() {
    let dispatcher = Dispatcher::in_memory();
    let registry = dispatcher.commands();
    registry
        .register(
            CommandDescriptor::new("triage", handler_fn(|_| Ok(CommandOutput::new("v1"))))
                .arg(ArgSpec::optional("depth", ArgType::Integer)),
        )
        .unwrap();
    assert!(registry
        .register(CommandDescriptor::new(
            "triage",
            handler_fn(|_| Ok(CommandOutput::new("v2")))
        ))
        .is_err());
    registry
        .register_with(
            CommandDescriptor::new("triage", handler_fn(|_| Ok(CommandOutput::new("v2")))),
            true,
        )
        .unwrap();

    let result = dispatcher.dispatch("triage", &[], "alice").await.unwrap();
    assert_eq!(result.message(), "v2");
    assert_eq!(registry.changes().len(), 2);
    // Replacement history is not part of the ledger
    assert_eq!(dispatcher.ledger().len(&Scope::Session), 1);
}

#[tokio::test]
async fn test_history_keeps_argument_order() {
    let dispatcher = Dispatcher::in_memory();
    dispatcher
        .commands()
        .register(
            CommandDescriptor::new("tag", handler_fn(|_| Ok(CommandOutput::new("tagged"))))
                .arg(ArgSpec::required("evidence", ArgType::EvidenceId))
                .arg(ArgSpec::required("label", ArgType::String))
                .arg(ArgSpec::optional("note", ArgType::String)),
        )
        .unwrap();

    let result = dispatcher
        .dispatch("tag", &args(&["note=hot", "label=c2", "E1"]), "alice")
        .await
        .unwrap();
    assert!(result.is_ok(), "{}", result.message());

    let entry = dispatcher.ledger().replay(&Scope::Session).last().unwrap();
    let names: Vec<&str> = entry.args.names().collect();
    assert_eq!(names, vec!["evidence", "label", "note"]);

    let md = dispatcher
        .ledger()
        .export(&Scope::Session, ExportFormat::Markdown)
        .unwrap();
    assert!(String::from_utf8(md).unwrap().contains("evidence=E1 label=c2 note=hot"));
}
