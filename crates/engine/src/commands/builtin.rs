// engine/commands/builtin.rs
// Built-in shell commands: case lifecycle, evidence, hashing, history, export

use super::context::HandlerContext;
use super::descriptor::{
    handler_fn, ArgSpec, ArgType, Capability, CommandDescriptor, CommandHandler, CommandOutput,
};
use super::registry::CommandRegistry;
use crate::case_registry::CaseSnapshot;
use crate::ledger::{export, CaseAuditBundle, ExportFormat};
use async_trait::async_trait;
use mimir_core::{generate_case_id, ArgValue, MimirError, Outcome, Result};
use serde_json::json;
use std::fs::File;
use std::io::Read;

const DEFAULT_HISTORY_LIMIT: i64 = 20;

fn open_file(path: &str) -> Result<(File, u64)> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MimirError::not_found("file", path),
        _ => MimirError::Integrity(format!("cannot open {}: {}", path, e)),
    })?;
    let len = file
        .metadata()
        .map_err(|e| MimirError::Integrity(format!("cannot stat {}: {}", path, e)))?
        .len();
    Ok((file, len))
}

fn write_file(path: &str, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)
        .map_err(|e| MimirError::InvalidState(format!("cannot write {}: {}", path, e)))
}

/// `verify <evidence>`: re-hash stored content and record the result in custody
pub struct VerifyEvidence;

#[async_trait]
impl CommandHandler for VerifyEvidence {
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
        let id = ctx.args().require_str("evidence")?.to_string();
        let report = ctx.verify(&id)?;
        let summary = if report.intact {
            format!("{} intact (sha256 {})", id, report.expected)
        } else {
            format!(
                "{} MISMATCH: expected {}, found {}",
                id,
                report.expected,
                report.actual.as_deref().unwrap_or("unreadable content")
            )
        };
        let data = serde_json::to_value(&report).unwrap_or_default();
        Ok(CommandOutput::new(summary).with_data(data))
    }
}

/// `evidence-add <path> [source]`
struct AddEvidence;

#[async_trait]
impl CommandHandler for AddEvidence {
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
        let path = ctx.args().require_str("path")?.to_string();
        let source = ctx.args().str("source").unwrap_or(path.as_str()).to_string();
        let (file, len) = open_file(&path)?;
        let evidence = ctx.add_evidence_from_reader(&source, file, Some(len))?;
        Ok(CommandOutput::new(format!(
            "Added {} ({} bytes, sha256 {})",
            evidence.id(),
            evidence.size_bytes(),
            evidence.fingerprint()
        ))
        .with_data(serde_json::to_value(&evidence).unwrap_or_default()))
    }
}

/// `evidence-derive <parent> <transform> <path>`
struct DeriveEvidence;

#[async_trait]
impl CommandHandler for DeriveEvidence {
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
        let parent = ctx.args().require_str("parent")?.to_string();
        let transform = ctx.args().require_str("transform")?.to_string();
        let path = ctx.args().require_str("path")?.to_string();

        let (mut file, len) = open_file(&path)?;
        let mut content = Vec::with_capacity(len as usize);
        file.read_to_end(&mut content)
            .map_err(|e| MimirError::Integrity(format!("read of {} failed: {}", path, e)))?;
        if content.len() as u64 != len {
            return Err(MimirError::Integrity(format!(
                "{} changed while reading: expected {} bytes, read {}",
                path,
                len,
                content.len()
            )));
        }

        let evidence = ctx.derive_evidence(&parent, &transform, &content)?;
        Ok(CommandOutput::new(format!(
            "Derived {} from {} via {}",
            evidence.id(),
            parent,
            transform
        ))
        .with_data(serde_json::to_value(&evidence).unwrap_or_default()))
    }
}

/// `hash <path>`: fingerprint a file without acquiring it
struct HashFile;

#[async_trait]
impl CommandHandler for HashFile {
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
        let path = ctx.args().require_str("path")?.to_string();
        let (mut file, _) = open_file(&path)?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .map_err(|e| MimirError::Integrity(format!("read of {} failed: {}", path, e)))?;
        let digest = mimir_core::compute_sha256(&content);
        Ok(CommandOutput::new(format!("{}  {}", digest, path))
            .with_data(json!({ "path": path, "sha256": digest, "size_bytes": content.len() })))
    }
}

/// `export <format> [path]`: render the current scope's history
struct ExportHistory;

#[async_trait]
impl CommandHandler for ExportHistory {
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
        let format: ExportFormat = ctx.args().require_str("format")?.parse()?;
        let replay = ctx.history();
        let bytes = export::render(ctx.scope(), replay.as_slice(), format)?;

        match ctx.args().str("path") {
            Some(path) => {
                write_file(path, &bytes)?;
                Ok(CommandOutput::new(format!(
                    "Exported {} entries of {} to {}",
                    replay.len(),
                    ctx.scope(),
                    path
                )))
            }
            None => Ok(CommandOutput::new(format!(
                "Exported {} entries of {} as {}",
                replay.len(),
                ctx.scope(),
                format
            ))
            .with_data(json!({ "content": String::from_utf8_lossy(&bytes) }))),
        }
    }
}

/// `case-export <path>`: audit bundle of the active case
struct ExportCase;

#[async_trait]
impl CommandHandler for ExportCase {
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
        let path = ctx.args().require_str("path")?.to_string();
        let snapshot: CaseSnapshot = ctx.case()?.snapshot();
        let case_id = snapshot.case.id.clone();
        let bundle = CaseAuditBundle::build(snapshot, ctx.history().collect())?;
        write_file(&path, &bundle.to_bytes()?)?;
        Ok(CommandOutput::new(format!(
            "Exported case {} ({} evidence, {} history entries) to {}",
            case_id,
            bundle.evidence.len(),
            bundle.history.len(),
            path
        ))
        .with_data(json!({ "payload_sha256": bundle.payload_sha256 })))
    }
}

fn case_open(ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
    let id = ctx
        .args()
        .str("id")
        .map(str::to_string)
        .unwrap_or_else(generate_case_id);
    let case = ctx.cases().open_case(&id)?;
    ctx.cases().set_active_case(&id)?;
    Ok(CommandOutput::new(format!("Opened case {}", id))
        .with_data(serde_json::to_value(&case).unwrap_or_default()))
}

fn case_switch(ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
    let id = ctx.args().require_str("id")?.to_string();
    ctx.cases().set_active_case(&id)?;
    Ok(CommandOutput::new(format!("Active case is now {}", id)))
}

fn case_close(ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
    let id = match ctx.args().str("id") {
        Some(id) => id.to_string(),
        None => ctx
            .case_id()
            .map(str::to_string)
            .ok_or_else(|| MimirError::Argument("no case given and no active case".into()))?,
    };
    let summary = if ctx.close_case(&id)? {
        format!("Closed case {}", id)
    } else {
        format!("Case {} already closed", id)
    };
    Ok(CommandOutput::new(summary))
}

fn case_reopen(ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
    let id = ctx.args().require_str("id")?.to_string();
    let summary = if ctx.reopen_case(&id)? {
        format!("Reopened case {}", id)
    } else {
        format!("Case {} already open", id)
    };
    Ok(CommandOutput::new(summary))
}

fn case_list(ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
    let active = ctx.cases().active_case_id();
    let cases = ctx.cases().list_cases();
    let lines: Vec<String> = cases
        .iter()
        .map(|c| {
            let marker = if active.as_deref() == Some(c.id.as_str()) { "*" } else { " " };
            format!(
                "{} {} [{}] {} evidence",
                marker,
                c.id,
                c.status.as_str(),
                c.evidence.len()
            )
        })
        .collect();
    let summary = if lines.is_empty() {
        "No cases".to_string()
    } else {
        lines.join("\n")
    };
    Ok(CommandOutput::new(summary).with_data(serde_json::to_value(&cases).unwrap_or_default()))
}

fn evidence_list(ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
    let evidence = ctx.list_evidence()?;
    let summary = if evidence.is_empty() {
        "No evidence".to_string()
    } else {
        evidence
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    };
    Ok(CommandOutput::new(summary).with_data(serde_json::to_value(&evidence).unwrap_or_default()))
}

fn evidence_show(ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
    let id = ctx.args().require_str("evidence")?.to_string();
    let evidence = ctx.evidence(&id)?;
    let mut lines = vec![evidence.to_string()];
    for entry in evidence.custody() {
        lines.push(format!(
            "  {} {} {} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.actor,
            entry.action.as_str(),
            entry.fingerprint
        ));
    }
    Ok(CommandOutput::new(lines.join("\n"))
        .with_data(serde_json::to_value(&evidence).unwrap_or_default()))
}

fn history(ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
    let limit = ctx.args().i64("limit").unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit < 1 {
        return Err(MimirError::Argument("limit must be at least 1".into()));
    }
    let replay = ctx.history();
    let skip = replay.len().saturating_sub(limit as usize);
    let lines: Vec<String> = replay
        .skip(skip)
        .map(|entry| {
            let args = entry
                .args
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" ");
            let status = match &entry.outcome {
                Outcome::Ok { .. } => "ok".to_string(),
                Outcome::Error(report) => report.code.to_string(),
            };
            format!("{:>4}  {}  {} {}  [{}]", entry.sequence, entry.actor, entry.command, args, status)
        })
        .collect();
    let summary = if lines.is_empty() {
        format!("No history in {}", ctx.scope())
    } else {
        lines.join("\n")
    };
    Ok(CommandOutput::new(summary))
}

fn help(ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
    if let Some(name) = ctx.args().str("command") {
        let desc = ctx.commands().resolve(name)?;
        let mut lines = vec![format!("{}: {}", desc.usage(), desc.summary)];
        for arg in &desc.args {
            let default = arg
                .default
                .as_ref()
                .map(|d| format!(" (default {})", d))
                .unwrap_or_default();
            lines.push(format!(
                "  {:<12} {:<12} {}{}",
                arg.name,
                arg.ty.as_str(),
                arg.help,
                default
            ));
        }
        for cap in &desc.capabilities {
            lines.push(format!("  requires {}", cap));
        }
        return Ok(CommandOutput::new(lines.join("\n")));
    }

    let lines: Vec<String> = ctx
        .commands()
        .list()
        .iter()
        .map(|d| format!("{:<40} {}", d.usage(), d.summary))
        .collect();
    Ok(CommandOutput::new(lines.join("\n")))
}

pub fn verify_descriptor(name: &str) -> CommandDescriptor {
    CommandDescriptor::new(name, VerifyEvidence)
        .summary("Re-hash evidence content and compare with its recorded fingerprint")
        .requires(Capability::ActiveCase)
        .arg(ArgSpec::required("evidence", ArgType::EvidenceId))
}

pub fn builtin_commands() -> Vec<CommandDescriptor> {
    vec![
        CommandDescriptor::new("case-open", handler_fn(case_open))
            .summary("Open a new case and make it active")
            .arg(ArgSpec::optional("id", ArgType::String).help("generated if omitted")),
        CommandDescriptor::new("case-switch", handler_fn(case_switch))
            .summary("Make an existing case the active case")
            .arg(ArgSpec::required("id", ArgType::String)),
        CommandDescriptor::new("case-close", handler_fn(case_close))
            .summary("Close a case (default: the active case)")
            .arg(ArgSpec::optional("id", ArgType::String)),
        CommandDescriptor::new("case-reopen", handler_fn(case_reopen))
            .summary("Reopen a closed case")
            .arg(ArgSpec::required("id", ArgType::String)),
        CommandDescriptor::new("case-list", handler_fn(case_list)).summary("List cases"),
        CommandDescriptor::new("case-export", ExportCase)
            .summary("Write an audit bundle of the active case")
            .requires(Capability::ActiveCase)
            .arg(ArgSpec::required("path", ArgType::Path)),
        CommandDescriptor::new("evidence-add", AddEvidence)
            .summary("Acquire a file as evidence")
            .requires(Capability::ActiveCase)
            .arg(ArgSpec::required("path", ArgType::Path))
            .arg(ArgSpec::optional("source", ArgType::String).help("defaults to the path")),
        CommandDescriptor::new("evidence-derive", DeriveEvidence)
            .summary("Record a file as derived from existing evidence")
            .requires(Capability::ActiveCase)
            .arg(ArgSpec::required("parent", ArgType::EvidenceId))
            .arg(ArgSpec::required("transform", ArgType::String))
            .arg(ArgSpec::required("path", ArgType::Path)),
        CommandDescriptor::new("evidence-list", handler_fn(evidence_list))
            .summary("List evidence of the active case")
            .requires(Capability::ActiveCase),
        CommandDescriptor::new("evidence-show", handler_fn(evidence_show))
            .summary("Show an evidence record and its chain of custody")
            .requires(Capability::ActiveCase)
            .arg(ArgSpec::required("evidence", ArgType::EvidenceId)),
        verify_descriptor("verify"),
        CommandDescriptor::new("hash", HashFile)
            .summary("SHA-256 of a file")
            .arg(ArgSpec::required("path", ArgType::Path)),
        CommandDescriptor::new("history", handler_fn(history))
            .summary("Show recent history of the current scope")
            .arg(
                ArgSpec::optional("limit", ArgType::Integer)
                    .with_default(ArgValue::Integer(DEFAULT_HISTORY_LIMIT)),
            ),
        CommandDescriptor::new("export", ExportHistory)
            .summary("Export history of the current scope (json, jsonl, markdown)")
            .arg(ArgSpec::required("format", ArgType::String))
            .arg(ArgSpec::optional("path", ArgType::Path)),
        CommandDescriptor::new("help", handler_fn(help))
            .summary("List commands, or describe one")
            .arg(ArgSpec::optional("command", ArgType::String)),
    ]
}

pub fn register_builtins(registry: &CommandRegistry) -> Result<()> {
    for descriptor in builtin_commands() {
        registry.register(descriptor)?;
    }
    Ok(())
}
