//! mimir: interactive shell over a case archive
//!
//! Reads one command per line (`<command> [args...]`, whitespace separated), runs it
//! through the dispatcher and persists every case after each command.

mod logging;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mimir_engine::config::ENV_PATH;
use mimir_engine::{DispatchResult, Dispatcher, MimirConfig};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "mimir")]
#[command(about = "Case and evidence integrity shell for incident responders")]
struct Args {
    /// Archive root holding Investigations/ and session history
    #[arg(long, env = ENV_PATH)]
    root: Option<PathBuf>,

    /// Analyst name recorded in custody and history
    #[arg(long)]
    actor: Option<String>,

    /// Run this command and exit (repeatable)
    #[arg(short = 'c', long = "exec")]
    exec: Vec<String>,

    /// Also write daily-rotated logs here
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Deadline for each integration call, in milliseconds
    #[arg(long)]
    integration_timeout_ms: Option<u64>,

    /// Allow new evidence on closed cases
    #[arg(long)]
    allow_closed_evidence: bool,

    /// Print each result as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> Result<MimirConfig> {
        let mut config = MimirConfig::from_env().map_err(|e| anyhow!(e))?;
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(actor) = &self.actor {
            config.actor = Some(actor.clone());
        }
        if let Some(ms) = self.integration_timeout_ms {
            config.integration_timeout_ms = ms;
        }
        if self.allow_closed_evidence {
            config.forbid_evidence_on_closed = false;
        }
        if self.log_dir.is_some() {
            config.log_dir = self.log_dir.clone();
        }
        Ok(config)
    }
}

struct Shell {
    dispatcher: Dispatcher,
    actor: String,
    json: bool,
}

impl Shell {
    fn prompt(&self) -> String {
        match self.dispatcher.cases().active_case_id() {
            Some(id) => format!("mimir[{}]> ", id),
            None => "mimir> ".to_string(),
        }
    }

    /// Run one input line. `Ok(None)` means the line was blank.
    async fn execute(&self, line: &str) -> Result<Option<DispatchResult>> {
        let mut tokens = line.split_whitespace().map(str::to_string);
        let Some(command) = tokens.next() else {
            return Ok(None);
        };
        let args: Vec<String> = tokens.collect();

        let result = self
            .dispatcher
            .dispatch(&command, &args, &self.actor)
            .await
            .context("audit trail could not be written; refusing further commands")?;

        Ok(Some(result))
    }

    fn print(&self, result: &DispatchResult) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(result)?);
            return Ok(());
        }
        match result.error_code() {
            None => println!("{}", result.message()),
            Some(code) => println!("error[{}]: {}", code, result.message()),
        }
        Ok(())
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = args.config()?;
    let _guard = logging::init_logging(config.log_dir.as_deref(), args.verbose);

    let dispatcher = config
        .open_dispatcher()
        .with_context(|| format!("cannot open archive at {}", config.root.display()))?;
    let shell = Shell {
        dispatcher,
        actor: config.actor(),
        json: args.json,
    };

    if !args.exec.is_empty() {
        let mut failed = false;
        for line in &args.exec {
            if let Some(result) = shell.execute(line).await? {
                failed |= !result.is_ok();
                shell.print(&result)?;
            }
        }
        return Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}", shell.prompt());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        match line.trim() {
            "exit" | "quit" => break,
            line => {
                if let Some(result) = shell.execute(line).await? {
                    shell.print(&result)?;
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("mimir: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell(root: &std::path::Path) -> Shell {
        let config = MimirConfig {
            root: root.to_path_buf(),
            ..MimirConfig::default()
        };
        Shell {
            dispatcher: config.open_dispatcher().unwrap(),
            actor: "alice".to_string(),
            json: false,
        }
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "mimir",
            "--root",
            "/cases",
            "--actor",
            "bob",
            "--integration-timeout-ms",
            "500",
            "--allow-closed-evidence",
            "-c",
            "case-list",
        ]);
        let config = args.config().unwrap();
        assert_eq!(config.root, PathBuf::from("/cases"));
        assert_eq!(config.actor(), "bob");
        assert_eq!(config.integration_timeout_ms, 500);
        assert!(!config.forbid_evidence_on_closed);
        assert_eq!(args.exec, vec!["case-list"]);
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let shell = shell(dir.path());
        assert!(shell.execute("   ").await.unwrap().is_none());
        assert_eq!(shell.prompt(), "mimir> ");
    }

    #[tokio::test]
    async fn test_commands_persist_between_shells() {
        let dir = TempDir::new().unwrap();
        {
            let shell = shell(dir.path());
            let opened = shell.execute("case-open C7").await.unwrap().unwrap();
            assert!(opened.is_ok());
            assert_eq!(shell.prompt(), "mimir[C7]> ");
        }
        assert!(dir.path().join("Investigations/C7/case.json").is_file());

        let shell = shell(dir.path());
        let listed = shell.execute("case-list").await.unwrap().unwrap();
        assert!(listed.message().contains("C7"));
    }
}
