//! Integration-backed commands
//!
//! Each command forwards a single validated argument to one adapter operation:
//!
//! | command       | integration     | operation     | argument        |
//! |---------------|-----------------|---------------|-----------------|
//! | `ipcheck`     | `abuseipdb`     | `check_ip`    | `ip` (ipv4)     |
//! | `urlcheck`    | `urlhaus`       | `lookup_url`  | `url` (url)     |
//! | `hash-lookup` | `malwarebazaar` | `lookup_hash` | `hash` (sha256) |

use crate::commands::{
    ArgSpec, ArgType, Capability, CommandDescriptor, CommandHandler, CommandOrigin,
    CommandOutput, HandlerContext,
};
use async_trait::async_trait;
use mimir_core::Result;

const SUMMARY_MAX: usize = 120;

pub struct IntegrationCommand {
    integration: String,
    operation: String,
    arg: String,
}

impl IntegrationCommand {
    pub fn new(
        integration: impl Into<String>,
        operation: impl Into<String>,
        arg: impl Into<String>,
    ) -> Self {
        Self {
            integration: integration.into(),
            operation: operation.into(),
            arg: arg.into(),
        }
    }
}

#[async_trait]
impl CommandHandler for IntegrationCommand {
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
        let value = ctx.args().require_str(&self.arg)?.to_string();
        let mut request = serde_json::Map::new();
        request.insert(self.arg.clone(), serde_json::Value::String(value.clone()));

        let response = ctx
            .invoke(
                &self.integration,
                &self.operation,
                &serde_json::Value::Object(request),
            )
            .await?;

        Ok(CommandOutput::new(format!(
            "{} {}: {}",
            self.integration,
            value,
            summarize(&response)
        ))
        .with_data(response))
    }
}

/// Adapter-provided `summary` field, else compact JSON cut to a single line
fn summarize(response: &serde_json::Value) -> String {
    if let Some(summary) = response.get("summary").and_then(|v| v.as_str()) {
        return summary.to_string();
    }
    let compact = response.to_string();
    if compact.chars().count() <= SUMMARY_MAX {
        return compact;
    }
    let cut: String = compact.chars().take(SUMMARY_MAX).collect();
    format!("{}...", cut)
}

fn integration_command(
    name: &str,
    summary: &str,
    integration: &str,
    operation: &str,
    arg: ArgSpec,
) -> CommandDescriptor {
    let arg_name = arg.name.clone();
    CommandDescriptor::new(name, IntegrationCommand::new(integration, operation, arg_name))
        .summary(summary)
        .requires(Capability::Integration(integration.to_string()))
        .arg(arg)
        .origin(CommandOrigin::Integration(integration.to_string()))
}

pub fn ipcheck() -> CommandDescriptor {
    integration_command(
        "ipcheck",
        "Look up IP reputation",
        "abuseipdb",
        "check_ip",
        ArgSpec::required("ip", ArgType::Ipv4).help("IPv4 address"),
    )
}

pub fn urlcheck() -> CommandDescriptor {
    integration_command(
        "urlcheck",
        "Check a URL against known malware distribution sites",
        "urlhaus",
        "lookup_url",
        ArgSpec::required("url", ArgType::Url).help("http(s) URL"),
    )
}

pub fn hash_lookup() -> CommandDescriptor {
    integration_command(
        "hash-lookup",
        "Look up a SHA-256 in a malware sample database",
        "malwarebazaar",
        "lookup_hash",
        ArgSpec::required("hash", ArgType::Sha256).help("SHA-256 digest"),
    )
}

/// Stock commands served by the named integration, empty if none are known
pub fn descriptors_for(integration: &str) -> Vec<CommandDescriptor> {
    match integration {
        "abuseipdb" => vec![ipcheck()],
        "urlhaus" => vec![urlcheck()],
        "malwarebazaar" => vec![hash_lookup()],
        _ => Vec::new(),
    }
}
