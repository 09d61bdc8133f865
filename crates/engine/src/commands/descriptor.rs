//! Command descriptors: name, capabilities, argument schema and handler

use super::context::HandlerContext;
use async_trait::async_trait;
use mimir_core::{ArgValue, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Precondition checked before a handler runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Capability {
    ActiveCase,
    Integration(String),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::ActiveCase => f.write_str("needs-active-case"),
            Capability::Integration(name) => write!(f, "needs-integration:{}", name),
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "needs-active-case" {
            return Ok(Capability::ActiveCase);
        }
        match s.strip_prefix("needs-integration:") {
            Some(name) if !name.is_empty() => Ok(Capability::Integration(name.to_string())),
            _ => Err(format!("unknown capability: {}", s)),
        }
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.to_string()
    }
}

impl TryFrom<String> for Capability {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgType {
    String,
    Integer,
    Bool,
    /// Filesystem path; checked for emptiness only, existence is the handler's concern
    Path,
    EvidenceId,
    Ipv4,
    Url,
    Sha256,
}

impl ArgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Integer => "integer",
            ArgType::Bool => "bool",
            ArgType::Path => "path",
            ArgType::EvidenceId => "evidence-id",
            ArgType::Ipv4 => "ipv4",
            ArgType::Url => "url",
            ArgType::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: String,
    pub ty: ArgType,
    pub required: bool,
    pub default: Option<ArgValue>,
    pub help: String,
}

impl ArgSpec {
    pub fn required(name: impl Into<String>, ty: ArgType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
            help: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, ty: ArgType) -> Self {
        Self {
            required: false,
            ..Self::required(name, ty)
        }
    }

    /// Optional parameter that binds `value` when omitted
    pub fn with_default(mut self, value: ArgValue) -> Self {
        self.required = false;
        self.default = Some(value);
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }
}

/// Who contributed a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOrigin {
    Builtin,
    Integration(String),
}

impl fmt::Display for CommandOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOrigin::Builtin => f.write_str("builtin"),
            CommandOrigin::Integration(name) => write!(f, "integration:{}", name),
        }
    }
}

/// What a handler hands back on success
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub summary: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl CommandOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> Result<CommandOutput>;
}

/// Adapter for handlers that never await
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&mut HandlerContext<'_>) -> Result<CommandOutput> + Send + Sync,
{
    async fn execute(&self, ctx: &mut HandlerContext<'_>) -> Result<CommandOutput> {
        (self.0)(ctx)
    }
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut HandlerContext<'_>) -> Result<CommandOutput> + Send + Sync,
{
    FnHandler(f)
}

/// Immutable once registered; replaced only wholesale
#[derive(Clone)]
pub struct CommandDescriptor {
    pub name: String,
    pub summary: String,
    pub capabilities: Vec<Capability>,
    pub args: Vec<ArgSpec>,
    pub origin: CommandOrigin,
    pub handler: Arc<dyn CommandHandler>,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, handler: impl CommandHandler + 'static) -> Self {
        Self {
            name: name.into(),
            summary: String::new(),
            capabilities: Vec::new(),
            args: Vec::new(),
            origin: CommandOrigin::Builtin,
            handler: Arc::new(handler),
        }
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn requires(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn arg(mut self, spec: ArgSpec) -> Self {
        self.args.push(spec);
        self
    }

    pub fn origin(mut self, origin: CommandOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn needs_active_case(&self) -> bool {
        self.capabilities.contains(&Capability::ActiveCase)
    }

    /// One-line usage string, e.g. `evidence-derive <parent> <transform> <path>`
    pub fn usage(&self) -> String {
        let mut usage = self.name.clone();
        for arg in &self.args {
            if arg.required {
                usage.push_str(&format!(" <{}>", arg.name));
            } else {
                usage.push_str(&format!(" [{}]", arg.name));
            }
        }
        usage
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("args", &self.args)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
