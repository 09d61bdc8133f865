//! History entries: one immutable audit record per dispatched command.

use crate::error::{ErrorCode, ErrorReport, MimirError};
use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Index;
use std::str::FromStr;

/// Ledger partition a history entry belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Scope {
    /// Commands issued while no case was active
    Session,
    Case(String),
}

impl Scope {
    pub fn case(id: impl Into<String>) -> Self {
        Scope::Case(id.into())
    }

    pub fn case_id(&self) -> Option<&str> {
        match self {
            Scope::Case(id) => Some(id),
            Scope::Session => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Session => f.write_str("session"),
            Scope::Case(id) => write!(f, "case:{}", id),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "session" {
            return Ok(Scope::Session);
        }
        match s.strip_prefix("case:") {
            Some(id) if !id.is_empty() => Ok(Scope::Case(id.to_string())),
            _ => Err(format!("invalid ledger scope: {}", s)),
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for Scope {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Bound argument value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(v) => write!(f, "{}", v),
            ArgValue::Integer(v) => write!(f, "{}", v),
            ArgValue::Text(v) => f.write_str(v),
        }
    }
}

/// Bound arguments in schema order; serialized as a JSON object keeping that order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgList(Vec<(String, ArgValue)>);

impl ArgList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the value in place if `name` is already present
    pub fn insert(&mut self, name: impl Into<String>, value: ArgValue) {
        let name = name.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Index<&str> for ArgList {
    type Output = ArgValue;

    fn index(&self, name: &str) -> &ArgValue {
        match self.get(name) {
            Some(value) => value,
            None => panic!("no argument named {}", name),
        }
    }
}

impl FromIterator<(String, ArgValue)> for ArgList {
    fn from_iter<I: IntoIterator<Item = (String, ArgValue)>>(iter: I) -> Self {
        let mut list = ArgList::new();
        for (name, value) in iter {
            list.insert(name, value);
        }
        list
    }
}

impl Serialize for ArgList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

struct ArgListVisitor;

impl<'de> Visitor<'de> for ArgListVisitor {
    type Value = ArgList;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of argument names to values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ArgList, A::Error> {
        let mut list = ArgList::new();
        while let Some((name, value)) = access.next_entry::<String, ArgValue>()? {
            list.insert(name, value);
        }
        Ok(list)
    }
}

impl<'de> Deserialize<'de> for ArgList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(ArgListVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok { summary: String },
    Error(ErrorReport),
}

impl Outcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        Outcome::Ok {
            summary: summary.into(),
        }
    }

    pub fn from_error(err: &MimirError) -> Self {
        Outcome::Error(ErrorReport::from(err))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Outcome::Ok { .. } => None,
            Outcome::Error(report) => Some(report.code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Per-scope sequence number, starting at 1 with no gaps
    pub sequence: u64,
    pub scope: Scope,
    pub timestamp: DateTime<Utc>,
    /// Literal command name as typed, kept even if the command is later unregistered
    pub command: String,
    pub args: ArgList,
    pub outcome: Outcome,
    pub actor: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Everything in a history entry except the fields the ledger assigns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub command: String,
    pub args: ArgList,
    pub outcome: Outcome,
    pub actor: String,
    pub duration_ms: u64,
}

impl PendingEntry {
    pub fn new(command: impl Into<String>, actor: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            command: command.into(),
            args: ArgList::new(),
            outcome,
            actor: actor.into(),
            duration_ms: 0,
        }
    }

    pub fn with_args(mut self, args: ArgList) -> Self {
        self.args = args;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn into_entry(self, scope: Scope, sequence: u64) -> HistoryEntry {
        HistoryEntry {
            sequence,
            scope,
            timestamp: Utc::now(),
            command: self.command,
            args: self.args,
            outcome: self.outcome,
            actor: self.actor,
            duration_ms: self.duration_ms,
        }
    }
}
