//! Command Registry: name → descriptor, insertion ordered

use super::descriptor::CommandDescriptor;
use chrono::{DateTime, Utc};
use mimir_core::{MimirError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryChangeKind {
    Registered,
    Replaced,
    Unregistered,
}

/// Registry change notice. Not part of any case history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryChange {
    pub kind: RegistryChangeKind,
    pub command: String,
    pub origin: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Table {
    entries: Vec<Arc<CommandDescriptor>>,
    index: HashMap<String, usize>,
}

#[derive(Default)]
pub struct CommandRegistry {
    table: RwLock<Table>,
    changes: RwLock<Vec<RegistryChange>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Conflict` if the name is taken
    pub fn register(&self, descriptor: CommandDescriptor) -> Result<()> {
        self.register_with(descriptor, false)
    }

    /// With `overwrite`, an existing descriptor of the same name is replaced in place
    /// (keeping its list position) and a `Replaced` change is emitted.
    pub fn register_with(&self, descriptor: CommandDescriptor, overwrite: bool) -> Result<()> {
        if descriptor.name.is_empty() || descriptor.name.chars().any(char::is_whitespace) {
            return Err(MimirError::Argument(format!(
                "invalid command name {:?}",
                descriptor.name
            )));
        }

        let name = descriptor.name.clone();
        let origin = descriptor.origin.to_string();
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);

        let kind = match table.index.get(&name).copied() {
            Some(_) if !overwrite => return Err(MimirError::conflict("command", name)),
            Some(i) => {
                table.entries[i] = Arc::new(descriptor);
                RegistryChangeKind::Replaced
            }
            None => {
                let i = table.entries.len();
                table.entries.push(Arc::new(descriptor));
                table.index.insert(name.clone(), i);
                RegistryChangeKind::Registered
            }
        };
        drop(table);

        match kind {
            RegistryChangeKind::Replaced => {
                tracing::info!(command = %name, origin = %origin, "command replaced")
            }
            _ => tracing::debug!(command = %name, origin = %origin, "command registered"),
        }
        self.push_change(kind, name, origin);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<CommandDescriptor>> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let i = table
            .index
            .remove(name)
            .ok_or_else(|| MimirError::not_found("command", name))?;
        let removed = table.entries.remove(i);
        for slot in table.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        drop(table);

        tracing::info!(command = name, "command unregistered");
        self.push_change(
            RegistryChangeKind::Unregistered,
            name.to_string(),
            removed.origin.to_string(),
        );
        Ok(removed)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<CommandDescriptor>> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .index
            .get(name)
            .map(|&i| table.entries[i].clone())
            .ok_or_else(|| MimirError::not_found("command", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .index
            .contains_key(name)
    }

    /// Snapshot in registration order
    pub fn list(&self) -> Vec<Arc<CommandDescriptor>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    pub fn changes(&self) -> Vec<RegistryChange> {
        self.changes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push_change(&self, kind: RegistryChangeKind, command: String, origin: String) {
        self.changes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RegistryChange {
                kind,
                command,
                origin,
                at: Utc::now(),
            });
    }
}
