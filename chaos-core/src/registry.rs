//! Name-indexed capability registry shared by actions and assertions.
//!
//! Registries are constructed explicitly at startup and handed to the
//! runner; nothing is registered as an import side effect. Entries are never
//! removed, so lookups can hand out cheap `Arc` clones.

use crate::error::{ChaosError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Anything addressable by a unique name.
pub trait Capability: Send + Sync {
    /// Identifier used in scenarios and on the command line, e.g. `kill-leader`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;
}

pub struct Registry<C: ?Sized> {
    kind: &'static str,
    entries: RwLock<HashMap<String, Arc<C>>>,
}

impl<C: Capability + ?Sized> Registry<C> {
    /// `kind` names the capability family in error messages ("action", "assertion").
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, capability: Arc<C>) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let name = capability.name().to_string();
        if entries.contains_key(&name) {
            return Err(ChaosError::AlreadyRegistered {
                kind: self.kind,
                name,
            });
        }
        tracing::debug!(kind = self.kind, name = %name, "registered capability");
        entries.insert(name, capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<C>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| ChaosError::not_found(format!("{} {name:?}", self.kind)))
    }

    /// All registered names in lexicographic order.
    pub fn list(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every registered capability, unordered.
    pub fn all(&self) -> Vec<Arc<C>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}
