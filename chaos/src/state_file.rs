//! Persisted handle for faults injected by `chaos inject`.
//!
//! `inject` writes the action name and its run state; `heal` reads it back,
//! rolls the action back and removes the file.

use anyhow::{Context, Result};
use chaos_core::RunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealState {
    pub action: String,
    pub state: RunState,
    pub cluster: String,
    pub injected_at: DateTime<Utc>,
}

impl HealState {
    pub fn new(action: impl Into<String>, state: RunState, cluster: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            state,
            cluster: cluster.into(),
            injected_at: Utc::now(),
        }
    }
}

/// `None` when nothing is pending.
pub fn load(path: &Path) -> Result<Option<HealState>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let state = serde_json::from_str(&content)
        .with_context(|| format!("parsing heal state {}", path.display()))?;
    Ok(Some(state))
}

/// Write via a temp file and rename so a crash never leaves a torn file.
pub fn save(path: &Path, state: &HealState) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}
