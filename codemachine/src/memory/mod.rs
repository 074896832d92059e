//! Per-agent memory files.
//!
//! Each agent accumulates an ordered array of memory entries at
//! `memory/<sanitized-agent-id>.json` under the workflow root. Writes are
//! full-file rewrites (atomic replace). Agent ids are sanitised before
//! touching the filesystem, and the resolved path must stay under the
//! memory root — escaping it is a hard [`PathError::Traversal`] error.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PathError, Result, ValidationError};

/// Longest sanitised agent id.
pub const MAX_AGENT_ID_LEN: usize = 255;

/// One remembered item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// The remembered content.
    pub content: String,
}

/// Sanitises an agent id for use as a file stem.
///
/// Lowercases, maps every character outside `[a-z0-9_-]` to `-`, and
/// truncates to [`MAX_AGENT_ID_LEN`]. The result must be non-empty and
/// not consist solely of dashes. Idempotent: sanitising a sanitised id
/// returns it unchanged.
pub fn sanitize_agent_id(raw: &str) -> Result<String> {
    let sanitized: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_AGENT_ID_LEN)
        .collect();

    if sanitized.is_empty() {
        return Err(ValidationError::InvalidField {
            field: "agent_id".to_string(),
            message: "empty after sanitisation".to_string(),
        }
        .into());
    }
    if sanitized.chars().all(|c| c == '-') {
        return Err(ValidationError::InvalidField {
            field: "agent_id".to_string(),
            message: format!("'{raw}' sanitises to dashes only"),
        }
        .into());
    }
    Ok(sanitized)
}

/// Ordered per-agent memory, one JSON file per agent.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    root: PathBuf,
}

impl MemoryStore {
    /// A store rooted at `root` (the workflow's `memory/` directory).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The file backing `agent_id`, after sanitisation and containment
    /// checks.
    pub fn entry_path(&self, agent_id: &str) -> Result<PathBuf> {
        let sanitized = sanitize_agent_id(agent_id)?;
        let resolved = self.root.join(format!("{sanitized}.json"));

        // The sanitised stem cannot contain separators, but the
        // containment invariant is what callers rely on, so enforce it
        // directly.
        if !resolved.starts_with(&self.root) {
            return Err(PathError::Traversal {
                candidate: resolved.display().to_string(),
                root: self.root.display().to_string(),
            }
            .into());
        }
        Ok(resolved)
    }

    /// Every entry for `agent_id`, oldest first.
    pub async fn read(&self, agent_id: &str) -> Result<Vec<MemoryEntry>> {
        let path = self.entry_path(agent_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends one entry, rewriting the whole file.
    pub async fn append(&self, agent_id: &str, content: impl Into<String>) -> Result<()> {
        let path = self.entry_path(agent_id)?;
        let mut entries = self.read(agent_id).await?;
        entries.push(MemoryEntry {
            timestamp: Utc::now(),
            content: content.into(),
        });
        self.rewrite(&path, &entries).await
    }

    /// Drops every entry for `agent_id`.
    pub async fn clear(&self, agent_id: &str) -> Result<()> {
        let path = self.entry_path(agent_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rewrite(&self, path: &Path, entries: &[MemoryEntry]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
