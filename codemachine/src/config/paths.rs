//! Filesystem layout of a workflow root.
//!
//! All state lives under `<cwd>/.codemachine/`:
//!
//! ```text
//! .codemachine/
//!   inputs/specifications.md        input spec (opaque to the core)
//!   workflow/tracking.json          per-step status
//!   workflow/controller-state.json  executor state snapshot
//!   memory/<agent>.json             per-agent memory entries
//!   logs/registry.db                agent monitor store
//!   rate-limits.json                persisted rate-limit entries
//!   summaries/step-<n>.md           per-step summaries
//! ```

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Directory name holding all workflow state.
pub const STATE_DIR: &str = ".codemachine";

/// Resolved paths under one workflow root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowPaths {
    root: PathBuf,
}

impl WorkflowPaths {
    /// Paths for the workflow rooted at `cwd`.
    #[must_use]
    pub fn new(cwd: &Path) -> Self {
        Self {
            root: cwd.join(STATE_DIR),
        }
    }

    /// The `.codemachine/` directory itself.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.root
    }

    /// The input specification file.
    #[must_use]
    pub fn specification(&self) -> PathBuf {
        self.root.join("inputs").join("specifications.md")
    }

    /// Per-step tracking state.
    #[must_use]
    pub fn tracking(&self) -> PathBuf {
        self.root.join("workflow").join("tracking.json")
    }

    /// Executor state snapshot.
    #[must_use]
    pub fn controller_state(&self) -> PathBuf {
        self.root.join("workflow").join("controller-state.json")
    }

    /// Root of per-agent memory files.
    #[must_use]
    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    /// The agent monitor database.
    #[must_use]
    pub fn registry_db(&self) -> PathBuf {
        self.root.join("logs").join("registry.db")
    }

    /// Persisted rate-limit entries.
    #[must_use]
    pub fn rate_limits(&self) -> PathBuf {
        self.root.join("rate-limits.json")
    }

    /// Per-step summary written by the summariser.
    #[must_use]
    pub fn step_summary(&self, index: usize) -> PathBuf {
        self.root.join("summaries").join(format!("step-{index}.md"))
    }

    /// Creates every directory of the layout that does not yet exist.
    pub async fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.root.join("inputs"),
            self.root.join("workflow"),
            self.memory_dir(),
            self.root.join("logs"),
            self.root.join("summaries"),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_under_state_dir() {
        let paths = WorkflowPaths::new(Path::new("/work"));
        assert_eq!(
            paths.rate_limits(),
            PathBuf::from("/work/.codemachine/rate-limits.json")
        );
        assert_eq!(
            paths.registry_db(),
            PathBuf::from("/work/.codemachine/logs/registry.db")
        );
        assert_eq!(
            paths.step_summary(3),
            PathBuf::from("/work/.codemachine/summaries/step-3.md")
        );
    }

    #[tokio::test]
    async fn ensure_layout_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkflowPaths::new(dir.path());
        paths.ensure_layout().await.unwrap();

        assert!(paths.memory_dir().is_dir());
        assert!(paths.registry_db().parent().unwrap().is_dir());
        assert!(paths.tracking().parent().unwrap().is_dir());
    }
}
