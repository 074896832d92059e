//! Workflow state persistence.
//!
//! Two files under `.codemachine/workflow/` record where a run stands:
//! `controller-state.json` (executor snapshot) and `tracking.json`
//! (per-step status and agent ids). Both are replaced atomically —
//! write a sibling temp file, then rename — so a crash never leaves a
//! torn file behind. A corrupt file found on disk is logged and treated
//! as absent.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::WorkflowPaths;
use crate::error::Result;

/// Snapshot of the executor, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    /// Workflow id.
    pub workflow_id: String,
    /// Executor state name (`running`, `paused`, …).
    pub state: String,
    /// Index of the current step.
    pub step_index: usize,
    /// Loop iteration counter.
    pub iteration: u32,
    /// When this snapshot was written.
    pub updated_at: DateTime<Utc>,
}

/// Per-step tracking entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTrack {
    /// Step index.
    pub index: usize,
    /// Last observed status (`pending`, `running`, `completed`, …).
    pub status: String,
    /// Agent record ids launched by this step.
    #[serde(default)]
    pub agent_ids: Vec<i64>,
}

/// Reads and writes the two workflow state files.
#[derive(Debug, Clone)]
pub struct WorkflowStateStore {
    controller_path: PathBuf,
    tracking_path: PathBuf,
}

impl WorkflowStateStore {
    /// A store over `paths`' workflow directory.
    #[must_use]
    pub fn new(paths: &WorkflowPaths) -> Self {
        Self {
            controller_path: paths.controller_state(),
            tracking_path: paths.tracking(),
        }
    }

    /// Persists the controller snapshot.
    pub async fn save_controller(&self, state: &ControllerState) -> Result<()> {
        write_atomic(&self.controller_path, &serde_json::to_string_pretty(state)?).await
    }

    /// Loads the controller snapshot, if a readable one exists.
    pub async fn load_controller(&self) -> Option<ControllerState> {
        load_lenient(&self.controller_path).await
    }

    /// Persists the tracking entries.
    pub async fn save_tracking(&self, steps: &[StepTrack]) -> Result<()> {
        write_atomic(&self.tracking_path, &serde_json::to_string_pretty(steps)?).await
    }

    /// Loads the tracking entries, if a readable file exists.
    pub async fn load_tracking(&self) -> Option<Vec<StepTrack>> {
        load_lenient(&self.tracking_path).await
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_lenient<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable state file");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> WorkflowStateStore {
        WorkflowStateStore::new(&WorkflowPaths::new(dir))
    }

    #[tokio::test]
    async fn controller_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let state = ControllerState {
            workflow_id: "wf-1".into(),
            state: "running".into(),
            step_index: 3,
            iteration: 1,
            updated_at: Utc::now(),
        };
        store.save_controller(&state).await.unwrap();

        let loaded = store.load_controller().await.unwrap();
        assert_eq!(loaded.workflow_id, "wf-1");
        assert_eq!(loaded.step_index, 3);
    }

    #[tokio::test]
    async fn tracking_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let steps = vec![
            StepTrack {
                index: 0,
                status: "completed".into(),
                agent_ids: vec![1],
            },
            StepTrack {
                index: 1,
                status: "running".into(),
                agent_ids: vec![2, 3],
            },
        ];
        store.save_tracking(&steps).await.unwrap();
        assert_eq!(store.load_tracking().await.unwrap(), steps);
    }

    #[tokio::test]
    async fn missing_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.load_controller().await.is_none());
        assert!(store.load_tracking().await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let path = WorkflowPaths::new(dir.path()).controller_state();
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, "{ torn").await.unwrap();

        assert!(store.load_controller().await.is_none());
    }

    #[tokio::test]
    async fn save_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store
            .save_tracking(&[StepTrack {
                index: 0,
                status: "running".into(),
                agent_ids: vec![],
            }])
            .await
            .unwrap();
        store.save_tracking(&[]).await.unwrap();

        assert!(store.load_tracking().await.unwrap().is_empty());
    }
}
