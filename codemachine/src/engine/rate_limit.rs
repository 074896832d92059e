//! Persistent, time-indexed engine availability.
//!
//! One [`RateLimitManager`] exists per workflow root. Entries record that
//! an engine is unavailable until an instant; an entry is *active* while
//! `now < resets_at`. Expired entries are lazily dropped on read and
//! eagerly dropped by [`RateLimitManager::cleanup`].
//!
//! State is persisted to `rate-limits.json` as
//! `{ "entries": [{ "engineId", "resetsAt", "reason"? }] }` and reloaded
//! on [`RateLimitManager::initialize`], so a rate limit observed before a
//! crash still holds after restart. Every mutation rewrites the whole
//! file atomically (write-temp, rename); writers within the process are
//! serialised by the manager's mutex.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// Retry hint applied when the back-end reports a rate limit without one.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// One persisted rate-limit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEntry {
    /// The limited engine.
    pub engine_id: String,
    /// Instant the engine becomes available again.
    pub resets_at: DateTime<Utc>,
    /// Back-end supplied reason, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RateLimitEntry {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.resets_at
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    entries: Vec<RateLimitEntry>,
}

/// Availability map for every engine under one workflow root.
#[derive(Debug)]
pub struct RateLimitManager {
    path: PathBuf,
    inner: Mutex<Vec<RateLimitEntry>>,
}

impl RateLimitManager {
    /// Loads persisted state from `path` (the `rate-limits.json` file),
    /// dropping entries that expired while the process was down.
    ///
    /// A missing file is an empty state; an unreadable one is logged and
    /// treated as empty rather than blocking startup.
    pub async fn initialize(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<PersistedState>(&raw) {
                Ok(state) => {
                    let now = Utc::now();
                    state
                        .entries
                        .into_iter()
                        .filter(|e| e.is_active(now))
                        .collect()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable rate-limit state, starting fresh");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        Ok(Self {
            path,
            inner: Mutex::new(entries),
        })
    }

    /// Records that `engine_id` is limited until `resets_at`, or
    /// `now + retry_after_secs` (default 60 s) when no instant was given.
    /// Upserts and persists; returns the effective reset instant.
    pub async fn mark_rate_limited(
        &self,
        engine_id: &str,
        resets_at: Option<DateTime<Utc>>,
        retry_after_secs: Option<u64>,
    ) -> Result<DateTime<Utc>> {
        let resets_at = resets_at.unwrap_or_else(|| {
            Utc::now()
                + Duration::seconds(retry_after_secs.unwrap_or(DEFAULT_RETRY_AFTER_SECS) as i64)
        });

        let mut entries = self.inner.lock().await;
        entries.retain(|e| e.engine_id != engine_id);
        entries.push(RateLimitEntry {
            engine_id: engine_id.to_string(),
            resets_at,
            reason: None,
        });
        debug!(engine = engine_id, resets_at = %resets_at, "engine rate limited");
        self.persist(&entries).await?;
        Ok(resets_at)
    }

    /// Whether `engine_id` has no active entry.
    pub async fn is_engine_available(&self, engine_id: &str) -> bool {
        let now = Utc::now();
        let mut entries = self.inner.lock().await;
        entries.retain(|e| e.is_active(now));
        !entries.iter().any(|e| e.engine_id == engine_id)
    }

    /// Seconds until `engine_id` becomes available: `max(0, ⌈resets_at − now⌉)`.
    pub async fn time_until_available(&self, engine_id: &str) -> u64 {
        let now = Utc::now();
        let entries = self.inner.lock().await;
        entries
            .iter()
            .find(|e| e.engine_id == engine_id && e.is_active(now))
            .map_or(0, |e| {
                let ms = e.resets_at.signed_duration_since(now).num_milliseconds();
                if ms <= 0 { 0 } else { (ms as u64).div_ceil(1000) }
            })
    }

    /// Removes the entry for `engine_id` and persists.
    pub async fn clear_rate_limit(&self, engine_id: &str) -> Result<()> {
        let mut entries = self.inner.lock().await;
        entries.retain(|e| e.engine_id != engine_id);
        self.persist(&entries).await
    }

    /// Engines with an active entry.
    pub async fn rate_limited_engines(&self) -> Vec<String> {
        let now = Utc::now();
        let mut entries = self.inner.lock().await;
        entries.retain(|e| e.is_active(now));
        entries.iter().map(|e| e.engine_id.clone()).collect()
    }

    /// Eagerly drops every expired entry and persists.
    pub async fn cleanup(&self) -> Result<()> {
        let now = Utc::now();
        let mut entries = self.inner.lock().await;
        entries.retain(|e| e.is_active(now));
        self.persist(&entries).await
    }

    /// Full-file atomic rewrite: write a sibling temp file, then rename
    /// over the target.
    async fn persist(&self, entries: &[RateLimitEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let state = PersistedState {
            entries: entries.to_vec(),
        };
        let json = serde_json::to_string_pretty(&state)?;
        let tmp = temp_sibling(&self.path);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}
