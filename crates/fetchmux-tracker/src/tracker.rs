//! Durable two-level checkpoint map: group -> object -> `TrackedState`.
//!
//! All access goes through one async mutex, including the flush path, so
//! concurrent fetch loops never race on the temp-file/rename sequence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::TrackerError;

/// Forward-progress checkpoint for one configured source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedState {
    /// Wall-clock time of the last mutation.
    #[serde(rename = "Updated")]
    pub updated: DateTime<Utc>,
    /// Watermark: lower bound for the next poll.
    #[serde(rename = "LatestTime")]
    pub latest_time: DateTime<Utc>,
    /// Opaque vendor cursor. Empty when not paginating.
    #[serde(rename = "Key", default)]
    pub key: String,
}

impl TrackedState {
    /// Fresh state seeded at `start` with no cursor.
    pub fn seeded(start: DateTime<Utc>) -> Self {
        Self {
            updated: Utc::now(),
            latest_time: start,
            key: String::new(),
        }
    }
}

/// On-disk and in-memory shape of the checkpoint file.
pub type StateMap = BTreeMap<String, BTreeMap<String, TrackedState>>;

#[derive(Debug, Default)]
struct Inner {
    states: StateMap,
    dirty: bool,
}

/// Checkpoint store shared by every fetch loop in the process.
#[derive(Debug)]
pub struct ObjectTracker {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ObjectTracker {
    /// Load checkpoint state from `path`.
    ///
    /// A missing file yields an empty tracker. Malformed content fails with
    /// `CorruptState`; an empty file is treated as malformed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let path = path.into();
        let states = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StateMap>(&bytes).map_err(|source| {
                TrackerError::CorruptState {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no checkpoint file, starting empty");
                StateMap::new()
            }
            Err(e) => return Err(TrackerError::Io(e)),
        };

        let objects: usize = states.values().map(BTreeMap::len).sum();
        tracing::debug!(path = %path.display(), groups = states.len(), objects, "checkpoint state loaded");

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                states,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the checkpoint for `(group, key)`. `None` means never seen.
    pub async fn get(&self, group: &str, key: &str) -> Option<TrackedState> {
        let inner = self.inner.lock().await;
        inner.states.get(group).and_then(|g| g.get(key)).cloned()
    }

    /// Insert or overwrite the checkpoint for `(group, key)`.
    ///
    /// Rejects a watermark that moves backwards. With `force_flush` the
    /// whole map is persisted before returning.
    pub async fn set(
        &self,
        group: &str,
        key: &str,
        state: TrackedState,
        force_flush: bool,
    ) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock().await;
        if let Some(current) = inner.states.get(group).and_then(|g| g.get(key)) {
            if state.latest_time < current.latest_time {
                return Err(TrackerError::NonMonotonic {
                    group: group.to_owned(),
                    key: key.to_owned(),
                    current: current.latest_time,
                    attempted: state.latest_time,
                });
            }
        }
        inner
            .states
            .entry(group.to_owned())
            .or_default()
            .insert(key.to_owned(), state);
        inner.dirty = true;

        if force_flush {
            self.flush_locked(&mut inner).await?;
        }
        Ok(())
    }

    /// Persist the map if anything changed since the last successful flush.
    pub async fn flush(&self) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock().await;
        self.flush_locked(&mut inner).await
    }

    pub async fn is_dirty(&self) -> bool {
        self.inner.lock().await.dirty
    }

    /// Copy of the full checkpoint map.
    pub async fn snapshot(&self) -> StateMap {
        self.inner.lock().await.states.clone()
    }

    async fn flush_locked(&self, inner: &mut Inner) -> Result<(), TrackerError> {
        if !inner.dirty {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&inner.states).map_err(TrackerError::Serialize)?;
        write_atomic(&self.path, &bytes).await?;
        inner.dirty = false;
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "checkpoint flushed");
        Ok(())
    }
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TrackerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(TrackerError::Io(e));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, 0).unwrap()
    }

    fn state_at(latest: DateTime<Utc>, key: &str) -> TrackedState {
        TrackedState {
            updated: latest,
            latest_time: latest,
            key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ObjectTracker::open(dir.path().join("state.json")).await.unwrap();
        assert!(tracker.get("okta", "okta1").await.is_none());
        assert!(!tracker.is_dirty().await);
        assert!(tracker.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{\"okta\": [not json").unwrap();
        let err = ObjectTracker::open(&path).await.unwrap_err();
        assert!(matches!(err, TrackerError::CorruptState { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn empty_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            ObjectTracker::open(&path).await,
            Err(TrackerError::CorruptState { .. })
        ));
    }

    #[tokio::test]
    async fn set_with_force_flush_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let tracker = ObjectTracker::open(&path).await.unwrap();
        tracker
            .set("okta", "okta1", state_at(ts(0, 5), "cursor-a"), true)
            .await
            .unwrap();
        assert!(!tracker.is_dirty().await);
        drop(tracker);

        let reopened = ObjectTracker::open(&path).await.unwrap();
        let got = reopened.get("okta", "okta1").await.expect("entry persisted");
        assert_eq!(got.latest_time, ts(0, 5));
        assert_eq!(got.key, "cursor-a");
    }

    #[tokio::test]
    async fn unflushed_set_is_lost_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let tracker = ObjectTracker::open(&path).await.unwrap();
        tracker
            .set("duo", "duo1", state_at(ts(1, 0), ""), true)
            .await
            .unwrap();
        tracker
            .set("duo", "duo1", state_at(ts(2, 0), ""), false)
            .await
            .unwrap();
        assert!(tracker.is_dirty().await);
        drop(tracker);

        let reopened = ObjectTracker::open(&path).await.unwrap();
        let got = reopened.get("duo", "duo1").await.unwrap();
        assert_eq!(got.latest_time, ts(1, 0), "last flushed state wins");
    }

    #[tokio::test]
    async fn flush_without_changes_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let tracker = ObjectTracker::open(&path).await.unwrap();
        tracker.flush().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn watermark_regression_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ObjectTracker::open(dir.path().join("state.json")).await.unwrap();
        tracker
            .set("okta", "okta1", state_at(ts(3, 0), ""), false)
            .await
            .unwrap();

        let err = tracker
            .set("okta", "okta1", state_at(ts(2, 0), ""), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NonMonotonic { .. }));
        assert_eq!(tracker.get("okta", "okta1").await.unwrap().latest_time, ts(3, 0));

        // Equal watermark with a new cursor is a valid transition.
        tracker
            .set("okta", "okta1", state_at(ts(3, 0), "next"), false)
            .await
            .unwrap();
        assert_eq!(tracker.get("okta", "okta1").await.unwrap().key, "next");
    }

    #[tokio::test]
    async fn persisted_watermark_is_non_decreasing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let tracker = ObjectTracker::open(&path).await.unwrap();

        let attempts = [ts(1, 0), ts(1, 30), ts(1, 10), ts(2, 0), ts(0, 0), ts(2, 0)];
        let mut last_persisted = None;
        for attempt in attempts {
            let _ = tracker.set("g", "o", state_at(attempt, ""), true).await;
            let reopened = ObjectTracker::open(&path).await.unwrap();
            let persisted = reopened.get("g", "o").await.unwrap().latest_time;
            if let Some(prev) = last_persisted {
                assert!(persisted >= prev, "{persisted} regressed below {prev}");
            }
            last_persisted = Some(persisted);
        }
        assert_eq!(last_persisted, Some(ts(2, 0)));
    }

    #[tokio::test]
    async fn flush_leaves_no_temp_file_and_writes_expected_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let tracker = ObjectTracker::open(&path).await.unwrap();
        tracker
            .set("okta", "okta1", state_at(ts(0, 5), ""), false)
            .await
            .unwrap();
        tracker.flush().await.unwrap();

        assert!(!temp_path(&path).exists());
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let entry = &raw["okta"]["okta1"];
        assert_eq!(entry["LatestTime"], "2025-01-01T00:05:00Z");
        assert_eq!(entry["Key"], "");
        assert!(entry["Updated"].is_string());
    }

    #[tokio::test]
    async fn stale_temp_file_does_not_affect_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let tracker = ObjectTracker::open(&path).await.unwrap();
        tracker
            .set("asana", "a1", state_at(ts(4, 0), ""), true)
            .await
            .unwrap();

        // A crash mid-write leaves a partial temp file next to the real one.
        std::fs::write(temp_path(&path), b"{\"asana\": {\"a1\": {\"Upd").unwrap();

        let reopened = ObjectTracker::open(&path).await.unwrap();
        assert_eq!(reopened.get("asana", "a1").await.unwrap().latest_time, ts(4, 0));
    }

    #[tokio::test]
    async fn groups_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ObjectTracker::open(dir.path().join("s.json")).await.unwrap();
        tracker.set("okta", "x", state_at(ts(5, 0), ""), false).await.unwrap();
        tracker.set("duo", "x", state_at(ts(1, 0), ""), false).await.unwrap();

        let snap = tracker.snapshot().await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["okta"]["x"].latest_time, ts(5, 0));
        assert_eq!(snap["duo"]["x"].latest_time, ts(1, 0));
    }
}
