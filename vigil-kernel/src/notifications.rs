/**
 * NOTIFICATION STORE - Failure notifications and their recovery status
 *
 * ROLE:
 * Holds every notification the kernel has accepted, with the status of its
 * recovery, and snapshots them to a JSON file so they survive a restart.
 *
 * RULES:
 * - Status changes go through `transition`, a compare-and-set on the current
 *   status; two callers racing on the same notification cannot both win
 * - Only the edges allowed by `NotificationStatus::can_transition_to` are taken
 * - A failed snapshot write is logged, never propagated to the recovery path
 */

use crate::engine::TaskOutcome;
use crate::models::{Notification, NotificationStatus};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

pub const INTERRUPTED_REASON: &str = "recovery interrupted by kernel restart";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("notification {0} could not be found")]
    NotFound(Uuid),
    #[error("notification {0} already exists")]
    AlreadyExists(Uuid),
    #[error("notification {uuid} is {actual}, expected {expected:?}")]
    Conflict { uuid: Uuid, actual: NotificationStatus, expected: Vec<NotificationStatus> },
    #[error("notification status cannot go from {from} to {to}")]
    InvalidTransition { from: NotificationStatus, to: NotificationStatus },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unreadable notification snapshot, moved aside to {}", .moved_to.display())]
    Corrupt {
        moved_to: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub struct NotificationStore {
    entries: RwLock<HashMap<Uuid, Notification>>,
    data_file: Option<PathBuf>,
    /// Serializes snapshot writes so the last write holds the latest state
    save_lock: Mutex<()>,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl NotificationStore {
    pub fn in_memory() -> Self {
        Self { entries: RwLock::new(HashMap::new()), data_file: None, save_lock: Mutex::new(()) }
    }

    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            data_file: Some(path.into()),
            save_lock: Mutex::new(()),
        }
    }

    pub fn data_file(&self) -> Option<&Path> {
        self.data_file.as_deref()
    }

    /// Replaces the in-memory set with the snapshot on disk, if any. A snapshot
    /// that does not parse is renamed to `<file>.corrupt` and the set is left empty.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let Some(path) = &self.data_file else { return Ok(0) };
        if !path.exists() {
            info!("no notification snapshot at {}, starting fresh", path.display());
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(path).await?;
        let list: Vec<Notification> = match serde_json::from_str(&content) {
            Ok(list) => list,
            Err(source) => {
                // keep the bad file for inspection; the next save would overwrite it
                let moved_to = corrupt_path(path);
                tokio::fs::rename(path, &moved_to).await?;
                warn!("notification snapshot {} is unreadable ({source}), moved to {}", path.display(), moved_to.display());
                return Err(StoreError::Corrupt { moved_to, source });
            }
        };
        let count = list.len();
        *self.entries.write().await = list.into_iter().map(|n| (n.uuid, n)).collect();

        info!("loaded {count} notifications from {}", path.display());
        Ok(count)
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.data_file else { return Ok(()) };
        let _guard = self.save_lock.lock().await;
        let content = {
            let entries = self.entries.read().await;
            serde_json::to_string_pretty(&sorted(entries.values().cloned().collect()))?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn persist(&self) {
        if let Err(e) = self.save().await {
            warn!("failed to save notification snapshot: {e}");
        }
    }

    pub async fn insert(&self, notification: Notification) -> Result<Notification, StoreError> {
        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&notification.uuid) {
                return Err(StoreError::AlreadyExists(notification.uuid));
            }
            entries.insert(notification.uuid, notification.clone());
        }
        self.persist().await;
        Ok(notification)
    }

    pub async fn get(&self, uuid: Uuid) -> Result<Notification, StoreError> {
        self.entries.read().await.get(&uuid).cloned().ok_or(StoreError::NotFound(uuid))
    }

    /// Oldest first
    pub async fn list(&self, status: Option<NotificationStatus>) -> Vec<Notification> {
        let entries = self.entries.read().await;
        sorted(
            entries
                .values()
                .filter(|n| status.map_or(true, |s| s == n.status))
                .cloned()
                .collect(),
        )
    }

    /// Moves the notification to `to` if its current status is one of `expected`
    pub async fn transition(
        &self,
        uuid: Uuid,
        expected: &[NotificationStatus],
        to: NotificationStatus,
        reason: Option<String>,
    ) -> Result<Notification, StoreError> {
        self.update(uuid, expected, to, |n| {
            n.reason = reason;
            if to == NotificationStatus::Running {
                n.task_outcomes.clear();
            }
        })
        .await
    }

    /// Records the end of a recovery run: `running` to a terminal status, with the
    /// per-task outcomes of the run
    pub async fn complete(
        &self,
        uuid: Uuid,
        to: NotificationStatus,
        reason: Option<String>,
        outcomes: BTreeMap<String, TaskOutcome>,
    ) -> Result<Notification, StoreError> {
        self.update(uuid, &[NotificationStatus::Running], to, |n| {
            n.reason = reason;
            n.task_outcomes = outcomes;
        })
        .await
    }

    async fn update(
        &self,
        uuid: Uuid,
        expected: &[NotificationStatus],
        to: NotificationStatus,
        apply: impl FnOnce(&mut Notification),
    ) -> Result<Notification, StoreError> {
        let updated = {
            let mut entries = self.entries.write().await;
            let notification = entries.get_mut(&uuid).ok_or(StoreError::NotFound(uuid))?;
            if !expected.contains(&notification.status) {
                return Err(StoreError::Conflict {
                    uuid,
                    actual: notification.status,
                    expected: expected.to_vec(),
                });
            }
            if !notification.status.can_transition_to(to) {
                return Err(StoreError::InvalidTransition { from: notification.status, to });
            }
            notification.status = to;
            notification.updated_at = OffsetDateTime::now_utc();
            apply(notification);
            notification.clone()
        };
        self.persist().await;
        Ok(updated)
    }

    /// Notifications left `running` by a previous process can never finish; mark them `error`
    pub async fn fail_interrupted(&self) -> Vec<Uuid> {
        let running: Vec<Uuid> = self
            .list(Some(NotificationStatus::Running))
            .await
            .into_iter()
            .map(|n| n.uuid)
            .collect();

        let mut failed = Vec::with_capacity(running.len());
        for uuid in running {
            let result = self
                .transition(
                    uuid,
                    &[NotificationStatus::Running],
                    NotificationStatus::Error,
                    Some(INTERRUPTED_REASON.to_string()),
                )
                .await;
            if result.is_ok() {
                failed.push(uuid);
            }
        }
        failed
    }

    pub async fn counts_by_status(&self) -> BTreeMap<String, usize> {
        let entries = self.entries.read().await;
        let mut counts: BTreeMap<String, usize> =
            NotificationStatus::ALL.iter().map(|s| (s.to_string(), 0)).collect();
        for notification in entries.values() {
            *counts.entry(notification.status.to_string()).or_default() += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut moved = path.as_os_str().to_os_string();
    moved.push(".corrupt");
    PathBuf::from(moved)
}

fn sorted(mut list: Vec<Notification>) -> Vec<Notification> {
    list.sort_by(|a, b| a.generated_time.cmp(&b.generated_time).then(a.uuid.cmp(&b.uuid)));
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationType;
    use NotificationStatus::*;

    fn notification(host: &str) -> Notification {
        Notification::new(host, NotificationType::ComputeHost, serde_json::json!({"event": "STOPPED"}))
    }

    #[tokio::test]
    async fn test_insert_get_and_duplicates() {
        let store = NotificationStore::in_memory();
        let n = store.insert(notification("compute-1")).await.unwrap();

        assert_eq!(store.get(n.uuid).await.unwrap().status, New);
        assert!(matches!(store.insert(n.clone()).await, Err(StoreError::AlreadyExists(u)) if u == n.uuid));
        assert!(matches!(store.get(Uuid::new_v4()).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = NotificationStore::in_memory();
        let n = store.insert(notification("compute-1")).await.unwrap();

        store.transition(n.uuid, &[New], Running, None).await.unwrap();
        let err = store.transition(n.uuid, &[New], Running, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: Running, .. }));

        let err = store.transition(n.uuid, &[Running], New, None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { from: Running, to: New }));
    }

    #[tokio::test]
    async fn test_complete_records_outcomes() {
        let store = NotificationStore::in_memory();
        let n = store.insert(notification("compute-1")).await.unwrap();
        store.transition(n.uuid, &[New], Running, None).await.unwrap();

        let outcomes = BTreeMap::from([
            ("a".to_string(), TaskOutcome::Ok),
            ("b".to_string(), TaskOutcome::Error { cause: "boom".into() }),
        ]);
        let done = store.complete(n.uuid, Failed, Some("b: boom".into()), outcomes).await.unwrap();

        assert_eq!(done.status, Failed);
        assert_eq!(done.task_outcomes.len(), 2);
        assert_eq!(done.reason.as_deref(), Some("b: boom"));

        // retry clears the previous run
        let retried = store.transition(n.uuid, &[Failed, Error], Running, None).await.unwrap();
        assert!(retried.task_outcomes.is_empty());
        assert!(retried.reason.is_none());
    }

    #[tokio::test]
    async fn test_list_and_counts() {
        let store = NotificationStore::in_memory();
        let a = store.insert(notification("a")).await.unwrap();
        store.insert(notification("b")).await.unwrap();
        store.transition(a.uuid, &[New], Ignored, Some("maintenance".into())).await.unwrap();

        assert_eq!(store.list(None).await.len(), 2);
        assert_eq!(store.list(Some(Ignored)).await.len(), 1);
        let counts = store.counts_by_status().await;
        assert_eq!(counts["new"], 1);
        assert_eq!(counts["ignored"], 1);
        assert_eq!(counts["running"], 0);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_and_interrupted_runs() {
        let path = std::env::temp_dir().join(format!("vigil-notifications-{}/notifications.json", Uuid::new_v4()));
        let store = NotificationStore::with_file(&path);
        let n = store.insert(notification("compute-1")).await.unwrap();
        store.transition(n.uuid, &[New], Running, None).await.unwrap();

        let restarted = NotificationStore::with_file(&path);
        assert_eq!(restarted.load().await.unwrap(), 1);
        assert_eq!(restarted.fail_interrupted().await, vec![n.uuid]);

        let recovered = restarted.get(n.uuid).await.unwrap();
        assert_eq!(recovered.status, Error);
        assert_eq!(recovered.reason.as_deref(), Some(INTERRUPTED_REASON));

        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_is_moved_aside() {
        let dir = std::env::temp_dir().join(format!("vigil-notifications-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("notifications.json");
        std::fs::write(&path, "[{\"uuid\": truncated").unwrap();

        let store = NotificationStore::with_file(&path);
        let err = store.load().await.unwrap_err();
        let moved_to = match err {
            StoreError::Corrupt { moved_to, .. } => moved_to,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(moved_to, dir.join("notifications.json.corrupt"));
        assert!(!path.exists());
        assert_eq!(std::fs::read_to_string(&moved_to).unwrap(), "[{\"uuid\": truncated");
        assert!(store.is_empty().await);

        // the next save starts a fresh snapshot and leaves the bad one alone
        store.insert(notification("compute-1")).await.unwrap();
        assert_eq!(NotificationStore::with_file(&path).load().await.unwrap(), 1);
        assert!(moved_to.exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
