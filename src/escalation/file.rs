//! File-backed escalation queue.
//!
//! Layout: one pretty-printed `esc_<id>.json` per item inside the queue
//! directory, readable by any external review tool. Every write goes to a
//! temporary file that is fsynced and then renamed over the target, so a
//! reader never observes a partially written item.

use super::{EscalationItem, EscalationQueue, EscalationStatus, QueueError};
use crate::types::EscalationId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const FILE_PREFIX: &str = "esc_";
const FILE_SUFFIX: &str = ".json";

pub struct FileEscalationQueue {
    dir: PathBuf,
    // Held across every check-then-write so an append can never land on top
    // of a transition of the same item
    write_lock: Mutex<()>,
}

impl FileEscalationQueue {
    /// Open (and create if needed) a queue rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, QueueError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        info!("Escalation queue opened at {:?}", dir);
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: EscalationId) -> PathBuf {
        self.dir.join(format!("{}{}{}", FILE_PREFIX, id, FILE_SUFFIX))
    }

    async fn write_atomic(&self, item: &EscalationItem) -> Result<(), QueueError> {
        let target = self.path_for(item.id);
        let tmp = self
            .dir
            .join(format!(".{}{}.{}.tmp", FILE_PREFIX, item.id, Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(item)?;

        let written: std::io::Result<()> = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &target).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        // Persist the rename itself; not every platform can open a directory
        if let Ok(dir) = tokio::fs::File::open(&self.dir).await {
            let _ = dir.sync_all().await;
        }

        Ok(())
    }

    async fn read_item(&self, path: &Path) -> Result<EscalationItem, QueueError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn is_item_file(name: &str) -> bool {
    name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX)
}

#[async_trait]
impl EscalationQueue for FileEscalationQueue {
    async fn append(&self, item: EscalationItem) -> Result<EscalationId, QueueError> {
        let _guard = self.write_lock.lock().await;

        let path = self.path_for(item.id);
        if tokio::fs::try_exists(&path).await? {
            debug!(escalation_id = %item.id, "Escalation already stored, append is a no-op");
            return Ok(item.id);
        }

        self.write_atomic(&item).await?;
        info!(
            escalation_id = %item.id,
            request_id = %item.request_id,
            overall = item.confidence_profile.overall,
            "Escalation appended"
        );
        Ok(item.id)
    }

    async fn list(
        &self,
        status: Option<EscalationStatus>,
    ) -> Result<Vec<EscalationItem>, QueueError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut items = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_item_file(name) {
                continue;
            }

            match self.read_item(&entry.path()).await {
                Ok(item) => {
                    if status.is_none_or(|s| s == item.status) {
                        items.push(item);
                    }
                }
                Err(e) => warn!("Skipping unreadable escalation file {}: {}", name, e),
            }
        }

        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn get(&self, id: EscalationId) -> Result<EscalationItem, QueueError> {
        let path = self.path_for(id);
        if !tokio::fs::try_exists(&path).await? {
            return Err(QueueError::NotFound(id));
        }
        self.read_item(&path).await
    }

    async fn transition(
        &self,
        id: EscalationId,
        next: EscalationStatus,
        note: Option<String>,
    ) -> Result<EscalationItem, QueueError> {
        let _guard = self.write_lock.lock().await;

        let mut item = self.get(id).await?;
        let from = item.status;
        item.apply_transition(next, note)?;
        self.write_atomic(&item).await?;

        info!(escalation_id = %id, from = %from, to = %next, "Escalation status changed");
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::test_support::sample_item;

    #[tokio::test]
    async fn test_append_writes_one_file_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileEscalationQueue::open(dir.path()).await.unwrap();

        let item = sample_item();
        let id = queue.append(item.clone()).await.unwrap();
        assert_eq!(id, item.id);

        let path = dir.path().join(format!("esc_{}.json", id));
        assert!(path.exists());

        let stored: EscalationItem =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(stored, item);
    }

    #[tokio::test]
    async fn test_append_same_id_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileEscalationQueue::open(dir.path()).await.unwrap();

        let item = sample_item();
        queue.append(item.clone()).await.unwrap();
        queue
            .transition(item.id, EscalationStatus::InReview, None)
            .await
            .unwrap();

        // A replayed append must not reset the reviewed item
        queue.append(item.clone()).await.unwrap();
        let stored = queue.get(item.id).await.unwrap();
        assert_eq!(stored.status, EscalationStatus::InReview);
        assert_eq!(queue.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replayed_appends_racing_a_transition_never_regress() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(FileEscalationQueue::open(dir.path()).await.unwrap());
        let item = sample_item();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let queue = std::sync::Arc::clone(&queue);
            let item = item.clone();
            tasks.push(tokio::spawn(async move { queue.append(item).await }));
        }
        // Claim the item as soon as the first append lands
        loop {
            match queue
                .transition(item.id, EscalationStatus::InReview, None)
                .await
            {
                Ok(_) => break,
                Err(QueueError::NotFound(_)) => tokio::task::yield_now().await,
                Err(e) => panic!("unexpected transition error: {e}"),
            }
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = queue.get(item.id).await.unwrap();
        assert_eq!(stored.status, EscalationStatus::InReview);
    }

    #[tokio::test]
    async fn test_unreadable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileEscalationQueue::open(dir.path()).await.unwrap();
        queue.append(sample_item()).await.unwrap();

        std::fs::write(dir.path().join("esc_garbage.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(queue.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileEscalationQueue::open(dir.path()).await.unwrap();
        let missing = EscalationId::new();
        assert!(matches!(
            queue.get(missing).await,
            Err(QueueError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileEscalationQueue::open(dir.path()).await.unwrap();
        let item = sample_item();
        queue.append(item.clone()).await.unwrap();
        queue
            .transition(item.id, EscalationStatus::InReview, Some("triage".into()))
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("esc_{}.json", item.id)]);
    }
}
