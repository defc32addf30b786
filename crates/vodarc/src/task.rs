use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{DownloadTask, Status};

/// Durable point read/write store for task records, keyed by task id.
pub trait TaskStore: Send + Sync + 'static {
    fn get(&self, id: u64) -> impl Future<Output = Result<Option<DownloadTask>>> + Send;
    fn put(&self, task: &DownloadTask) -> impl Future<Output = Result<()>> + Send;
    fn delete(&self, id: u64) -> impl Future<Output = Result<()>> + Send;
}

/// One JSON file per task under a directory. Writes go through a temp file and
/// rename so a kill mid-write never leaves a torn record behind.
#[derive(Debug, Clone)]
pub struct JsonTaskStore {
    dir: PathBuf,
}

impl JsonTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub async fn list_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

impl TaskStore for JsonTaskStore {
    async fn get(&self, id: u64) -> Result<Option<DownloadTask>> {
        match tokio::fs::read(self.record_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, task: &DownloadTask) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(task.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(task)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Single-writer handle over one task record. Fetch units run in parallel but
/// every progress mutation is an atomic read-modify-persist step under the
/// lock, so a kill loses at most one in-flight unit.
pub struct TaskRecord<S: TaskStore> {
    store: Arc<S>,
    task: Mutex<DownloadTask>,
}

impl<S: TaskStore> TaskRecord<S> {
    pub async fn load(store: Arc<S>, id: u64) -> Result<Self> {
        let task = store.get(id).await?.ok_or(Error::TaskNotFound(id))?;
        Ok(Self {
            store,
            task: Mutex::new(task),
        })
    }

    pub fn new(store: Arc<S>, task: DownloadTask) -> Self {
        Self {
            store,
            task: Mutex::new(task),
        }
    }

    pub async fn snapshot(&self) -> DownloadTask {
        self.task.lock().await.clone()
    }

    /// Mutate and persist as one step.
    pub async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut DownloadTask),
    {
        let mut task = self.task.lock().await;
        mutate(&mut task);
        self.store.put(&task).await
    }

    pub async fn set_status(&self, status: Status) -> Result<()> {
        self.update(|t| t.status = status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DownloadTaskBuilder;

    fn sample_task(id: u64) -> DownloadTask {
        DownloadTaskBuilder::default()
            .id(id)
            .source_url("https://example.com/vod/index.m3u8")
            .download_path("/tmp/downloads")
            .max_progress(10u32)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn round_trips_records() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonTaskStore::new(dir.path());
        assert!(store.get(7).await?.is_none());

        store.put(&sample_task(7)).await?;
        let loaded = store.get(7).await?.unwrap();
        assert_eq!(loaded.id, 7);
        assert_eq!(loaded.max_progress, 10);

        store.delete(7).await?;
        assert!(store.get(7).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn update_persists_atomically() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonTaskStore::new(dir.path()));
        store.put(&sample_task(1)).await?;

        let record = TaskRecord::load(store.clone(), 1).await?;
        record
            .update(|t| {
                t.progress += 1;
                t.bytes_written += 512;
            })
            .await?;

        let reloaded = store.get(1).await?.unwrap();
        assert_eq!(reloaded.progress, 1);
        assert_eq!(reloaded.bytes_written, 512);
        Ok(())
    }

    #[tokio::test]
    async fn lists_ids_in_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonTaskStore::new(dir.path());
        for id in [3u64, 1, 2] {
            store.put(&sample_task(id)).await?;
        }
        assert_eq!(store.list_ids().await?, vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_record_is_task_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonTaskStore::new(dir.path()));
        match TaskRecord::load(store, 42).await {
            Ok(_) => panic!("expected a missing record"),
            Err(err) => assert!(matches!(err, Error::TaskNotFound(42))),
        }
        Ok(())
    }
}
