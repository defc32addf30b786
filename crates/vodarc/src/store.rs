use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};

use crate::error::Result;

/// Append / truncate / list / delete over a directory tree. The job's single
/// touchpoint with the filesystem besides the task record store.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub async fn ensure_dir(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = self.resolve(rel);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn open_append(&self, path: impl AsRef<Path>) -> Result<File> {
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(file)
    }

    /// Truncate to an exact length, creating the file if missing.
    pub async fn truncate_to(&self, path: impl AsRef<Path>, len: u64) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path.as_ref())
            .await?;
        file.set_len(len).await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn file_len(&self, path: impl AsRef<Path>) -> Result<Option<u64>> {
        match tokio::fs::metadata(path.as_ref()).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of regular files directly under `dir`.
    pub async fn list_files(&self, dir: impl AsRef<Path>) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir.as_ref()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    pub async fn delete_file(&self, path: impl AsRef<Path>) -> Result<()> {
        match tokio::fs::remove_file(path.as_ref()).await {
            Ok(()) => {
                log::debug!("removed file {:?}", path.as_ref());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_dir(&self, path: impl AsRef<Path>) -> Result<()> {
        match tokio::fs::remove_dir_all(path.as_ref()).await {
            Ok(()) => {
                log::info!("removed directory {:?}", path.as_ref());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
