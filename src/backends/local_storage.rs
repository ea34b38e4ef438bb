//! Filesystem storage backend.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::tasks::{ByteStream, StorageBackend, TaskError, TaskErrorKind};

/// Stores files under a base directory.
///
/// Data is written to `<destination>.part` and renamed into place once the
/// stream is exhausted, so a visible destination file is always complete.
pub struct LocalStorage {
    base_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Map a destination onto the base directory, refusing anything that
    /// would land outside of it.
    fn resolve(&self, destination: &str) -> Result<PathBuf, TaskError> {
        let relative = Path::new(destination);
        let mut has_file_name = false;
        for component in relative.components() {
            match component {
                Component::Normal(_) => has_file_name = true,
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(TaskError::new(
                        TaskErrorKind::InvalidPayload,
                        format!("destination escapes storage base: {}", destination),
                    ));
                }
            }
        }
        if !has_file_name {
            return Err(TaskError::new(
                TaskErrorKind::InvalidPayload,
                format!("empty destination: '{}'", destination),
            ));
        }
        Ok(self.base_dir.join(relative))
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn write_stream(file: &mut File, mut stream: ByteStream) -> Result<u64, TaskError> {
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn put(&self, stream: ByteStream, destination: &str) -> Result<u64, TaskError> {
        let target = self.resolve(destination)?;
        let part = part_path(&target);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(&part).await?;
        let written = match write_stream(&mut file, stream).await {
            Ok(written) => written,
            Err(e) => {
                drop(file);
                if !e.is_cancelled() {
                    if let Err(remove_err) = remove_if_exists(&part).await {
                        warn!("Failed to remove partial file {:?}: {}", part, remove_err);
                    }
                }
                return Err(e);
            }
        };
        drop(file);

        tokio::fs::rename(&part, &target).await?;
        debug!("Stored {} bytes at {:?}", written, target);
        Ok(written)
    }

    fn supports_rollback(&self) -> bool {
        true
    }

    async fn rollback(&self, destination: &str) -> Result<(), TaskError> {
        let target = self.resolve(destination)?;
        remove_if_exists(&part_path(&target)).await?;
        remove_if_exists(&target).await?;
        debug!("Rolled back {:?}", target);
        Ok(())
    }
}
