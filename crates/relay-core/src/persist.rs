//! Shared write-behind persistence primitive used by `relay-sessions`,
//! `relay-scheduler`, and `relay-channels`' pairing store: an atomic
//! write-rename plus a debounce timer so a burst of mutations collapses
//! into one disk write instead of one per mutation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Write `value` to `path` as pretty JSON via a temp file in the same
/// directory, then rename into place — readers never observe a partial file.
pub async fn write_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Read and deserialize `path`, returning `Ok(None)` if it doesn't exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Debounces repeated writes of the same logical value to one file.
///
/// Each [`DebouncedWriter::schedule`] call bumps a generation counter and
/// spawns a task that sleeps for the debounce window, then writes — but
/// only if no later call superseded it in the meantime. A burst of N
/// mutations inside the window produces exactly one write.
pub struct DebouncedWriter {
    path: PathBuf,
    debounce: Duration,
    generation: Arc<AtomicU64>,
}

impl DebouncedWriter {
    pub fn new(path: PathBuf, debounce: Duration) -> Self {
        Self { path, debounce, generation: Arc::new(AtomicU64::new(0)) }
    }

    /// Schedule a debounced write. Returns immediately.
    pub fn schedule<T>(&self, value: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let path = self.path.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if generation.load(Ordering::SeqCst) != my_gen {
                return;
            }
            if let Err(e) = write_atomic(&path, &value).await {
                tracing::warn!(path = %path.display(), error = %e, "debounced write failed");
            }
        });
    }

    /// Bypass the debounce and write immediately — used on shutdown so the
    /// last mutation before exit isn't lost to a pending sleep.
    pub async fn flush_now<T: Serialize + Sync>(&self, value: &T) -> std::io::Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        write_atomic(&self.path, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Doc {
        value: u32,
    }

    #[tokio::test]
    async fn write_atomic_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/doc.json");
        write_atomic(&path, &Doc { value: 7 }).await.unwrap();
        let read: Doc = read_json(&path).unwrap().unwrap();
        assert_eq!(read, Doc { value: 7 });
    }

    #[test]
    fn read_json_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read: Option<Doc> = read_json(&path).unwrap();
        assert!(read.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_schedules_collapses_to_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let writer = DebouncedWriter::new(path.clone(), Duration::from_millis(200));

        for i in 0..5 {
            writer.schedule(Doc { value: i });
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;

        let read: Doc = read_json(&path).unwrap().unwrap();
        assert_eq!(read, Doc { value: 4 });
    }
}
