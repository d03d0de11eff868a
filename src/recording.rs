//! Append-only recording of a master's stream.
//!
//! Each session writes the master's messages, concatenated in arrival order,
//! to `<dir>/master_<key>.<container>`. A new session with the same key
//! truncates the previous file. Writes go through an mpsc channel to a
//! background task that batches them to disk, so a slow disk stalls only the
//! session that owns the file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::RelayError;

const CHANNEL_CAPACITY: usize = 1024;

/// Where the recording for `key` lives.
pub fn recording_path(dir: &Path, key: &str, container: &str) -> PathBuf {
    dir.join(format!("master_{key}.{container}"))
}

/// Writer for one session's recording file.
pub struct Recorder {
    path: PathBuf,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    /// Set to `false` if the background writer exits due to an error.
    alive: Arc<AtomicBool>,
    bytes_written: Arc<AtomicU64>,
}

impl Recorder {
    /// Create (or truncate) the recording file and spawn the writer task.
    pub async fn create(dir: &Path, key: &str, container: &str) -> Result<Self, RelayError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| RelayError::Recording(format!("{}: {e}", dir.display())))?;

        let path = recording_path(dir, key, container);
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| RelayError::Recording(format!("{}: {e}", path.display())))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let alive = Arc::new(AtomicBool::new(true));
        let bytes_written = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(writer_task(
            file,
            rx,
            path.clone(),
            Arc::clone(&alive),
            Arc::clone(&bytes_written),
        ));

        info!(path = %path.display(), "recording started");
        Ok(Self {
            path,
            tx: Mutex::new(Some(tx)),
            task: tokio::sync::Mutex::new(Some(task)),
            alive,
            bytes_written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `data` for the file. Waits while the writer is behind.
    pub async fn append(&self, data: Bytes) -> Result<(), RelayError> {
        let tx = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(tx) = tx else {
            return Err(RelayError::Recording("recording closed".to_string()));
        };
        if !self.is_alive() {
            return Err(RelayError::Recording("recording writer stopped".to_string()));
        }
        tx.send(data)
            .await
            .map_err(|_| RelayError::Recording("recording writer stopped".to_string()))
    }

    /// Stop accepting data and wait until everything queued is on disk.
    pub async fn close(&self) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(path = %self.path.display(), "recording writer task failed: {e}");
            }
            info!(
                path = %self.path.display(),
                bytes = self.bytes_written(),
                "recording closed"
            );
        }
    }

    /// Whether the background writer task is still alive.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

/// Drain queued chunks to disk, flushing after each batch.
async fn writer_task(
    mut file: fs::File,
    mut rx: mpsc::Receiver<Bytes>,
    path: PathBuf,
    alive: Arc<AtomicBool>,
    bytes_written: Arc<AtomicU64>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = write_chunk(&mut file, &chunk, &bytes_written).await {
            error!(path = %path.display(), "recording write error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
        while let Ok(chunk) = rx.try_recv() {
            if let Err(e) = write_chunk(&mut file, &chunk, &bytes_written).await {
                error!(path = %path.display(), "recording write error: {e}");
                alive.store(false, Ordering::Relaxed);
                return;
            }
        }
        if let Err(e) = file.flush().await {
            error!(path = %path.display(), "recording flush error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
    }
    if let Err(e) = file.sync_all().await {
        debug!(path = %path.display(), "recording sync failed: {e}");
    }
}

async fn write_chunk(
    file: &mut fs::File,
    chunk: &[u8],
    bytes_written: &AtomicU64,
) -> std::io::Result<()> {
    file.write_all(chunk).await?;
    bytes_written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_layout() {
        let path = recording_path(Path::new("/tmp"), "room1", "webm");
        assert_eq!(path, PathBuf::from("/tmp/master_room1.webm"));
    }

    #[tokio::test]
    async fn test_appends_are_concatenated_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::create(dir.path(), "room1", "webm").await.unwrap();
        recorder.append(Bytes::from_static(&[1, 2, 3])).await.unwrap();
        recorder.append(Bytes::from_static(&[4, 5])).await.unwrap();
        recorder.close().await;

        let content = std::fs::read(dir.path().join("master_room1.webm")).unwrap();
        assert_eq!(content, vec![1, 2, 3, 4, 5]);
        assert_eq!(recorder.bytes_written(), 5);
    }

    #[tokio::test]
    async fn test_new_recording_truncates_old_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("master_k.webm"), b"stale data").unwrap();

        let recorder = Recorder::create(dir.path(), "k", "webm").await.unwrap();
        recorder.append(Bytes::from_static(b"new")).await.unwrap();
        recorder.close().await;

        let content = std::fs::read(dir.path().join("master_k.webm")).unwrap();
        assert_eq!(content, b"new");
    }

    #[tokio::test]
    async fn test_append_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::create(dir.path(), "k", "mp4").await.unwrap();
        recorder.close().await;
        recorder.close().await;
        assert!(matches!(
            recorder.append(Bytes::from_static(b"late")).await,
            Err(RelayError::Recording(_))
        ));
        assert!(dir.path().join("master_k.mp4").exists());
    }

    #[tokio::test]
    async fn test_empty_session_leaves_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::create(dir.path(), "quiet", "webm").await.unwrap();
        recorder.close().await;
        let meta = std::fs::metadata(dir.path().join("master_quiet.webm")).unwrap();
        assert_eq!(meta.len(), 0);
    }
}
