use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-file read position. Holds only the byte offset of the last complete
/// line consumed; everything after it is unread (or a retained partial line).
#[derive(Debug, Default)]
pub struct FileCursor {
    offset: u64,
}

/// Outcome of resolving where the next read should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWindow {
    pub start: u64,
    /// The file shrank below the stored offset, so the cursor was reset and
    /// the file is re-ingested from the beginning.
    pub truncated: bool,
}

impl FileCursor {
    /// Returns the offset to seek to given the file's current size, resetting
    /// to zero when the file was truncated or rotated.
    pub fn resolve(&mut self, current_size: u64) -> ReadWindow {
        if current_size < self.offset {
            self.offset = 0;
            ReadWindow {
                start: 0,
                truncated: true,
            }
        } else {
            ReadWindow {
                start: self.offset,
                truncated: false,
            }
        }
    }

    /// Records that all complete lines up to `offset` have been consumed.
    pub fn advance_to(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Shared path-to-cursor map. Handlers take the per-path lock for the whole
/// read-parse-enqueue sequence, which serializes concurrent notifications for
/// the same file and keeps offsets monotonic between truncations.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    cursors: Mutex<HashMap<PathBuf, Arc<Mutex<FileCursor>>>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cursor for `path`, creating one at offset zero on the
    /// first notification for that path.
    pub async fn cursor(&self, path: &Path) -> Arc<Mutex<FileCursor>> {
        let mut cursors = self.cursors.lock().await;
        cursors
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    pub async fn tracked_paths(&self) -> Vec<PathBuf> {
        self.cursors.lock().await.keys().cloned().collect()
    }

    pub async fn remove(&self, path: &Path) {
        self.cursors.lock().await.remove(path);
    }

    pub async fn len(&self) -> usize {
        self.cursors.lock().await.len()
    }
}

/// Periodically drops cursors whose file no longer exists on disk. Runs on a
/// fixed interval independent of event traffic until shutdown is signaled.
pub async fn run_cursor_gc(
    tracker: Arc<OffsetTracker>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("cursor gc task stopping");
                return;
            }
            _ = sleep(interval) => {}
        }

        let mut removed = 0usize;
        for path in tracker.tracked_paths().await {
            if tokio::fs::metadata(&path).await.is_err() {
                tracker.remove(&path).await;
                debug!(path = %path.display(), "dropped cursor for deleted file");
                removed += 1;
            }
        }
        if removed > 0 {
            let remaining = tracker.len().await;
            info!(removed, remaining, "cursor gc pass complete");
        }
    }
}
