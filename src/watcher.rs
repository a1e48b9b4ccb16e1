use anyhow::{Context, Result};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A change notification for one file under the watch root. Directory events
/// never reach the pipeline; they are filtered here.
#[derive(Debug, Clone)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Created(path) | FileEvent::Modified(path) => path,
        }
    }
}

pub const WATCHER_CHANNEL_CAPACITY: usize = 1000;

/// Watches the configured root and forwards file events until shutdown.
///
/// The notify backend may deliver duplicate or coalesced events; that is fine
/// downstream because offset tracking makes repeated reads of the same region
/// yield nothing new.
pub async fn watch_directory(
    root: PathBuf,
    recursive: bool,
    poll_interval: Duration,
    event_tx: mpsc::Sender<FileEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    let watcher_tx = event_tx.clone();

    let mut watcher = RecommendedWatcher::new(
        move |res| match res {
            Ok(event) => forward_event(&watcher_tx, event),
            Err(err) => error!(error = %err, "file watcher error"),
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )
    .context("failed to create notify watcher")?;

    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher
        .watch(&root, mode)
        .with_context(|| format!("failed to watch directory {}", root.display()))?;

    info!(
        root = %root.display(),
        recursive,
        "file watcher started"
    );

    // Keep the watcher alive until shutdown is signaled.
    shutdown.cancelled().await;
    debug!("file watcher stopping");
    Ok(())
}

type MakeFileEvent = fn(PathBuf) -> FileEvent;

fn forward_event(event_tx: &mpsc::Sender<FileEvent>, event: Event) {
    let (make, kind): (MakeFileEvent, &str) = match event.kind {
        EventKind::Create(_) => (FileEvent::Created, "created"),
        EventKind::Modify(_) => (FileEvent::Modified, "modified"),
        _ => return,
    };

    for path in event.paths.into_iter().filter(|path| !path.is_dir()) {
        debug!(path = %path.display(), kind, "file change detected");
        // A dropped event is recovered by the next notification for the
        // same file, since reads always resume from the stored offset.
        match event_tx.try_send(make(path)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(kind, "watcher channel full; dropping file event");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(kind, "watcher channel closed; dropping file event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    fn drained(rx: &mut mpsc::Receiver<FileEvent>) -> Vec<FileEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn forwards_file_events_and_skips_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("app.log");
        std::fs::write(&file, b"x\n").expect("write");

        let (tx, mut rx) = mpsc::channel(8);
        forward_event(
            &tx,
            Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone()),
        );
        forward_event(
            &tx,
            Event::new(EventKind::Modify(ModifyKind::Any)).add_path(dir.path().to_path_buf()),
        );
        forward_event(&tx, Event::new(EventKind::Other).add_path(file.clone()));

        let events = drained(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FileEvent::Created(path) if path == &file));
    }

    #[test]
    fn modifications_forward_with_every_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("a.log");
        let second = dir.path().join("b.log");
        std::fs::write(&first, b"x\n").expect("write");
        std::fs::write(&second, b"x\n").expect("write");

        let (tx, mut rx) = mpsc::channel(8);
        forward_event(
            &tx,
            Event::new(EventKind::Modify(ModifyKind::Any))
                .add_path(first.clone())
                .add_path(second.clone()),
        );

        let events = drained(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| matches!(event, FileEvent::Modified(_))));
        assert_eq!(events[0].path(), first);
        assert_eq!(events[1].path(), second);
    }
}
