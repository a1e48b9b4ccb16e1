use crate::mapper::apply_mappings;
use crate::offsets::OffsetTracker;
use crate::parser::parse_line;
use crate::queue::{EnqueueError, QueueProducer};
use crate::rules::RuleSet;
use crate::watcher::FileEvent;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

const MAX_READ_CHUNK_BYTES: usize = 8 * 1024 * 1024; // 8 MiB per iteration

/// Ties the stages together for one file-change notification: rule routing,
/// offset resolution, chunked reads, parse, map, enqueue. Holds no state of
/// its own beyond the shared cursor map; per-path serialization comes from
/// each cursor's lock.
pub struct Pipeline {
    rules: Arc<RuleSet>,
    tracker: Arc<OffsetTracker>,
    producer: QueueProducer,
    max_chunk_bytes: usize,
}

impl Pipeline {
    pub fn new(rules: Arc<RuleSet>, tracker: Arc<OffsetTracker>, producer: QueueProducer) -> Self {
        Self {
            rules,
            tracker,
            producer,
            max_chunk_bytes: MAX_READ_CHUNK_BYTES,
        }
    }

    #[cfg(test)]
    fn with_chunk_size(mut self, max_chunk_bytes: usize) -> Self {
        self.max_chunk_bytes = max_chunk_bytes;
        self
    }

    /// Reacts to a single `created`/`modified` notification. Transient I/O
    /// failures are logged and skipped with the cursor unchanged, so the next
    /// notification retries from the same offset.
    pub async fn handle_event(&self, event: &FileEvent) {
        let path = event.path();
        let Some(rule) = self.rules.match_path(path) else {
            debug!(path = %path.display(), "no rule matches file; ignoring");
            return;
        };

        let cursor = self.tracker.cursor(path).await;
        let mut cursor = cursor.lock().await;

        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %path.display(),
                    "file unreadable; skipping notification, cursor unchanged"
                );
                return;
            }
        };

        let file_size = metadata.len();
        let window = cursor.resolve(file_size);
        if window.truncated {
            warn!(
                path = %path.display(),
                current_size = file_size,
                "file truncated or rotated; re-ingesting from start"
            );
        }

        let mut read_pos = window.start;
        // Bytes of the current unterminated line read so far. A line longer
        // than one chunk accumulates here until its newline arrives in a
        // later chunk, so the cursor still moves past it.
        let mut carry: Vec<u8> = Vec::new();
        while read_pos < file_size {
            let bytes_available = (file_size - read_pos).min(self.max_chunk_bytes as u64) as usize;
            let buffer = match read_chunk(path, read_pos, bytes_available).await {
                Ok(buffer) => buffer,
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %path.display(),
                        offset = read_pos,
                        "failed to read new bytes; will retry on next notification"
                    );
                    return;
                }
            };
            if buffer.is_empty() {
                return;
            }
            read_pos += buffer.len() as u64;
            carry.extend_from_slice(&buffer);

            // Never consume past the last newline; an unterminated trailing
            // line stays on disk for the next read.
            let consumed = bytes_through_last_newline(&carry);
            if consumed == 0 {
                continue;
            }

            let mut enqueued = 0usize;
            for line in complete_lines(&carry[..consumed]) {
                let Some(fields) = parse_line(&line, rule) else {
                    continue;
                };
                let Some(record) = apply_mappings(&fields, rule) else {
                    continue;
                };
                match self.producer.enqueue(record).await {
                    Ok(()) => enqueued += 1,
                    Err(EnqueueError::ShuttingDown) => {
                        debug!(
                            path = %path.display(),
                            "shutdown signaled mid-read; abandoning chunk"
                        );
                        return;
                    }
                }
            }

            carry.drain(..consumed);
            let offset = read_pos - carry.len() as u64;
            cursor.advance_to(offset);

            debug!(
                path = %path.display(),
                table = %rule.table,
                offset,
                enqueued,
                "chunk processed"
            );
        }
    }

    /// Exposes the matched rule for a path; used by the event loop to skip
    /// spawning handlers for files no rule cares about.
    pub fn matches(&self, path: &Path) -> bool {
        self.rules.match_path(path).is_some()
    }
}

async fn read_chunk(path: &Path, offset: u64, max_bytes: usize) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .with_context(|| format!("failed to seek {} to offset {offset}", path.display()))?;

    let mut buffer = vec![0u8; max_bytes];
    let mut total_read = 0usize;
    while total_read < max_bytes {
        let bytes_read = file
            .read(&mut buffer[total_read..])
            .await
            .with_context(|| format!("failed to read from {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        total_read += bytes_read;
    }
    buffer.truncate(total_read);
    Ok(buffer)
}

/// Byte count up to and including the final newline, or zero when the buffer
/// holds no complete line.
pub(crate) fn bytes_through_last_newline(buffer: &[u8]) -> usize {
    buffer
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map(|idx| idx + 1)
        .unwrap_or(0)
}

/// Splits a newline-terminated region into lines, dropping carriage returns
/// and decoding lossily so a stray invalid byte cannot abort the read.
pub(crate) fn complete_lines(region: &[u8]) -> impl Iterator<Item = String> + '_ {
    region.split(|byte| *byte == b'\n').filter_map(|raw| {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(raw).into_owned())
        }
    })
}
