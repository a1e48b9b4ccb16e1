use crate::mapper::ParsedRecord;
use crate::queue::QueueConsumer;
use crate::sink::RecordSink;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The queue's single consumer. Accumulates records per target table and
/// flushes a table's batch when it reaches `batch_size`, when the flush
/// interval elapses with records pending, or during shutdown after draining
/// the queue. A failed flush is logged and the batch discarded; delivery is
/// best-effort and the pipeline keeps running.
pub struct BatchWriter {
    consumer: QueueConsumer,
    sink: Arc<dyn RecordSink>,
    batch_size: usize,
    flush_interval: Duration,
    shutdown: CancellationToken,
    pending: HashMap<String, Vec<ParsedRecord>>,
}

impl BatchWriter {
    pub fn new(
        consumer: QueueConsumer,
        sink: Arc<dyn RecordSink>,
        batch_size: usize,
        flush_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            consumer,
            sink,
            batch_size: batch_size.max(1),
            flush_interval,
            shutdown,
            pending: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            batch_size = self.batch_size,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "batch writer started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.drain_and_flush().await;
                    break;
                }
                // The timer is polled before the queue so a busy queue cannot
                // postpone interval flushes indefinitely.
                _ = ticker.tick() => self.flush_all().await,
                maybe_record = self.consumer.recv() => match maybe_record {
                    Some(record) => self.push(record).await,
                    None => {
                        // All producers dropped; nothing more will arrive.
                        self.flush_all().await;
                        break;
                    }
                },
            }
        }

        info!("batch writer stopped");
    }

    async fn push(&mut self, record: ParsedRecord) {
        let table = record.table.clone();
        let batch = self.pending.entry(table.clone()).or_default();
        batch.push(record);
        if batch.len() >= self.batch_size {
            if let Some(full) = self.pending.remove(&table) {
                self.flush(&table, full).await;
            }
        }
    }

    async fn flush_all(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (table, batch) in pending {
            if !batch.is_empty() {
                self.flush(&table, batch).await;
            }
        }
    }

    /// Shutdown path: pull whatever the queue still holds, then flush every
    /// partial batch so a clean stop never silently drops records.
    async fn drain_and_flush(&mut self) {
        while let Some(record) = self.consumer.try_recv() {
            self.push(record).await;
        }
        self.flush_all().await;
    }

    async fn flush(&self, table: &str, batch: Vec<ParsedRecord>) {
        match self.sink.insert_batch(table, &batch).await {
            Ok(()) => {
                info!(table, record_count = batch.len(), "flushed batch to sink");
            }
            Err(err) => {
                error!(
                    error = %err,
                    table,
                    record_count = batch.len(),
                    "batch insert failed; discarding batch"
                );
            }
        }
    }
}
