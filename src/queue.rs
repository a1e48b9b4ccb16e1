use crate::mapper::ParsedRecord;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outcome of an enqueue attempt that could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Shutdown was signaled; the producer should stop reading.
    ShuttingDown,
}

/// Producer half of the ingest queue. Cloneable; any number of notification
/// handlers may hold one.
#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<ParsedRecord>,
    shutdown: CancellationToken,
}

/// Consumer half. Exactly one of these exists; the batch writer owns it.
pub struct QueueConsumer {
    rx: mpsc::Receiver<ParsedRecord>,
}

/// Creates the bounded FIFO hand-off between file readers and the writer.
/// `capacity` is the backpressure bound: with the queue full, `enqueue`
/// suspends its caller until the consumer drains a record or shutdown fires.
pub fn bounded(capacity: usize, shutdown: CancellationToken) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueProducer { tx, shutdown }, QueueConsumer { rx })
}

impl QueueProducer {
    /// Blocks (asynchronously) while the queue is full. Records are never
    /// silently dropped; the only failure is a signaled shutdown, which also
    /// unblocks producers already waiting for space.
    pub async fn enqueue(&self, record: ParsedRecord) -> Result<(), EnqueueError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(EnqueueError::ShuttingDown),
            sent = self.tx.send(record) => sent.map_err(|_| EnqueueError::ShuttingDown),
        }
    }
}

impl QueueConsumer {
    /// Waits for the next record; `None` once all producers are gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<ParsedRecord> {
        self.rx.recv().await
    }

    /// Non-blocking pull used to drain residual records during shutdown.
    pub fn try_recv(&mut self) -> Option<ParsedRecord> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::time::timeout;

    fn record(n: i64) -> ParsedRecord {
        let mut fields = BTreeMap::new();
        fields.insert(
            "response_status".to_string(),
            crate::mapper::FieldValue::Integer(n),
        );
        ParsedRecord {
            table: "app_logs".to_string(),
            fields,
        }
    }

    #[tokio::test]
    async fn enqueue_blocks_when_full_and_resumes_after_drain() {
        let (producer, mut consumer) = bounded(2, CancellationToken::new());
        producer.enqueue(record(1)).await.expect("first");
        producer.enqueue(record(2)).await.expect("second");

        // Third enqueue must block while the consumer is paused.
        let blocked = timeout(Duration::from_millis(50), producer.enqueue(record(3))).await;
        assert!(blocked.is_err(), "enqueue should not complete on a full queue");

        // Draining one record frees a slot and unblocks producers.
        assert!(consumer.recv().await.is_some());
        timeout(Duration::from_millis(200), producer.enqueue(record(3)))
            .await
            .expect("enqueue should resume")
            .expect("enqueue should succeed");
    }

    #[tokio::test]
    async fn shutdown_unblocks_pending_enqueue() {
        let shutdown = CancellationToken::new();
        let (producer, _consumer) = bounded(1, shutdown.clone());
        producer.enqueue(record(1)).await.expect("fill queue");

        let waiting = tokio::spawn({
            let producer = producer.clone();
            async move { producer.enqueue(record(2)).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        // Idempotent: a second signal has no additional effect.
        shutdown.cancel();

        let outcome = timeout(Duration::from_millis(200), waiting)
            .await
            .expect("blocked producer should return promptly")
            .expect("task");
        assert_eq!(outcome, Err(EnqueueError::ShuttingDown));
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails_immediately() {
        let shutdown = CancellationToken::new();
        let (producer, _consumer) = bounded(4, shutdown.clone());
        shutdown.cancel();
        assert_eq!(
            producer.enqueue(record(1)).await,
            Err(EnqueueError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_per_producer() {
        let (producer, mut consumer) = bounded(8, CancellationToken::new());
        for n in 0..5 {
            producer.enqueue(record(n)).await.expect("enqueue");
        }
        for n in 0..5 {
            assert_eq!(consumer.recv().await, Some(record(n)));
        }
    }
}
