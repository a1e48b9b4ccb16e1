use anyhow::{Context, Result};
use logship::config::Config;
use logship::offsets::{run_cursor_gc, OffsetTracker};
use logship::pipeline::Pipeline;
use logship::queue;
use logship::rules::RuleSet;
use logship::sink::{PgSink, RecordSink};
use logship::watcher::{watch_directory, FileEvent, WATCHER_CHANNEL_CAPACITY};
use logship::writer::BatchWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::var("LOGSHIP_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    let rules = Arc::new(RuleSet::compile(&config.log_files)?);
    info!(
        config = %config_path,
        rule_count = rules.len(),
        watch_directory = %config.watch_directory_path().display(),
        "configuration loaded"
    );

    let sink = PgSink::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    let record_sink: Arc<dyn RecordSink> = Arc::new(sink.clone());

    let shutdown = CancellationToken::new();
    let perf = &config.performance;

    let (producer, consumer) = queue::bounded(perf.max_queue_length, shutdown.clone());
    let writer = BatchWriter::new(
        consumer,
        record_sink,
        perf.batch_size,
        Duration::from_millis(perf.flush_interval_ms),
        shutdown.clone(),
    );
    let writer_handle = tokio::spawn(writer.run());

    let tracker = Arc::new(OffsetTracker::new());
    let gc_handle = tokio::spawn(run_cursor_gc(
        tracker.clone(),
        Duration::from_secs(perf.cursor_gc_interval_secs),
        shutdown.clone(),
    ));

    let (event_tx, mut event_rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
    let watcher_handle = tokio::spawn({
        let root = config.watch_directory_path();
        let recursive = config.recursive;
        let poll_interval = Duration::from_millis(perf.watch_poll_interval_ms);
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) =
                watch_directory(root, recursive, poll_interval, event_tx, shutdown).await
            {
                error!(error = %err, "file watcher exited unexpectedly");
            }
        }
    });

    let pipeline = Arc::new(Pipeline::new(rules, tracker, producer));
    let handler_semaphore = Arc::new(Semaphore::new(perf.max_concurrent_handlers));

    info!("logship started; awaiting file events");

    loop {
        tokio::select! {
            maybe_event = event_rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        dispatch_event(event, pipeline.clone(), handler_semaphore.clone());
                    }
                    None => {
                        warn!("event channel closed; shutting down");
                        break;
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "failed while waiting for shutdown signal");
                }
                info!("shutdown signal received");
                break;
            }
        }
    }

    // Stop producers first, then let the writer drain and flush, and only
    // then close the sink so the final batches still have a connection.
    shutdown.cancel();
    drop(pipeline);

    if let Err(err) = writer_handle.await {
        error!(error = %err, "batch writer task panicked");
    }
    if let Err(err) = gc_handle.await {
        error!(error = %err, "cursor gc task panicked");
    }
    if let Err(err) = watcher_handle.await {
        error!(error = %err, "watcher task panicked");
    }

    sink.close().await;
    info!("shutdown complete");

    Ok(())
}

/// Runs one notification handler per event, bounded by the semaphore. Events
/// for the same path may run back to back; the per-path cursor lock inside
/// the pipeline keeps their reads serialized.
fn dispatch_event(event: FileEvent, pipeline: Arc<Pipeline>, semaphore: Arc<Semaphore>) {
    if !pipeline.matches(event.path()) {
        return;
    }
    tokio::spawn(async move {
        let permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        pipeline.handle_event(&event).await;
        drop(permit);
    });
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
