//! Non-blocking export pipeline from agent runs to the trace store.

use super::model::ExportRecord;
use super::store::SqliteTraceStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Destination for finished trace records.
pub trait TraceSink: Send + Sync {
    /// Hand over a batch. Must not block the caller.
    fn export(&self, batch: Vec<ExportRecord>);
}

/// Sink that discards everything, for runs with tracing disabled.
pub struct NoTraceSink;

impl TraceSink for NoTraceSink {
    fn export(&self, _batch: Vec<ExportRecord>) {}
}

/// Queues batches for a background worker that writes them to SQLite.
pub struct TraceExporter {
    sender: Mutex<Option<mpsc::Sender<Vec<ExportRecord>>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    store: Arc<SqliteTraceStore>,
    dropped: AtomicU64,
}

impl TraceExporter {
    /// Spawn the worker on the current runtime.
    pub fn start(store: Arc<SqliteTraceStore>, capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(Arc::clone(&store), rx));

        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
            store,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &Arc<SqliteTraceStore> {
        &self.store
    }

    /// Batches dropped because the queue was full.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting batches and wait until every queued batch is written.
    pub async fn shutdown(&self) {
        // Dropping the sender ends the worker once the queue is drained
        let sender = self.sender.lock().ok().and_then(|mut slot| slot.take());
        drop(sender);

        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!("Trace export worker failed: {}", e);
            }
        }
    }
}

impl TraceSink for TraceExporter {
    fn export(&self, batch: Vec<ExportRecord>) {
        if batch.is_empty() {
            return;
        }

        let sender = self.sender.lock().ok().and_then(|slot| slot.clone());
        let Some(sender) = sender else {
            debug!("Trace exporter shut down, discarding {} records", batch.len());
            return;
        };

        match sender.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Trace export queue full, dropping {} records", batch.len());
            }
            Err(TrySendError::Closed(batch)) => {
                debug!("Trace export queue closed, discarding {} records", batch.len());
            }
        }
    }
}

async fn run_worker(store: Arc<SqliteTraceStore>, mut rx: mpsc::Receiver<Vec<ExportRecord>>) {
    while let Some(batch) = rx.recv().await {
        let store = Arc::clone(&store);
        let result = tokio::task::spawn_blocking(move || store.insert_batch(&batch)).await;

        match result {
            Ok(Ok(outcome)) => debug!(
                "Exported {} traces, {} spans ({} dropped)",
                outcome.traces, outcome.spans, outcome.dropped
            ),
            Ok(Err(e)) => warn!("Failed to persist trace batch: {}", e),
            Err(e) => error!("Trace batch writer panicked: {}", e),
        }
    }
    debug!("Trace export worker finished");
}
