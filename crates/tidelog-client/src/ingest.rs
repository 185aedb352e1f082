//! Batched, backpressured ingestion pipeline.
//!
//! Submitted rows buffer per destination table behind a counting semaphore
//! sized to the in-flight row budget. The budget is a hard cap: once it is
//! exhausted, submitters block until the flush worker frees permits. The
//! worker wakes on demand or on an interval, swaps the whole buffer out,
//! releases the consumed permits immediately (new submissions proceed while
//! the old batch is still encoding), then groups batches per table, encodes
//! each group through the columnar codec and issues one insert call per
//! group. Each submitted batch completes or fails exactly once through its
//! [`InsertHandle`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use tidelog_common::metrics::IngestMetrics;
use tidelog_common::{Error, Result, Row, Value};
use tidelog_protocol::{Chunk, StreamCodec};

use crate::connection::Rpc;

/// Reserved per-row timestamp field, auto-populated at submission.
pub const TIME_FIELD: &str = "_time";

const INSERT_METHOD: &str = "tidelog.table.insertBatch";

/// Ingestion pipeline configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// In-flight row budget (permit capacity)
    pub max_pending_rows: usize,
    /// Maximum rows per insert call
    pub insert_batch_size: usize,
    /// Flush worker wake period
    pub flush_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_pending_rows: 100_000,
            insert_batch_size: 3_500,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Completion handle for one submitted batch.
///
/// Exactly one of completion or failure fires, exactly once.
pub struct InsertHandle {
    rx: oneshot::Receiver<std::result::Result<usize, Arc<Error>>>,
    wake: Arc<Notify>,
}

impl InsertHandle {
    /// Wait for the batch to be flushed; returns the row count on success.
    pub async fn wait(self) -> Result<usize> {
        // nudge the worker so a waiter is not stuck for a full interval
        self.wake.notify_one();
        match self.rx.await {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(cause)) => Err(Error::Insert(cause)),
            Err(_) => Err(Error::Interrupted("insert abandoned".to_string())),
        }
    }
}

/// Observer of failed insert groups. Implementations must not block;
/// panics are isolated and logged.
pub trait FailureListener: Send + Sync {
    fn on_insert_failure(&self, table: &str, rows: &[Row], cause: &Error);
}

/// One buffered submission awaiting flush.
struct QueuedBatch {
    rows: Vec<Row>,
    done: oneshot::Sender<std::result::Result<usize, Arc<Error>>>,
}

/// The ingestion pipeline.
pub struct Ingestor {
    /// Self-handle for spawning the flush worker lazily
    me: Weak<Ingestor>,
    rpc: Arc<dyn Rpc>,
    codec: Arc<StreamCodec>,
    config: IngestConfig,
    permits: Arc<Semaphore>,
    buffers: parking_lot::Mutex<HashMap<String, Vec<QueuedBatch>>>,
    wake: Arc<Notify>,
    started: AtomicBool,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    failure_listeners: parking_lot::RwLock<Vec<Arc<dyn FailureListener>>>,
    metrics: Arc<IngestMetrics>,
}

impl Ingestor {
    pub fn new(rpc: Arc<dyn Rpc>, codec: Arc<StreamCodec>, config: IngestConfig) -> Arc<Ingestor> {
        let permits = Arc::new(Semaphore::new(config.max_pending_rows));
        Arc::new_cyclic(|me| Ingestor {
            me: me.clone(),
            rpc,
            codec,
            config,
            permits,
            buffers: parking_lot::Mutex::new(HashMap::new()),
            wake: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
            worker: parking_lot::Mutex::new(None),
            shutdown: CancellationToken::new(),
            failure_listeners: parking_lot::RwLock::new(Vec::new()),
            metrics: Arc::new(IngestMetrics::default()),
        })
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        self.failure_listeners.write().push(listener);
    }

    pub fn remove_failure_listener(&self, listener: &Arc<dyn FailureListener>) {
        self.failure_listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Submit rows for insertion into `table`.
    ///
    /// Blocks only when the in-flight row budget is exhausted, until the
    /// flush worker frees permits or the pipeline shuts down. A batch larger
    /// than the whole budget can never be satisfied and is rejected.
    pub async fn submit(&self, table: &str, mut rows: Vec<Row>) -> Result<InsertHandle> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        if rows.is_empty() {
            // nothing to buffer; complete immediately
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(0));
            return Ok(InsertHandle {
                rx,
                wake: Arc::clone(&self.wake),
            });
        }
        if rows.len() > self.config.max_pending_rows {
            return Err(Error::InvalidInput(format!(
                "batch of {} rows exceeds the in-flight budget of {}",
                rows.len(),
                self.config.max_pending_rows
            )));
        }

        for row in &mut rows {
            stamp_time(row);
        }

        self.ensure_worker();

        let wanted = rows.len() as u32;
        if wanted > 0 {
            match self.permits.try_acquire_many(wanted) {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    // budget exhausted: ask for a flush, then wait our turn
                    self.wake.notify_one();
                    tokio::select! {
                        acquired = self.permits.acquire_many(wanted) => {
                            acquired.map_err(|_| Error::Closed)?.forget();
                        }
                        _ = self.shutdown.cancelled() => return Err(Error::Closed),
                    }
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut buffers = self.buffers.lock();
            buffers
                .entry(table.to_string())
                .or_default()
                .push(QueuedBatch { rows, done: tx });
        }
        self.metrics
            .rows_submitted
            .fetch_add(wanted as u64, Ordering::Relaxed);

        if self.permits.available_permits() <= self.config.max_pending_rows * 4 / 5 {
            self.wake.notify_one();
        }

        Ok(InsertHandle {
            rx,
            wake: Arc::clone(&self.wake),
        })
    }

    /// Start the flush worker exactly once, on first submission.
    fn ensure_worker(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let Some(ingestor) = self.me.upgrade() else {
                return;
            };
            let handle = tokio::spawn(async move { ingestor.run_flush_loop().await });
            *self.worker.lock() = Some(handle);
        }
    }

    async fn run_flush_loop(self: Arc<Self>) {
        debug!("flush worker started");
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => break,
            }
            self.flush_once().await;
        }
        // one more chance to flush after shutdown
        self.flush_once().await;
        debug!("flush worker stopped");
    }

    /// Stop the worker without waiting for the final flush.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
        self.wake.notify_one();
    }

    /// Stop the worker and return once the buffer is drained.
    pub async fn shutdown(&self) {
        self.begin_shutdown();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("flush worker failed to stop: {}", e);
            }
        }
    }

    /// Swap the whole buffer out, free its permits, flush per destination.
    async fn flush_once(&self) {
        if self.permits.available_permits() == self.config.max_pending_rows {
            return;
        }

        let drained = {
            let mut buffers = self.buffers.lock();
            std::mem::take(&mut *buffers)
        };
        let consumed: usize = drained
            .values()
            .flat_map(|batches| batches.iter())
            .map(|b| b.rows.len())
            .sum();
        // release before the slow encode+send path so new submissions
        // proceed while this batch is in flight
        self.permits.add_permits(consumed);

        for (table, batches) in drained {
            self.flush_table(&table, batches).await;
        }
    }

    /// Flush one destination: group pending batches and insert each group.
    async fn flush_table(&self, table: &str, batches: Vec<QueuedBatch>) {
        let mut remaining = batches.into_iter();
        loop {
            let mut group = Vec::new();
            let mut row_count = 0usize;
            for batch in remaining.by_ref() {
                row_count += batch.rows.len();
                group.push(batch);
                if row_count >= self.config.insert_batch_size {
                    break;
                }
            }
            if group.is_empty() {
                return;
            }

            match self.send_group(table, &group).await {
                Ok(()) => {
                    self.metrics
                        .rows_flushed
                        .fetch_add(row_count as u64, Ordering::Relaxed);
                    self.metrics.batches_sent.fetch_add(1, Ordering::Relaxed);
                    for batch in group {
                        let count = batch.rows.len();
                        let _ = batch.done.send(Ok(count));
                    }
                }
                Err(e) => {
                    warn!(table = %table, "cannot insert data: {}", e);
                    self.metrics.insert_errors.fetch_add(1, Ordering::Relaxed);
                    let cause = Arc::new(e);
                    // fail this group and everything still queued behind it
                    for batch in group.into_iter().chain(remaining.by_ref()) {
                        self.notify_failure(table, &batch.rows, &cause);
                        let _ = batch.done.send(Err(Arc::clone(&cause)));
                    }
                    return;
                }
            }
        }
    }

    async fn send_group(&self, table: &str, group: &[QueuedBatch]) -> Result<()> {
        let rows: Vec<Row> = group
            .iter()
            .flat_map(|batch| batch.rows.iter().cloned())
            .collect();
        let chunks = self.codec.encode(rows, false).await?;

        let mut params = HashMap::new();
        params.insert("table".to_string(), Value::String(table.to_string()));
        params.insert(
            "bins".to_string(),
            Value::Array(chunks.iter().map(Chunk::to_value).collect()),
        );
        self.rpc.call(INSERT_METHOD, params, None).await?;
        Ok(())
    }

    fn notify_failure(&self, table: &str, rows: &[Row], cause: &Error) {
        let listeners: Vec<_> = self.failure_listeners.read().clone();
        for listener in listeners {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_insert_failure(table, rows, cause)
            }));
            if result.is_err() {
                error!("insert failure listener panicked");
            }
        }
    }
}

/// Stamp the reserved timestamp field when absent or mistyped.
fn stamp_time(row: &mut Row) {
    match row.get(TIME_FIELD) {
        Some(Value::Date(_)) => {}
        _ => {
            row.insert(TIME_FIELD.to_string(), Value::now());
        }
    }
}
