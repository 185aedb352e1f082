//! Counters for the ingestion pipeline.

use std::sync::atomic::AtomicU64;

/// Ingestion pipeline metrics.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    /// Rows accepted by `submit`
    pub rows_submitted: AtomicU64,
    /// Rows acknowledged by the server
    pub rows_flushed: AtomicU64,
    /// insertBatch calls issued
    pub batches_sent: AtomicU64,
    /// insertBatch calls that failed
    pub insert_errors: AtomicU64,
}
