//! Client configuration.

use std::time::Duration;

use tidelog_common::{Error, Result};

/// Maximum accepted insert batch size.
const MAX_INSERT_BATCH_SIZE: usize = 200_000;

/// Configuration for a [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// TCP connect (and login) timeout
    pub connect_timeout: Duration,
    /// Default timeout for RPC calls; `None` waits indefinitely
    pub request_timeout: Option<Duration>,
    /// Keepalive ping period
    pub keepalive_interval: Duration,
    /// Rows fetched per result page
    pub fetch_size: usize,
    /// Maximum rows per insertBatch call
    pub insert_batch_size: usize,
    /// In-flight row budget for the ingestion pipeline (hard cap)
    pub max_pending_rows: usize,
    /// Flush worker wake period. No lower bound is enforced beyond being
    /// non-zero; a very small interval makes the flush loop spin.
    pub flush_interval: Duration,
    /// Worker budget for the columnar codec; 0 means size to the host
    pub codec_parallelism: usize,
    /// Maximum wire frame size
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8888,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            keepalive_interval: Duration::from_secs(2),
            fetch_size: 10_000,
            insert_batch_size: 3_500,
            max_pending_rows: 100_000,
            flush_interval: Duration::from_secs(1),
            codec_parallelism: 0,
            max_frame_size: 64 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Validate field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.insert_batch_size == 0 || self.insert_batch_size > MAX_INSERT_BATCH_SIZE {
            return Err(Error::InvalidInput(format!(
                "insert_batch_size must be in 1..={}",
                MAX_INSERT_BATCH_SIZE
            )));
        }
        if self.max_pending_rows == 0 {
            return Err(Error::InvalidInput(
                "max_pending_rows must be positive".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::InvalidInput(
                "flush_interval must be positive".to_string(),
            ));
        }
        if self.fetch_size == 0 {
            return Err(Error::InvalidInput("fetch_size must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_ranges() {
        let mut c = ClientConfig::default();
        c.insert_batch_size = 0;
        assert!(c.validate().is_err());

        let mut c = ClientConfig::default();
        c.insert_batch_size = MAX_INSERT_BATCH_SIZE + 1;
        assert!(c.validate().is_err());

        let mut c = ClientConfig::default();
        c.flush_interval = Duration::ZERO;
        assert!(c.validate().is_err());

        let mut c = ClientConfig::default();
        c.max_pending_rows = 0;
        assert!(c.validate().is_err());
    }
}
