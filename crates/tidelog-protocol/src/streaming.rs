//! Columnar stream codec for bulk row transfer.
//!
//! Row lists are partitioned into contiguous slices, each transposed to
//! column-oriented form (one array per field, aligned by row position, with
//! holes where a row lacks the field), binary-encoded, compressed and
//! base64-wrapped into a [`Chunk`]. Slices are processed on the blocking
//! pool, bounded by a small worker budget, and reassembled strictly in
//! submission order: row order across chunks is a property of chunk order,
//! never of chunk content. The decoder reverses the pipeline; chunks cover
//! disjoint row ranges, so concatenating decoded slices in chunk order
//! restores the original list.
//!
//! A hole (field absent from a row) is preserved as distinct from an
//! explicit null field.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::Semaphore;

use tidelog_common::{Error, Result, Row, Value};

use crate::compress;

/// Cap on the shared encode/decode worker budget.
const MAX_POOL_SIZE: usize = 8;

/// One independently compressed slice of row data.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Uncompressed payload length in bytes
    pub size: usize,
    /// Base64 of the compressed column payload
    pub bin: String,
}

impl Chunk {
    /// Wire representation carried inside an envelope parameter.
    pub fn to_value(&self) -> Value {
        let mut m = HashMap::new();
        m.insert("size".to_string(), Value::Int(self.size as i64));
        m.insert("bin".to_string(), Value::String(self.bin.clone()));
        Value::Map(m)
    }

    /// Parse the wire representation back into a chunk.
    pub fn from_value(value: &Value) -> Result<Chunk> {
        let m = value
            .as_map()
            .ok_or_else(|| Error::Protocol("chunk is not a map".to_string()))?;
        let size = m
            .get("size")
            .and_then(Value::as_i64)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| Error::Protocol("chunk missing size".to_string()))?;
        let bin = m
            .get("bin")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("chunk missing bin".to_string()))?
            .to_string();
        Ok(Chunk { size, bin })
    }
}

/// Column-oriented form of a row slice. `None` marks a hole: the row did not
/// carry the field at all.
type Columns = HashMap<String, Vec<Option<Value>>>;

/// Parallel columnar encoder/decoder.
pub struct StreamCodec {
    parallelism: usize,
    limiter: Arc<Semaphore>,
}

impl StreamCodec {
    /// Create a codec with an explicit worker budget.
    pub fn new(parallelism: usize) -> Result<StreamCodec> {
        if parallelism == 0 {
            return Err(Error::InvalidInput(
                "codec parallelism must be positive".to_string(),
            ));
        }
        Ok(StreamCodec {
            parallelism,
            limiter: Arc::new(Semaphore::new(parallelism)),
        })
    }

    /// Create a codec sized to the host: `min(8, available cores)`.
    pub fn with_default_parallelism() -> StreamCodec {
        let parallelism = num_cpus::get().clamp(1, MAX_POOL_SIZE);
        StreamCodec {
            parallelism,
            limiter: Arc::new(Semaphore::new(parallelism)),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Encode a row list into compressed columnar chunks.
    ///
    /// Chunk order equals slice order; the caller must keep it when
    /// forwarding chunks. Any slice failure fails the whole encode.
    pub async fn encode(&self, rows: Vec<Row>, use_gzip: bool) -> Result<Vec<Chunk>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let per_slice = (rows.len() + self.parallelism) / self.parallelism;
        let mut handles = Vec::new();
        let mut rows = rows;
        while !rows.is_empty() {
            let take = per_slice.min(rows.len());
            let rest = rows.split_off(take);
            let slice = std::mem::replace(&mut rows, rest);

            let limiter = Arc::clone(&self.limiter);
            handles.push(tokio::spawn(async move {
                let _permit = limiter
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("codec worker pool closed".to_string()))?;
                tokio::task::spawn_blocking(move || encode_slice(&slice, use_gzip))
                    .await
                    .map_err(|e| Error::Internal(format!("encode task failed: {}", e)))?
            }));
        }

        let mut chunks = Vec::with_capacity(handles.len());
        for handle in handles {
            chunks.push(
                handle
                    .await
                    .map_err(|e| Error::Internal(format!("encode task failed: {}", e)))??,
            );
        }
        Ok(chunks)
    }

    /// Decode chunks back into rows, concatenated in input chunk order.
    ///
    /// The first chunk failure fails the whole decode; partial results are
    /// discarded.
    pub async fn decode(&self, chunks: Vec<Chunk>) -> Result<Vec<Row>> {
        let mut handles = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let limiter = Arc::clone(&self.limiter);
            handles.push(tokio::spawn(async move {
                let _permit = limiter
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("codec worker pool closed".to_string()))?;
                tokio::task::spawn_blocking(move || decode_chunk(&chunk))
                    .await
                    .map_err(|e| Error::Internal(format!("decode task failed: {}", e)))?
            }));
        }

        let mut rows = Vec::new();
        for handle in handles {
            rows.extend(
                handle
                    .await
                    .map_err(|e| Error::Internal(format!("decode task failed: {}", e)))??,
            );
        }
        Ok(rows)
    }
}

/// Transpose one row slice to columns, encode and compress it.
fn encode_slice(rows: &[Row], use_gzip: bool) -> Result<Chunk> {
    let len = rows.len();
    let mut columns: Columns = HashMap::new();

    for (i, row) in rows.iter().enumerate() {
        for (key, value) in row {
            let items = columns
                .entry(key.clone())
                .or_insert_with(|| vec![None; len]);
            items[i] = Some(value.clone());
        }
    }

    let encoded = bincode::serialize(&columns)
        .map_err(|e| Error::Serialization(format!("cannot encode columns: {}", e)))?;
    let compressed = if use_gzip {
        compress::gzip(&encoded)?
    } else {
        compress::deflate(&encoded)?
    };

    Ok(Chunk {
        size: encoded.len(),
        bin: BASE64.encode(compressed),
    })
}

/// Inflate one chunk and transpose its columns back to rows.
fn decode_chunk(chunk: &Chunk) -> Result<Vec<Row>> {
    let compressed = BASE64
        .decode(&chunk.bin)
        .map_err(|e| Error::Serialization(format!("invalid chunk base64: {}", e)))?;
    let raw = compress::inflate(&compressed, chunk.size)?;
    let columns: Columns = bincode::deserialize(&raw)
        .map_err(|e| Error::Serialization(format!("cannot decode columns: {}", e)))?;

    let len = match columns.values().next() {
        Some(col) => col.len(),
        None => return Ok(Vec::new()),
    };
    if columns.values().any(|col| col.len() != len) {
        return Err(Error::Serialization(
            "column arrays are not aligned".to_string(),
        ));
    }

    let mut rows: Vec<Row> = vec![Row::new(); len];
    for (key, items) in columns {
        for (i, item) in items.into_iter().enumerate() {
            if let Some(value) = item {
                rows[i].insert(key.clone(), value);
            }
        }
    }
    Ok(rows)
}

/// Encode a result page map into its compressed binary form:
/// `(base64 payload, uncompressed size)`.
pub fn encode_binary_page(page: &HashMap<String, Value>) -> Result<(String, usize)> {
    let encoded = bincode::serialize(page)
        .map_err(|e| Error::Serialization(format!("cannot encode page: {}", e)))?;
    let compressed = compress::deflate(&encoded)?;
    Ok((BASE64.encode(compressed), encoded.len()))
}

/// Decode a compressed binary result page back into its map form.
pub fn decode_binary_page(binary: &str, uncompressed_size: usize) -> Result<HashMap<String, Value>> {
    let compressed = BASE64
        .decode(binary)
        .map_err(|e| Error::Serialization(format!("invalid page base64: {}", e)))?;
    let raw = compress::inflate(&compressed, uncompressed_size)?;
    bincode::deserialize(&raw)
        .map_err(|e| Error::Serialization(format!("cannot decode page: {}", e)))
}
