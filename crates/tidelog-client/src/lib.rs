//! Async client engine for the tidelog analytics server.
//!
//! One persistent duplex connection carries two traffic classes: correlated
//! request/response pairs and unsolicited server-push traps. On top of it
//! the client provides query management with stamp-gated status tracking,
//! paged result cursors, and a batched, backpressured ingestion pipeline.
//!
//! ```no_run
//! use tidelog_client::Client;
//!
//! # async fn run() -> tidelog_common::Result<()> {
//! let client = Client::connect("localhost", 8888, "root", "secret").await?;
//! let mut cursor = client.query("search limit=10").await?;
//! while let Some(row) = cursor.next().await? {
//!     println!("{:?}", row);
//! }
//! cursor.close().await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod ingest;
pub mod query;

pub use client::{Client, StreamHandler};
pub use config::ClientConfig;
pub use connection::{Connection, Rpc, TrapListener};
pub use cursor::{Cursor, ResultPage};
pub use ingest::{FailureListener, IngestConfig, Ingestor, InsertHandle};
pub use query::{CancelReason, Query, QueryCommand, QueryStatus, SubQuery};
