//! Wire protocol for the tidelog client.
//!
//! The RPC bus exchanges [`Envelope`]s: requests, responses correlated to
//! requests by identifier, and unsolicited server-push traps. Envelopes
//! travel as length-prefixed JSON frames. Bulk row data (query result pages
//! and ingestion batches) bypasses JSON and moves through the columnar
//! [`streaming`] codec: independently compressed column-oriented chunks.

pub mod codec;
pub mod compress;
pub mod envelope;
pub mod frame;
pub mod streaming;

pub use envelope::{Envelope, EnvelopeKind};
pub use frame::EnvelopeCodec;
pub use streaming::{Chunk, StreamCodec};
