//! Common types and utilities shared across tidelog client components.

pub mod error;
pub mod metrics;
pub mod types;

pub use error::{Error, Result};
pub use types::{Row, Value};

/// Re-export commonly used external types
pub use chrono::{DateTime, FixedOffset, Utc};
