//! Window store backends.
//!
//! - **Memory**: process-local store, for single-instance deployments and tests
//! - **Redis**: shared store for counters used by many processes

mod memory;
mod redis;

pub use memory::{MemoryStore, MemoryTransaction};
pub use self::redis::{RedisStore, RedisTransaction};

use crate::error::{Result, WindowError};

/// Parse a stored counter value.
fn parse_count(raw: &str) -> Result<i64> {
    raw.parse()
        .map_err(|_| WindowError::MalformedState(format!("{raw:?} is not an integer")))
}
