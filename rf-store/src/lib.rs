//! Expiring key-value store abstraction for rapidfire.
//!
//! The batch engine keeps no authoritative in-process state; every pending
//! batch lives in an [`ExpiringStore`]. Two backends are provided: Redis for
//! shared multi-process deployments and an in-memory store for single-process
//! runs and tests.

mod clock;
mod error;
mod memory;
mod redis_store;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use traits::ExpiringStore;
