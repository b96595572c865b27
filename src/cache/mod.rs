//! Versioned response caches for offline support.
//!
//! This module provides:
//! - Named caches persisted in SQLite, one per tier and generation
//! - Eligibility rules (success status, same-origin or allow-listed)
//! - Best-effort pre-caching and purging of superseded generations

mod storage;
mod tiers;

pub use storage::{CacheStorage, SqliteStorage};
pub use tiers::{CacheTierManager, PrecacheReport};

#[cfg(test)]
pub use storage::CachedResponse;
