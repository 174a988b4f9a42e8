//! Concurrent LRU caches for blocks and open tables.

mod lru;

pub use lru::Cache;
