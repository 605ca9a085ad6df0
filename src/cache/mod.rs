//! In-memory caching primitives.
//!
//! - [`key`]: feed queries, deterministic cache keys, invalidation patterns
//! - [`store`]: TTL store with lazy and periodic expiry

pub mod key;
pub mod store;
