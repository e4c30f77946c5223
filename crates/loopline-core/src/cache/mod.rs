//! In-memory TTL cache for idempotent read responses.

pub mod response;

pub use response::{CacheEntry, ResponseCache};
