//! Persistent key/value storage.
//!
//! The core consumes two partitions: a secure one for credentials
//! ([`KeychainStore`], backed by the OS keychain) and a plain one for
//! session metadata ([`FileStore`], JSON files in the user data
//! directory). [`MemoryStore`] backs both partitions in tests and
//! embedded setups.

pub mod file;
pub mod keychain;
pub mod memory;

pub use file::FileStore;
pub use keychain::KeychainStore;
pub use memory::MemoryStore;

use anyhow::Result;

/// Plain-partition key holding the active account's user id.
pub const ACTIVE_USER_KEY: &str = "active_user_id";

/// Plain-partition key holding the serialized session list.
pub const SESSION_LIST_KEY: &str = "session_list";

/// Secure-partition key for one account's credential.
pub fn credential_key(user_id: &str) -> String {
    format!("credential.{user_id}")
}

/// Durable string key/value storage. Implementations must be callable
/// from concurrent tasks; values are opaque to the store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}
