use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;

/// A single key change observed on a watched prefix. `value` is `None` for
/// deletions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Proof of lock ownership, handed back to [`MetaStore::unlock`].
#[derive(Debug, Clone)]
pub struct LockToken {
    pub name: String,
    pub key: Vec<u8>,
    pub lease: i64,
}

/// Key/value backend with linearizable single-key writes, prefix scans and
/// watches, and lease-based mutual exclusion.
///
/// Two implementations: [`crate::EtcdStore`] for real clusters and
/// [`crate::MemoryStore`] as an in-process twin for tests and development.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Write a key, optionally attached to a lease of `ttl_ms`. Returns the
    /// store revision of the write.
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64>;

    /// Read a key; `None` when absent. The revision is the key's last
    /// modification revision, usable with [`MetaStore::compare_and_swap`].
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;

    async fn delete(&self, key: &str) -> Result<u64>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;

    /// Write `value` only if the key's modification revision still equals
    /// `expected_revision`. An expected revision of 0 means "create only if
    /// absent". Returns `(succeeded, current revision)`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)>;

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream>;

    /// Block up to `timeout` acquiring the named lock with the given TTL.
    /// `Ok(None)` means the deadline passed without acquisition. While held,
    /// the backing lease is kept alive; if the holder dies the TTL reclaims
    /// the lock.
    async fn lock(&self, name: &str, ttl: Duration, timeout: Duration)
        -> Result<Option<LockToken>>;

    /// Release a held lock. Unlocking an already-expired or already-released
    /// lock is a success.
    async fn unlock(&self, token: &LockToken) -> Result<()>;
}
