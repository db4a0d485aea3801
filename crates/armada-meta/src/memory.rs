use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::kv::{LockToken, MetaStore, WatchEvent, WatchStream};

/// In-process [`MetaStore`] twin. Backs tests and single-node development;
/// revisions, CAS and watch semantics mirror the etcd implementation.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
    locks: HashMap<String, Held>,
    next_lease: i64,
}

#[derive(Debug)]
struct Held {
    lease: i64,
    deadline: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    fn bump(inner: &mut Inner) -> u64 {
        inner.revision = inner.revision.saturating_add(1);
        inner.revision
    }

    fn emit(&self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }

    /// Renew the lease at ttl/3 while the lock is held, matching the etcd
    /// behavior. The task ends once the lease is released or replaced.
    fn spawn_keepalive(&self, name: String, lease: i64, ttl: Duration) {
        let inner = self.inner.clone();
        let interval = (ttl / 3).max(Duration::from_millis(5));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let mut guard = inner.write().await;
                match guard.locks.get_mut(&name) {
                    Some(held) if held.lease == lease => {
                        held.deadline = Instant::now() + ttl;
                    }
                    _ => return,
                }
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>, _ttl_ms: Option<u64>) -> Result<u64> {
        let (rev, event) = {
            let mut inner = self.inner.write().await;
            let rev = Self::bump(&mut inner);
            inner.kv.insert(key.to_string(), (value.clone(), rev));
            (
                rev,
                WatchEvent {
                    key: key.to_string(),
                    value: Some(value),
                    revision: rev,
                },
            )
        };
        self.emit(event);
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let (rev, existed) = {
            let mut inner = self.inner.write().await;
            let existed = inner.kv.remove(key).is_some();
            let rev = Self::bump(&mut inner);
            (rev, existed)
        };
        if existed {
            self.emit(WatchEvent {
                key: key.to_string(),
                value: None,
                revision: rev,
            });
        }
        Ok(rev)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| (k.clone(), v.clone(), *rev))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let (rev, event) = {
            let mut inner = self.inner.write().await;
            let current_rev = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
            if current_rev != expected_revision {
                return Ok((false, current_rev));
            }
            let rev = Self::bump(&mut inner);
            inner.kv.insert(key.to_string(), (value.clone(), rev));
            (
                rev,
                WatchEvent {
                    key: key.to_string(),
                    value: Some(value),
                    revision: rev,
                },
            )
        };
        self.emit(event);
        Ok((true, rev))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream> {
        let prefix = prefix.to_string();
        let min_rev = start_revision_exclusive.unwrap_or(0);
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
            Ok(ev) if ev.revision > min_rev && ev.key.starts_with(&prefix) => Some(ev),
            _ => None,
        });
        Ok(Box::pin(stream))
    }

    async fn lock(
        &self,
        name: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Option<LockToken>> {
        let deadline = Instant::now() + timeout;
        loop {
            let acquired = {
                let mut inner = self.inner.write().await;
                let now = Instant::now();
                let free = match inner.locks.get(name) {
                    None => true,
                    // only a holder whose keepalive died lets the TTL lapse
                    Some(held) => held.deadline <= now,
                };
                if free {
                    inner.next_lease += 1;
                    let lease = inner.next_lease;
                    inner.locks.insert(
                        name.to_string(),
                        Held {
                            lease,
                            deadline: now + ttl,
                        },
                    );
                    Some(lease)
                } else {
                    None
                }
            };

            if let Some(lease) = acquired {
                self.spawn_keepalive(name.to_string(), lease, ttl);
                return Ok(Some(LockToken {
                    name: name.to_string(),
                    key: name.as_bytes().to_vec(),
                    lease,
                }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn unlock(&self, token: &LockToken) -> Result<()> {
        let mut inner = self.inner.write().await;
        // only the current holder may release; stale or repeated unlocks
        // succeed without touching a newer holder
        if let Some(held) = inner.locks.get(&token.name) {
            if held.lease == token.lease {
                inner.locks.remove(&token.name);
            }
        }
        Ok(())
    }
}
