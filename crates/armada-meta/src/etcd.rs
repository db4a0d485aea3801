use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, LockOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio_stream::wrappers::ReceiverStream;

use crate::kv::{LockToken, MetaStore, WatchEvent, WatchStream};

/// etcd-backed [`MetaStore`]. The client multiplexes over one gRPC channel,
/// so clones per operation are cheap; nothing here holds a client across an
/// await on another session's progress.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self { client })
    }

    fn ttl_secs(ttl_ms: u64) -> i64 {
        ((ttl_ms as f64 / 1000.0).ceil() as i64).max(1)
    }
}

#[async_trait]
impl MetaStore for EtcdStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64> {
        let mut cli = self.client.clone();

        let mut opts = PutOptions::new();
        if let Some(ttl_ms) = ttl_ms {
            let lease = cli.lease_grant(Self::ttl_secs(ttl_ms), None).await?;
            opts = opts.with_lease(lease.id());
        }

        let resp = cli.put(key, value, Some(opts)).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default() as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let mut cli = self.client.clone();
        let resp = cli.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut cli = self.client.clone();
        let resp = cli.delete(key, None).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default() as u64)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let mut cli = self.client.clone();
        let resp = cli.get(prefix, Some(GetOptions::new().with_prefix())).await?;

        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            out.push((
                String::from_utf8_lossy(kv.key()).to_string(),
                kv.value().to_vec(),
                kv.mod_revision() as u64,
            ));
        }
        Ok(out)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let mut cli = self.client.clone();

        // mod_revision of an absent key compares as 0, which gives
        // create-if-absent semantics for expected_revision == 0.
        let cmp = Compare::mod_revision(key, CompareOp::Equal, expected_revision as i64);
        let put = TxnOp::put(key, value, None);
        let txn = Txn::new().when([cmp]).and_then([put]).or_else([]);
        let resp = cli.txn(txn).await?;

        if resp.succeeded() {
            return Ok((true, resp.header().map(|h| h.revision()).unwrap_or_default() as u64));
        }

        let current = cli.get(key, None).await?;
        let current_rev = current
            .kvs()
            .first()
            .map(|kv| kv.mod_revision() as u64)
            .unwrap_or(0);
        Ok((false, current_rev))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream> {
        let mut cli = self.client.clone();

        let mut opts = WatchOptions::new().with_prefix();
        if let Some(min_rev) = start_revision_exclusive {
            // etcd's start revision is inclusive; +1 for exclusive semantics
            opts = opts.with_start_revision(min_rev.saturating_add(1) as i64);
        }

        let (_watcher, mut stream) = cli.watch(prefix, Some(opts)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<WatchEvent>(1024);
        tokio::spawn(async move {
            // keep _watcher alive for the duration of the forwarder
            let _watcher = _watcher;
            while let Some(item) = stream.message().await.transpose() {
                let resp = match item {
                    Ok(r) => r,
                    Err(_) => return,
                };
                for ev in resp.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let key = String::from_utf8_lossy(kv.key()).to_string();
                    let value = match ev.event_type() {
                        EventType::Put => Some(kv.value().to_vec()),
                        EventType::Delete => None,
                    };
                    let sent = tx
                        .send(WatchEvent {
                            key,
                            value,
                            revision: kv.mod_revision() as u64,
                        })
                        .await;
                    if sent.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn lock(
        &self,
        name: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Option<LockToken>> {
        let mut cli = self.client.clone();

        let ttl_secs = (ttl.as_secs() as i64).max(1);
        let lease = cli.lease_grant(ttl_secs, None).await?;
        let lease_id = lease.id();

        let locked = tokio::time::timeout(
            timeout,
            cli.lock(name, Some(LockOptions::new().with_lease(lease_id))),
        )
        .await;

        let resp = match locked {
            Ok(r) => r?,
            Err(_) => {
                let _ = cli.lease_revoke(lease_id).await;
                return Ok(None);
            }
        };

        // Renew the lease at ttl/3 while the lock is held; revoking the
        // lease on unlock errors the keeper and ends the task.
        let (mut keeper, mut responses) = cli.lease_keep_alive(lease_id).await?;
        let interval = Duration::from_secs((ttl.as_secs() / 3).max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if keeper.keep_alive().await.is_err() {
                    return;
                }
                match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    _ => return,
                }
            }
        });

        Ok(Some(LockToken {
            name: name.to_string(),
            key: resp.key().to_vec(),
            lease: lease_id,
        }))
    }

    async fn unlock(&self, token: &LockToken) -> Result<()> {
        let mut cli = self.client.clone();
        if let Err(e) = cli.unlock(token.key.clone()).await {
            // expired or already released: unlock stays idempotent
            tracing::debug!(name=%token.name, error=%e, "unlock on released lock");
        }
        let _ = cli.lease_revoke(token.lease).await;
        Ok(())
    }
}
