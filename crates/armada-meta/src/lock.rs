use std::sync::Arc;

use armada_common::Result;

use crate::kv::{LockToken, MetaStore};

/// A held distributed lock. Explicitly release with [`DistributedLock::unlock`];
/// dropping a still-held guard spawns a best-effort release so error and
/// panic paths do not leave the name locked until TTL expiry.
pub struct DistributedLock {
    kv: Arc<dyn MetaStore>,
    token: Option<LockToken>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("token", &self.token)
            .finish()
    }
}

impl DistributedLock {
    pub(crate) fn new(kv: Arc<dyn MetaStore>, token: LockToken) -> Self {
        Self {
            kv,
            token: Some(token),
        }
    }

    pub fn name(&self) -> &str {
        self.token.as_ref().map(|t| t.name.as_str()).unwrap_or("")
    }

    /// Idempotent: releasing a lock whose TTL already expired is a success.
    pub async fn unlock(mut self) -> Result<()> {
        if let Some(token) = self.token.take() {
            self.kv.unlock(&token).await?;
        }
        Ok(())
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else { return };
        let kv = self.kv.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = kv.unlock(&token).await {
                    tracing::warn!(name=%token.name, error=%e, "releasing dropped lock failed");
                }
            });
        }
        // without a runtime the TTL reclaims the lock
    }
}
