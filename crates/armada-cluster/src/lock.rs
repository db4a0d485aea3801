use std::collections::{BTreeMap, HashMap};

use armada_common::{ArmadaError, Container, Node, Result};
use armada_meta::DistributedLock;

use crate::Cluster;

/// Candidate nodes with their locks held. Locks were acquired in ascending
/// lock-name order; dropping the guard releases them (best effort), an
/// explicit [`LockedNodes::unlock`] releases them deterministically.
pub(crate) struct LockedNodes {
    pub nodes: BTreeMap<String, Node>,
    locks: Vec<DistributedLock>,
}

impl LockedNodes {
    pub async fn unlock(self) {
        for lock in self.locks.into_iter().rev() {
            if let Err(e) = lock.unlock().await {
                tracing::warn!(error=%e, "releasing node lock failed");
            }
        }
    }
}

/// Containers with their container- and node-locks held.
pub(crate) struct LockedContainers {
    pub containers: BTreeMap<String, Container>,
    locks: Vec<DistributedLock>,
}

impl LockedContainers {
    pub async fn unlock(self) {
        for lock in self.locks.into_iter().rev() {
            if let Err(e) = lock.unlock().await {
                tracing::warn!(error=%e, "releasing container lock failed");
            }
        }
    }
}

pub(crate) fn node_lock_name(podname: &str, nodename: &str) -> String {
    format!("node/{podname}/{nodename}")
}

pub(crate) fn container_lock_name(id: &str) -> String {
    format!("container/{id}")
}

impl Cluster {
    /// Lock every node matching the selector. Acquisition walks the sorted
    /// node names, so overlapping deployments always contend in the same
    /// order. If any acquisition fails, already-held locks are released
    /// (through guard drop) and the error propagates; node snapshots are
    /// re-read under their lock.
    pub(crate) async fn lock_nodes(
        &self,
        podname: &str,
        nodename: Option<&str>,
        labels: &HashMap<String, String>,
        all: bool,
    ) -> Result<LockedNodes> {
        let candidates = self.store.get_nodes(podname, nodename, labels, all).await?;
        if candidates.is_empty() {
            return Err(ArmadaError::NoNodes);
        }

        let mut locks = Vec::with_capacity(candidates.len());
        let mut nodes = BTreeMap::new();
        for candidate in &candidates {
            let lock = self
                .store
                .create_lock(&node_lock_name(podname, &candidate.name))
                .await?;
            locks.push(lock);
            let fresh = self.store.get_node(&candidate.name).await?;
            nodes.insert(fresh.name.clone(), fresh);
        }
        Ok(LockedNodes { nodes, locks })
    }

    /// Lock a set of containers and the nodes they run on, in ascending
    /// lock-name order (all container locks sort before node locks).
    pub(crate) async fn lock_containers(&self, ids: &[String]) -> Result<LockedContainers> {
        let mut sorted: Vec<String> = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut locks = Vec::new();
        let mut containers = BTreeMap::new();
        for id in &sorted {
            let container = self.store.get_container(id).await?;
            locks.push(self.store.create_lock(&container_lock_name(id)).await?);
            containers.insert(id.clone(), container);
        }

        let mut node_names: Vec<(String, String)> = containers
            .values()
            .map(|c| (c.podname.clone(), c.nodename.clone()))
            .collect();
        node_names.sort();
        node_names.dedup();
        for (podname, nodename) in &node_names {
            locks.push(
                self.store
                    .create_lock(&node_lock_name(podname, nodename))
                    .await?,
            );
        }

        Ok(LockedContainers { containers, locks })
    }
}
