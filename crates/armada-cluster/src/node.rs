use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use armada_common::{ArmadaError, CpuMap, Node, Result, VolumeMap, SHARE_BASE};

use crate::lock::node_lock_name;
use crate::Cluster;

/// Registration data for a new node. Either a full `cpu` map or a core
/// count; with a count, ids `0..cores` each get a full share base.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddNodeOptions {
    pub name: String,
    pub endpoint: String,
    pub podname: String,
    #[serde(default)]
    pub cpu: CpuMap,
    #[serde(default)]
    pub cores: usize,
    pub memory: i64,
    #[serde(default)]
    pub storage: i64,
    #[serde(default)]
    pub volume: VolumeMap,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub numa: HashMap<String, String>,
    #[serde(default)]
    pub numa_memory: HashMap<String, i64>,
}

impl Cluster {
    /// Register a node with its full capacity free.
    pub async fn add_node(&self, opts: AddNodeOptions) -> Result<Node> {
        self.store.get_pod(&opts.podname).await?;

        let cpu = if !opts.cpu.is_empty() {
            opts.cpu
        } else {
            (0..opts.cores)
                .map(|i| (i.to_string(), SHARE_BASE))
                .collect()
        };
        let node = Node {
            name: opts.name,
            endpoint: opts.endpoint,
            podname: opts.podname,
            cpu: cpu.clone(),
            cpu_used: 0.0,
            init_cpu: cpu,
            mem_cap: opts.memory,
            init_mem: opts.memory,
            storage_cap: opts.storage,
            init_storage: opts.storage,
            volume: opts.volume.clone(),
            init_volume: opts.volume,
            numa: opts.numa,
            numa_memory: opts.numa_memory,
            labels: opts.labels,
            available: true,
        };
        self.store.add_node(&node).await?;
        Ok(node)
    }

    /// A node leaves only once nothing runs on it.
    pub async fn remove_node(&self, nodename: &str) -> Result<()> {
        let node = self.store.get_node(nodename).await?;
        let lock = self
            .store
            .create_lock(&node_lock_name(&node.podname, nodename))
            .await?;

        let result = async {
            let containers = self.store.list_node_containers(nodename).await?;
            if !containers.is_empty() {
                return Err(ArmadaError::NodeNotEmpty(nodename.to_string()));
            }
            self.store.remove_node(nodename).await
        }
        .await;

        if let Err(e) = lock.unlock().await {
            tracing::warn!(node = nodename, error = %e, "releasing node lock failed");
        }
        result
    }

    pub async fn get_node(&self, nodename: &str) -> Result<Node> {
        self.store.get_node(nodename).await
    }

    pub async fn list_pod_nodes(&self, podname: &str, all: bool) -> Result<Vec<Node>> {
        self.store.get_nodes(podname, None, &HashMap::new(), all).await
    }

    /// Flip a node in or out of the scheduling pool.
    pub async fn set_node_availability(&self, nodename: &str, available: bool) -> Result<Node> {
        let node = self.store.get_node(nodename).await?;
        let lock = self
            .store
            .create_lock(&node_lock_name(&node.podname, nodename))
            .await?;

        let result = async {
            let mut fresh = self.store.get_node(nodename).await?;
            fresh.available = available;
            self.store.update_node(&fresh).await?;
            Ok(fresh)
        }
        .await;

        if let Err(e) = lock.unlock().await {
            tracing::warn!(node = nodename, error = %e, "releasing node lock failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_common::SchedulerMode;
    use tokio_stream::StreamExt;

    use crate::testutil::{deploy_opts, seed_pod, test_cluster, test_node, GIB};

    fn add_opts(name: &str) -> AddNodeOptions {
        AddNodeOptions {
            name: name.to_string(),
            endpoint: "tcp://10.0.0.9:2376".to_string(),
            podname: "p1".to_string(),
            cores: 4,
            memory: 8 * GIB,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_node_synthesizes_cpu_map() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[]).await;

        let node = cluster.add_node(add_opts("n1")).await.unwrap();
        assert_eq!(node.cpu.0.len(), 4);
        assert_eq!(node.cpu.total(), 40);
        assert_eq!(node.init_cpu, node.cpu);
        assert!(node.available);

        // pod must exist
        let mut orphan = add_opts("n2");
        orphan.podname = "ghost".to_string();
        assert!(cluster.add_node(orphan).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_node_refuses_with_containers() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;

        let stream = cluster.create_container(deploy_opts("p1", 1)).await.unwrap();
        let created: Vec<_> = stream.collect().await;
        assert!(created[0].success);

        assert!(matches!(
            cluster.remove_node("a").await,
            Err(ArmadaError::NodeNotEmpty(_))
        ));

        let stream = cluster
            .remove_container(vec![created[0].id.clone()], false)
            .await
            .unwrap();
        let _: Vec<_> = stream.collect().await;
        cluster.remove_node("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_node_availability() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;

        let node = cluster.set_node_availability("a", false).await.unwrap();
        assert!(!node.available);
        assert_eq!(cluster.list_pod_nodes("p1", false).await.unwrap().len(), 0);
        assert_eq!(cluster.list_pod_nodes("p1", true).await.unwrap().len(), 1);

        cluster.set_node_availability("a", true).await.unwrap();
        assert_eq!(cluster.list_pod_nodes("p1", false).await.unwrap().len(), 1);
    }
}
