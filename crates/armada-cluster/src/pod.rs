use std::collections::HashMap;

use serde::Serialize;

use armada_common::{ArmadaError, Pod, Result, SchedulerMode};

use crate::Cluster;

/// Per-node usage ratios inside a pod, for the resource report.
#[derive(Debug, Clone, Serialize)]
pub struct NodeResource {
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub storage_percent: f64,
    pub volume_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PodResource {
    pub name: String,
    pub nodes: Vec<NodeResource>,
}

impl Cluster {
    pub async fn add_pod(&self, name: &str, desc: &str, scheduler: SchedulerMode) -> Result<Pod> {
        if name.is_empty() {
            return Err(ArmadaError::not_found("pod", name));
        }
        self.store.add_pod(name, desc, scheduler).await
    }

    /// Removal needs the pod to be empty; a pod that still owns nodes is
    /// reported, not drained.
    pub async fn remove_pod(&self, name: &str) -> Result<()> {
        self.store.get_pod(name).await?;
        let nodes = self.store.get_nodes(name, None, &HashMap::new(), true).await?;
        if !nodes.is_empty() {
            return Err(ArmadaError::PodNotEmpty(name.to_string()));
        }
        self.store.remove_pod(name).await
    }

    pub async fn get_pod(&self, name: &str) -> Result<Pod> {
        self.store.get_pod(name).await
    }

    pub async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.store.list_pods().await
    }

    pub async fn pod_resource(&self, name: &str) -> Result<PodResource> {
        self.store.get_pod(name).await?;
        let nodes = self.store.get_nodes(name, None, &HashMap::new(), true).await?;
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            let cores = node.init_cpu.0.len() as f64;
            out.push(NodeResource {
                name: node.name.clone(),
                cpu_percent: if cores > 0.0 { node.cpu_used / cores } else { 0.0 },
                memory_percent: ratio(node.memory_used(), node.init_mem),
                storage_percent: ratio(node.storage_used(), node.init_storage),
                volume_percent: ratio(
                    node.init_volume.total() - node.volume.total(),
                    node.init_volume.total(),
                ),
            });
        }
        Ok(PodResource {
            name: name.to_string(),
            nodes: out,
        })
    }
}

fn ratio(used: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        used as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::{seed_pod, test_cluster, test_node};

    #[tokio::test]
    async fn test_pod_lifecycle() {
        let (cluster, _, _) = test_cluster();
        cluster.add_pod("p1", "primary", SchedulerMode::Memory).await.unwrap();
        assert!(cluster.add_pod("p1", "", SchedulerMode::Memory).await.is_err());

        let pods = cluster.list_pods().await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].desc, "primary");

        cluster.remove_pod("p1").await.unwrap();
        assert!(cluster.get_pod("p1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_pod_refuses_with_nodes() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;

        assert!(matches!(
            cluster.remove_pod("p1").await,
            Err(ArmadaError::PodNotEmpty(_))
        ));

        store.remove_node("a").await.unwrap();
        cluster.remove_pod("p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_pod_resource_ratios() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;

        let delta = armada_common::ResourceDelta {
            memory: 2 * crate::testutil::GIB,
            quota: 1.0,
            ..Default::default()
        };
        store
            .update_node_resource("a", &delta, armada_common::ResourceOp::Sub)
            .await
            .unwrap();

        let report = cluster.pod_resource("p1").await.unwrap();
        assert_eq!(report.nodes.len(), 1);
        let node = &report.nodes[0];
        assert!((node.memory_percent - 0.25).abs() < 1e-9);
        assert!((node.cpu_percent - 0.5).abs() < 1e-9);
    }
}
