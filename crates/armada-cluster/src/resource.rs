use std::collections::BTreeMap;

use armada_common::{CpuMap, DeployOptions, ResourceDelta, ResourceOp, Result, SchedulerMode};
use armada_scheduler::{
    select_cpu_nodes, select_memory_nodes, select_volume_nodes, NodeInfo, VolumePlan,
};

use crate::lock::LockedNodes;
use crate::Cluster;

/// One replica's claim: the cpu ids it pins, where its scheduled volumes
/// land, and the store delta that moves the whole slice.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReplicaSlice {
    pub cpu: CpuMap,
    pub volume: VolumePlan,
    pub delta: ResourceDelta,
}

/// node name → its replicas, in creation order.
pub(crate) type DeployPlan = BTreeMap<String, Vec<ReplicaSlice>>;

pub(crate) fn plan_size(plan: &DeployPlan) -> usize {
    plan.values().map(Vec::len).sum()
}

impl Cluster {
    /// Pure planning over the locked node snapshots. Nothing is written;
    /// [`Cluster::commit_allocation`] applies the result.
    pub(crate) async fn plan_deployment(
        &self,
        locked: &LockedNodes,
        opts: &DeployOptions,
        mode: SchedulerMode,
    ) -> Result<DeployPlan> {
        let counts = self
            .store
            .count_deployed(&opts.name, &opts.entrypoint.name)
            .await?;
        let mut infos: Vec<NodeInfo> = locked
            .nodes
            .values()
            .map(|n| NodeInfo::new(n, counts.get(&n.name).copied().unwrap_or(0)))
            .collect();
        if opts.nodes_limit > 0 && infos.len() > opts.nodes_limit {
            infos.truncate(opts.nodes_limit);
        }

        let count = opts.count.max(1);
        let (deploys, cpu_plans) = match mode {
            SchedulerMode::CpuBind => {
                let (plan, _) = select_cpu_nodes(infos.clone(), opts.cpu_quota, opts.memory, count)?;
                let deploys: BTreeMap<String, usize> =
                    plan.iter().map(|(k, v)| (k.clone(), v.len())).collect();
                (deploys, plan)
            }
            SchedulerMode::Memory => {
                let planned =
                    select_memory_nodes(infos.clone(), opts.memory, opts.storage, count, opts.deploy_method)?;
                let deploys: BTreeMap<String, usize> = planned
                    .iter()
                    .map(|n| (n.name.clone(), n.deploy))
                    .collect();
                (deploys, BTreeMap::new())
            }
        };

        let mut selected: Vec<NodeInfo> = infos
            .into_iter()
            .filter(|n| deploys.contains_key(&n.name))
            .collect();
        for info in selected.iter_mut() {
            info.deploy = deploys[&info.name];
        }
        let (volume_plans, _) = select_volume_nodes(&selected, &opts.volumes)?;

        let mut plan: DeployPlan = BTreeMap::new();
        for info in &selected {
            let mut slices = Vec::with_capacity(info.deploy);
            for i in 0..info.deploy {
                let cpu = cpu_plans
                    .get(&info.name)
                    .and_then(|v| v.get(i))
                    .cloned()
                    .unwrap_or_default();
                let volume: VolumePlan = volume_plans
                    .get(&info.name)
                    .and_then(|v| v.get(i))
                    .cloned()
                    .unwrap_or_default();
                let delta = ResourceDelta {
                    cpu: cpu.clone(),
                    quota: opts.cpu_quota,
                    memory: opts.memory,
                    storage: opts.storage,
                    volume: volume.usage.clone(),
                };
                slices.push(ReplicaSlice { cpu, volume, delta });
            }
            plan.insert(info.name.clone(), slices);
        }
        Ok(plan)
    }

    /// Subtract every node's share of the plan from the store. A failing
    /// commit rolls the earlier ones back and aborts; nothing stays
    /// half-claimed.
    pub(crate) async fn commit_allocation(&self, plan: &DeployPlan) -> Result<()> {
        let mut committed: Vec<(String, ResourceDelta)> = Vec::new();
        for (nodename, slices) in plan {
            let mut aggregate = ResourceDelta::default();
            for slice in slices {
                merge_delta(&mut aggregate, &slice.delta);
            }
            match self
                .store
                .update_node_resource(nodename, &aggregate, ResourceOp::Sub)
                .await
            {
                Ok(_) => committed.push((nodename.clone(), aggregate)),
                Err(e) => {
                    for (name, delta) in committed.into_iter().rev() {
                        if let Err(re) = self
                            .store
                            .update_node_resource(&name, &delta, ResourceOp::Add)
                            .await
                        {
                            tracing::error!(node=%name, error=%re, "allocation rollback failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Give one replica's slice back to its node. Called exactly once per
    /// failed (or removed) replica; an all-zero delta skips the store write,
    /// which covers public hosts.
    pub(crate) async fn release_replica(&self, nodename: &str, delta: &ResourceDelta) {
        if delta.is_zero() {
            return;
        }
        if let Err(e) = self
            .store
            .update_node_resource(nodename, delta, ResourceOp::Add)
            .await
        {
            tracing::error!(node=%nodename, error=%e, "releasing replica resources failed");
        }
    }
}

pub(crate) fn merge_delta(into: &mut ResourceDelta, from: &ResourceDelta) {
    into.cpu.add(&from.cpu);
    into.quota += from.quota;
    into.memory += from.memory;
    into.storage += from.storage;
    into.volume.add(&from.volume);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use armada_common::ArmadaError;

    use crate::testutil::{deploy_opts, seed_pod, test_cluster, test_node, GIB};

    #[tokio::test]
    async fn test_plan_and_commit_memory_mode() {
        let (cluster, _, store) = test_cluster();
        seed_pod(
            &store,
            "p1",
            SchedulerMode::Memory,
            &[test_node("a", "p1", 8), test_node("b", "p1", 4)],
        )
        .await;

        let locked = cluster
            .lock_nodes("p1", None, &HashMap::new(), false)
            .await
            .unwrap();
        let opts = deploy_opts("p1", 6);
        let plan = cluster
            .plan_deployment(&locked, &opts, SchedulerMode::Memory)
            .await
            .unwrap();
        assert_eq!(plan["a"].len(), 4);
        assert_eq!(plan["b"].len(), 2);
        assert_eq!(plan_size(&plan), 6);

        cluster.commit_allocation(&plan).await.unwrap();
        locked.unlock().await;

        assert_eq!(store.get_node("a").await.unwrap().mem_cap, 4 * GIB);
        assert_eq!(store.get_node("b").await.unwrap().mem_cap, 2 * GIB);
    }

    #[tokio::test]
    async fn test_plan_insufficient_before_any_write() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 4)]).await;

        let locked = cluster
            .lock_nodes("p1", None, &HashMap::new(), false)
            .await
            .unwrap();
        let opts = deploy_opts("p1", 100);
        let err = cluster
            .plan_deployment(&locked, &opts, SchedulerMode::Memory)
            .await
            .unwrap_err();
        assert!(matches!(err, ArmadaError::InsufficientRes(_)));
        locked.unlock().await;

        assert_eq!(store.get_node("a").await.unwrap().mem_cap, 4 * GIB);
    }

    #[tokio::test]
    async fn test_release_replica_restores_capacity() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 4)]).await;

        let delta = ResourceDelta {
            memory: GIB,
            quota: 0.5,
            ..Default::default()
        };
        store
            .update_node_resource("a", &delta, ResourceOp::Sub)
            .await
            .unwrap();
        cluster.release_replica("a", &delta).await;

        let node = store.get_node("a").await.unwrap();
        assert_eq!(node.mem_cap, 4 * GIB);
        assert_eq!(node.cpu_used, 0.0);
    }

    #[tokio::test]
    async fn test_cpu_mode_plan_carries_pinned_cores() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::CpuBind, &[test_node("a", "p1", 8)]).await;

        let locked = cluster
            .lock_nodes("p1", None, &HashMap::new(), false)
            .await
            .unwrap();
        let mut opts = deploy_opts("p1", 3);
        opts.cpu_quota = 0.5;
        let plan = cluster
            .plan_deployment(&locked, &opts, SchedulerMode::CpuBind)
            .await
            .unwrap();
        locked.unlock().await;

        let slices = &plan["a"];
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].cpu.total(), 5);
        assert_eq!(slices[0].delta.memory, GIB);
    }
}
