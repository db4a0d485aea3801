use std::collections::BTreeMap;

use armada_common::{ArmadaError, Result, VolumeBinding, VolumeMap};

use crate::NodeInfo;

/// Where one replica's scheduled volume requests land.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumePlan {
    /// binding destination → chosen node volume
    pub assignment: BTreeMap<String, String>,
    /// aggregate bytes claimed per node volume
    pub usage: VolumeMap,
}

/// Carve per-replica volume plans for nodes that already carry a `deploy`
/// count. Only bindings that request scheduling participate; host-path
/// binds pass through untouched. Best fit: the tightest volume that still
/// holds the request, ties on volume name.
pub fn select_volume_nodes(
    nodes: &[NodeInfo],
    bindings: &[VolumeBinding],
) -> Result<(BTreeMap<String, Vec<VolumePlan>>, BTreeMap<String, VolumeMap>)> {
    let mut plan: BTreeMap<String, Vec<VolumePlan>> = BTreeMap::new();
    let mut changed: BTreeMap<String, VolumeMap> = BTreeMap::new();

    let scheduled: Vec<&VolumeBinding> =
        bindings.iter().filter(|b| b.requires_schedule()).collect();
    if scheduled.is_empty() {
        return Ok((plan, changed));
    }

    for node in nodes.iter().filter(|n| n.deploy > 0) {
        let mut free = node.volume.clone();
        let mut plans = Vec::with_capacity(node.deploy);
        for _ in 0..node.deploy {
            let mut replica = VolumePlan::default();
            for binding in &scheduled {
                let picked = free
                    .0
                    .iter()
                    .filter(|(_, avail)| **avail >= binding.size)
                    .min_by_key(|(name, avail)| (**avail, (*name).clone()))
                    .map(|(name, _)| name.clone());
                let Some(volume) = picked else {
                    return Err(ArmadaError::InsufficientRes(format!(
                        "node {} has no volume with {} bytes free for {}",
                        node.name, binding.size, binding.dst
                    )));
                };
                if let Some(avail) = free.0.get_mut(&volume) {
                    *avail -= binding.size;
                }
                replica.assignment.insert(binding.dst.clone(), volume.clone());
                *replica.usage.0.entry(volume).or_insert(0) += binding.size;
            }
            plans.push(replica);
        }

        let mut node_changed = VolumeMap::new();
        for replica in &plans {
            node_changed.add(&replica.usage);
        }
        changed.insert(node.name.clone(), node_changed);
        plan.insert(node.name.clone(), plans);
    }

    Ok((plan, changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use armada_common::CpuMap;

    fn vols(pairs: &[(&str, i64)]) -> VolumeMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn info(name: &str, volume: VolumeMap, deploy: usize) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            cpu: CpuMap::new(),
            memory: 0,
            storage: i64::MAX,
            volume,
            numa: HashMap::new(),
            count: 0,
            deploy,
            capacity: deploy,
        }
    }

    fn auto_binding(dst: &str, size: i64) -> VolumeBinding {
        VolumeBinding {
            src: "AUTO".to_string(),
            dst: dst.to_string(),
            flags: "rw".to_string(),
            size,
        }
    }

    #[test]
    fn test_host_binds_skip_scheduling() {
        let nodes = vec![info("a", vols(&[("vol0", 100)]), 2)];
        let bindings = vec![VolumeBinding::parse("/host:/data:rw").unwrap()];
        let (plan, changed) = select_volume_nodes(&nodes, &bindings).unwrap();
        assert!(plan.is_empty());
        assert!(changed.is_empty());
    }

    #[test]
    fn test_best_fit_prefers_tightest_volume() {
        let nodes = vec![info("a", vols(&[("big", 1000), ("small", 100)]), 1)];
        let (plan, changed) = select_volume_nodes(&nodes, &[auto_binding("/data", 80)]).unwrap();
        let replica = &plan["a"][0];
        assert_eq!(replica.assignment["/data"], "small");
        assert_eq!(changed["a"], vols(&[("small", 80)]));
    }

    #[test]
    fn test_replicas_spill_to_next_volume() {
        let nodes = vec![info("a", vols(&[("v0", 200), ("v1", 100)]), 3)];
        let (plan, changed) = select_volume_nodes(&nodes, &[auto_binding("/data", 60)]).unwrap();
        let assigned: Vec<&str> = plan["a"]
            .iter()
            .map(|p| p.assignment["/data"].as_str())
            .collect();
        // v1 is the tighter fit first, then it runs dry and v0 serves the rest
        assert_eq!(assigned, vec!["v1", "v0", "v0"]);
        assert_eq!(changed["a"], vols(&[("v0", 120), ("v1", 60)]));
    }

    #[test]
    fn test_insufficient_volume() {
        let nodes = vec![info("a", vols(&[("v0", 100)]), 2)];
        assert!(matches!(
            select_volume_nodes(&nodes, &[auto_binding("/data", 60)]),
            Err(ArmadaError::InsufficientRes(_))
        ));
    }
}
