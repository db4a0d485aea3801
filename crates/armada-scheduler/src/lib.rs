//! Pure placement planning. Planners never touch node state; they take
//! snapshots, return plans, and the orchestrator applies the deltas.

pub mod cpu;
pub mod memory;
pub mod strategy;
pub mod volume;

use std::collections::{BTreeMap, HashMap};

use rand::Rng;

use armada_common::{ArmadaError, CpuMap, Node, Result, VolumeMap};

pub use cpu::select_cpu_nodes;
pub use memory::select_memory_nodes;
pub use volume::{select_volume_nodes, VolumePlan};

/// Planner-local projection of a node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub cpu: CpuMap,
    /// free bytes
    pub memory: i64,
    /// free bytes; `i64::MAX` when the node does not account storage
    pub storage: i64,
    pub volume: VolumeMap,
    /// cpu id → numa node
    pub numa: HashMap<String, String>,
    /// replicas of the planned app already on this node
    pub count: usize,
    /// filled by the planner: replicas this plan assigns
    pub deploy: usize,
    /// filled by the planner: upper bound derived from free resources
    pub capacity: usize,
}

impl NodeInfo {
    pub fn new(node: &Node, count: usize) -> Self {
        Self {
            name: node.name.clone(),
            cpu: node.cpu.clone(),
            memory: node.mem_cap,
            storage: node.storage_free(),
            volume: node.volume.clone(),
            numa: node.numa.clone(),
            count,
            deploy: 0,
            capacity: 0,
        }
    }
}

/// Sort planner inputs by node name so plans are a pure function of the
/// node set.
pub(crate) fn sort_by_name(nodes: &mut [NodeInfo]) {
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
}

/// Uniform pick among nodes with free CPU; the build path uses this to
/// spread image builds.
pub fn random_node(nodes: &BTreeMap<String, CpuMap>) -> Result<String> {
    if nodes.is_empty() {
        return Err(ArmadaError::NoNodes);
    }
    let candidates: Vec<&String> = nodes
        .iter()
        .filter(|(_, cpu)| cpu.total() > 0)
        .map(|(name, _)| name)
        .collect();
    if candidates.is_empty() {
        return Err(ArmadaError::NoNodes);
    }
    let picked = candidates[rand::thread_rng().gen_range(0..candidates.len())];
    Ok(picked.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpus(pairs: &[(&str, i64)]) -> CpuMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_random_node() {
        assert!(matches!(
            random_node(&BTreeMap::new()),
            Err(ArmadaError::NoNodes)
        ));

        let mut nodes = BTreeMap::new();
        nodes.insert("node1".to_string(), cpus(&[("0", 10), ("1", 10)]));
        nodes.insert("node2".to_string(), cpus(&[("0", 10), ("1", 10)]));
        let picked = random_node(&nodes).unwrap();
        assert!(picked == "node1" || picked == "node2");

        let mut nodes = BTreeMap::new();
        nodes.insert("node1".to_string(), cpus(&[("0", 10)]));
        assert_eq!(random_node(&nodes).unwrap(), "node1");

        // exhausted nodes are not candidates
        let mut nodes = BTreeMap::new();
        nodes.insert("node1".to_string(), cpus(&[("0", 0)]));
        assert!(matches!(random_node(&nodes), Err(ArmadaError::NoNodes)));
    }
}
