use armada_common::{ArmadaError, DeployMethod, Result, MIN_MEMORY};

use crate::strategy::divide;
use crate::{sort_by_name, NodeInfo};

/// Memory-priority placement: bound each node's capacity by free memory and
/// storage, then spread `count` replicas with the chosen method. CPU stays
/// shared, so it does not constrain capacity here.
pub fn select_memory_nodes(
    mut nodes: Vec<NodeInfo>,
    memory: i64,
    storage: i64,
    count: usize,
    method: DeployMethod,
) -> Result<Vec<NodeInfo>> {
    if memory < MIN_MEMORY {
        return Err(ArmadaError::BadMemory(memory));
    }
    if nodes.is_empty() {
        return Err(ArmadaError::NoNodes);
    }
    sort_by_name(&mut nodes);

    for node in nodes.iter_mut() {
        let by_memory = (node.memory / memory).max(0) as usize;
        let by_storage = if storage > 0 {
            (node.storage / storage).max(0) as usize
        } else {
            usize::MAX
        };
        node.capacity = by_memory.min(by_storage);
    }
    nodes.retain(|n| n.capacity > 0);

    divide(nodes, count, method)
}
