use armada_common::{ArmadaError, DeployMethod, Result};

use crate::NodeInfo;

/// Distribute `count` replicas over capacity-annotated nodes.
///
/// Inputs arrive sorted by name with `capacity` set; the chosen method
/// fills `deploy`. All methods are deterministic: ties break on node name.
pub fn divide(nodes: Vec<NodeInfo>, count: usize, method: DeployMethod) -> Result<Vec<NodeInfo>> {
    match method {
        DeployMethod::Auto => divide_auto(nodes, count),
        DeployMethod::Fill => divide_fill(nodes, count),
        DeployMethod::Each => divide_each(nodes, count),
        DeployMethod::Global => divide_global(nodes, count),
    }
}

fn total_capacity(nodes: &[NodeInfo]) -> usize {
    nodes.iter().map(|n| n.capacity).sum()
}

fn insufficient(nodes: &[NodeInfo], count: usize) -> ArmadaError {
    ArmadaError::InsufficientRes(format!(
        "need {} replicas, cluster capacity is {}",
        count,
        total_capacity(nodes)
    ))
}

/// Keep per-node load balanced. Load is (existing + planned) replicas
/// normalized by capacity, so a roomy node absorbs proportionally more;
/// with equal capacities this degenerates to plain count balancing.
fn divide_auto(mut nodes: Vec<NodeInfo>, count: usize) -> Result<Vec<NodeInfo>> {
    if total_capacity(&nodes) < count {
        return Err(insufficient(&nodes, count));
    }
    for _ in 0..count {
        let next = nodes
            .iter_mut()
            .filter(|n| n.deploy < n.capacity)
            .min_by(|a, b| {
                let load_a = (a.count + a.deploy) as f64 / a.capacity as f64;
                let load_b = (b.count + b.deploy) as f64 / b.capacity as f64;
                load_a
                    .partial_cmp(&load_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.capacity.cmp(&a.capacity))
                    .then(a.name.cmp(&b.name))
            });
        match next {
            Some(node) => node.deploy += 1,
            None => return Err(insufficient(&nodes, count)),
        }
    }
    Ok(nodes.into_iter().filter(|n| n.deploy > 0).collect())
}

/// Bring every node up to `count` total replicas of the app.
fn divide_fill(mut nodes: Vec<NodeInfo>, count: usize) -> Result<Vec<NodeInfo>> {
    for node in nodes.iter_mut() {
        let need = count.saturating_sub(node.count);
        if need > node.capacity {
            return Err(ArmadaError::InsufficientRes(format!(
                "node {} cannot reach {} replicas: {} running, capacity {}",
                node.name, count, node.count, node.capacity
            )));
        }
        node.deploy = need;
    }
    Ok(nodes.into_iter().filter(|n| n.deploy > 0).collect())
}

/// Exactly `count` new replicas on every node.
fn divide_each(mut nodes: Vec<NodeInfo>, count: usize) -> Result<Vec<NodeInfo>> {
    for node in nodes.iter_mut() {
        if count > node.capacity {
            return Err(ArmadaError::InsufficientRes(format!(
                "node {} cannot hold {} replicas, capacity {}",
                node.name, count, node.capacity
            )));
        }
        node.deploy = count;
    }
    Ok(nodes.into_iter().filter(|n| n.deploy > 0).collect())
}

/// Spread proportional to remaining capacity, largest remainder first.
fn divide_global(mut nodes: Vec<NodeInfo>, count: usize) -> Result<Vec<NodeInfo>> {
    let total = total_capacity(&nodes);
    if total < count {
        return Err(insufficient(&nodes, count));
    }
    if total == 0 {
        return Ok(Vec::new());
    }

    for node in nodes.iter_mut() {
        node.deploy = count * node.capacity / total;
    }
    let assigned: usize = nodes.iter().map(|n| n.deploy).sum();
    let mut leftover = count - assigned;

    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by(|&a, &b| {
        let rem_a = count * nodes[a].capacity % total;
        let rem_b = count * nodes[b].capacity % total;
        rem_b.cmp(&rem_a).then(nodes[a].name.cmp(&nodes[b].name))
    });
    for idx in order {
        if leftover == 0 {
            break;
        }
        if nodes[idx].deploy < nodes[idx].capacity {
            nodes[idx].deploy += 1;
            leftover -= 1;
        }
    }
    if leftover > 0 {
        return Err(insufficient(&nodes, count));
    }
    Ok(nodes.into_iter().filter(|n| n.deploy > 0).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use armada_common::{CpuMap, VolumeMap};

    fn info(name: &str, count: usize, capacity: usize) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            cpu: CpuMap::new(),
            memory: 0,
            storage: i64::MAX,
            volume: VolumeMap::new(),
            numa: HashMap::new(),
            count,
            deploy: 0,
            capacity,
        }
    }

    fn plan(nodes: &[NodeInfo]) -> Vec<(&str, usize)> {
        nodes.iter().map(|n| (n.name.as_str(), n.deploy)).collect()
    }

    #[test]
    fn test_auto_balances_equal_nodes() {
        let nodes = vec![info("a", 0, 10), info("b", 0, 10)];
        let got = divide(nodes, 4, DeployMethod::Auto).unwrap();
        assert_eq!(plan(&got), vec![("a", 2), ("b", 2)]);
    }

    #[test]
    fn test_auto_considers_existing_load() {
        let nodes = vec![info("a", 3, 10), info("b", 0, 10)];
        let got = divide(nodes, 3, DeployMethod::Auto).unwrap();
        assert_eq!(plan(&got), vec![("b", 3)]);
    }

    #[test]
    fn test_auto_weighs_capacity() {
        // 8 GiB and 4 GiB worth of room should split 4/2
        let nodes = vec![info("a", 0, 8), info("b", 0, 4)];
        let got = divide(nodes, 6, DeployMethod::Auto).unwrap();
        assert_eq!(plan(&got), vec![("a", 4), ("b", 2)]);
    }

    #[test]
    fn test_auto_insufficient() {
        let nodes = vec![info("a", 0, 5), info("b", 0, 5)];
        assert!(matches!(
            divide(nodes, 100, DeployMethod::Auto),
            Err(ArmadaError::InsufficientRes(_))
        ));
    }

    #[test]
    fn test_fill_tops_up() {
        let nodes = vec![info("a", 2, 10), info("b", 5, 10)];
        let got = divide(nodes, 4, DeployMethod::Fill).unwrap();
        // a gets topped up to 4, b already exceeds the target
        assert_eq!(plan(&got), vec![("a", 2)]);
    }

    #[test]
    fn test_fill_fails_when_unreachable() {
        let nodes = vec![info("a", 0, 2)];
        assert!(divide(nodes, 4, DeployMethod::Fill).is_err());
    }

    #[test]
    fn test_each_places_on_every_node() {
        let nodes = vec![info("a", 0, 5), info("b", 0, 5)];
        let got = divide(nodes, 2, DeployMethod::Each).unwrap();
        assert_eq!(plan(&got), vec![("a", 2), ("b", 2)]);

        let nodes = vec![info("a", 0, 5), info("b", 0, 1)];
        assert!(divide(nodes, 2, DeployMethod::Each).is_err());
    }

    #[test]
    fn test_global_proportional() {
        let nodes = vec![info("a", 0, 6), info("b", 0, 3)];
        let got = divide(nodes, 3, DeployMethod::Global).unwrap();
        assert_eq!(plan(&got), vec![("a", 2), ("b", 1)]);
    }

    #[test]
    fn test_global_remainder_deterministic() {
        let nodes = vec![info("a", 0, 5), info("b", 0, 5)];
        let got = divide(nodes, 3, DeployMethod::Global).unwrap();
        // equal remainders: the lexically first node takes the extra
        assert_eq!(plan(&got), vec![("a", 2), ("b", 1)]);
    }
}
