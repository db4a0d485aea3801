use std::collections::{BTreeMap, HashMap};

use armada_common::{ArmadaError, CpuMap, Result, SHARE_BASE};

use crate::{sort_by_name, NodeInfo};

/// CPU-priority placement. The quota in cores becomes an integer share
/// demand; each replica gets a disjoint multiset of cpu ids whose shares
/// sum to it. Replicas are handed out round-robin over the sorted nodes so
/// the plan is a pure function of the inputs.
///
/// A zero quota marks a public deployment: replicas carry no cpu
/// allocation and node capacity is untouched.
pub fn select_cpu_nodes(
    mut nodes: Vec<NodeInfo>,
    quota: f64,
    memory: i64,
    count: usize,
) -> Result<(BTreeMap<String, Vec<CpuMap>>, BTreeMap<String, CpuMap>)> {
    if nodes.is_empty() {
        return Err(ArmadaError::NoNodes);
    }
    sort_by_name(&mut nodes);

    let shares = (quota * SHARE_BASE as f64).round() as i64;
    let mut plan: BTreeMap<String, Vec<CpuMap>> = BTreeMap::new();
    let mut changed: BTreeMap<String, CpuMap> = BTreeMap::new();

    let mem_bound = |node: &NodeInfo| -> usize {
        if memory > 0 {
            (node.memory / memory).max(0) as usize
        } else {
            usize::MAX
        }
    };

    if shares == 0 {
        let bounds: Vec<usize> = nodes.iter().map(mem_bound).collect();
        let mut placed = 0;
        while placed < count {
            let mut progressed = false;
            for (node, bound) in nodes.iter().zip(&bounds) {
                if placed == count {
                    break;
                }
                let allocs = plan.entry(node.name.clone()).or_default();
                if allocs.len() >= *bound {
                    continue;
                }
                allocs.push(CpuMap::new());
                changed.entry(node.name.clone()).or_default();
                placed += 1;
                progressed = true;
            }
            if !progressed {
                return Err(ArmadaError::InsufficientRes(format!(
                    "need {} public replicas, memory allows {}",
                    count, placed
                )));
            }
        }
        plan.retain(|_, allocs| !allocs.is_empty());
        return Ok((plan, changed));
    }

    let mut free: Vec<CpuMap> = nodes.iter().map(|n| n.cpu.clone()).collect();
    let bounds: Vec<usize> = nodes.iter().map(mem_bound).collect();
    let mut placed = 0;

    while placed < count {
        let mut progressed = false;
        for (idx, node) in nodes.iter().enumerate() {
            if placed == count {
                break;
            }
            if plan.get(&node.name).map(Vec::len).unwrap_or(0) >= bounds[idx] {
                continue;
            }
            let Some(alloc) = carve(&mut free[idx], shares, &node.numa) else {
                continue;
            };
            changed.entry(node.name.clone()).or_default().add(&alloc);
            plan.entry(node.name.clone()).or_default().push(alloc);
            placed += 1;
            progressed = true;
        }
        if !progressed {
            break;
        }
    }

    if placed < count {
        let detail: Vec<String> = nodes
            .iter()
            .map(|n| format!("{}: {}", n.name, plan.get(&n.name).map(Vec::len).unwrap_or(0)))
            .collect();
        return Err(ArmadaError::InsufficientCpu(format!(
            "need {} replicas of {} shares, allocated per node: {}",
            count,
            shares,
            detail.join(", ")
        )));
    }

    Ok((plan, changed))
}

/// Take one allocation of `shares` out of `free`, or `None` if it does not
/// fit. Whole cores are claimed from fully-free ids; the remaining fragment
/// goes to the tightest partial core so whole cores survive for later
/// replicas. With a NUMA topology the allocation is packed onto a single
/// NUMA node first, spilling across nodes only when none fits alone.
fn carve(free: &mut CpuMap, shares: i64, numa: &HashMap<String, String>) -> Option<CpuMap> {
    if shares == 0 {
        return Some(CpuMap::new());
    }

    if !numa.is_empty() {
        let mut groups: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for id in free.0.keys() {
            if let Some(numa_node) = numa.get(id) {
                groups.entry(numa_node.as_str()).or_default().push(id.clone());
            }
        }
        for ids in groups.values() {
            if let Some(alloc) = carve_from(free, shares, ids) {
                return Some(alloc);
            }
        }
    }

    let all: Vec<String> = free.0.keys().cloned().collect();
    carve_from(free, shares, &all)
}

fn carve_from(free: &mut CpuMap, shares: i64, candidates: &[String]) -> Option<CpuMap> {
    let whole = (shares / SHARE_BASE) as usize;
    let frag = shares % SHARE_BASE;

    let mut ids = candidates.to_vec();
    ids.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), id.clone()));

    let full: Vec<&String> = ids
        .iter()
        .filter(|id| free.0.get(*id).copied() == Some(SHARE_BASE))
        .collect();
    if full.len() < whole {
        return None;
    }

    let mut alloc = CpuMap::new();
    for id in full.iter().take(whole) {
        alloc.0.insert((*id).clone(), SHARE_BASE);
    }

    if frag > 0 {
        // tightest partial core first, whole cores only as a last resort
        let frag_id = ids
            .iter()
            .filter(|id| !alloc.0.contains_key(*id))
            .filter(|id| free.0.get(*id).copied().unwrap_or(0) >= frag)
            .min_by_key(|id| {
                let avail = free.0.get(*id).copied().unwrap_or(0);
                (avail == SHARE_BASE, avail)
            })?;
        alloc.0.insert(frag_id.clone(), frag);
    }

    free.sub(&alloc).ok()?;
    Some(alloc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_common::VolumeMap;

    fn cpus(pairs: &[(&str, i64)]) -> CpuMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn info(name: &str, cpu: CpuMap) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            cpu,
            memory: 12_400_000,
            storage: i64::MAX,
            volume: VolumeMap::new(),
            numa: HashMap::new(),
            count: 0,
            deploy: 0,
            capacity: 0,
        }
    }

    fn two_nodes() -> Vec<NodeInfo> {
        vec![
            info("node1", cpus(&[("0", 10), ("1", 10)])),
            info("node2", cpus(&[("0", 10), ("1", 10)])),
        ]
    }

    #[test]
    fn test_no_nodes() {
        assert!(matches!(
            select_cpu_nodes(Vec::new(), 1.0, 0, 1),
            Err(ArmadaError::NoNodes)
        ));
    }

    #[test]
    fn test_insufficient_shares() {
        assert!(matches!(
            select_cpu_nodes(two_nodes(), 2.0, 0, 3),
            Err(ArmadaError::InsufficientCpu(_))
        ));
        assert!(select_cpu_nodes(two_nodes(), 3.0, 0, 2).is_err());
        assert!(select_cpu_nodes(two_nodes(), 1.0, 0, 5).is_err());
    }

    #[test]
    fn test_whole_core_per_node() {
        let (plan, changed) = select_cpu_nodes(two_nodes(), 1.0, 0, 2).unwrap();
        assert_eq!(plan.len(), 2);
        for (name, allocs) in &plan {
            assert!(name == "node1" || name == "node2");
            assert_eq!(allocs.len(), 1);
            assert_eq!(allocs[0].total(), 10);
        }
        for cpu in changed.values() {
            assert_eq!(cpu.total(), 10);
        }
    }

    #[test]
    fn test_fractional_quota_plan_is_deterministic() {
        let nodes = vec![info("n", cpus(&[("0", 10), ("1", 10)]))];
        let (plan, changed) = select_cpu_nodes(nodes, 0.5, 0, 3).unwrap();

        let allocs = &plan["n"];
        assert_eq!(allocs.len(), 3);
        assert_eq!(allocs[0], cpus(&[("0", 5)]));
        assert_eq!(allocs[1], cpus(&[("0", 5)]));
        assert_eq!(allocs[2], cpus(&[("1", 5)]));
        assert_eq!(changed["n"], cpus(&[("0", 10), ("1", 5)]));

        let nodes = vec![info("n", cpus(&[("0", 10), ("1", 10)]))];
        assert!(select_cpu_nodes(nodes, 0.5, 0, 5).is_err());
    }

    #[test]
    fn test_fragment_spares_whole_cores() {
        let nodes = vec![info("n", cpus(&[("0", 7), ("1", 10)]))];
        let (plan, _) = select_cpu_nodes(nodes, 0.5, 0, 1).unwrap();
        assert_eq!(plan["n"][0], cpus(&[("0", 5)]));
    }

    #[test]
    fn test_mixed_quota_takes_whole_plus_fragment() {
        let nodes = vec![info("n", cpus(&[("0", 10), ("1", 10), ("2", 4)]))];
        let (plan, _) = select_cpu_nodes(nodes, 1.3, 0, 1).unwrap();
        assert_eq!(plan["n"][0], cpus(&[("0", 10), ("2", 3)]));
    }

    #[test]
    fn test_public_deployment_consumes_nothing() {
        let (plan, changed) = select_cpu_nodes(two_nodes(), 0.0, 0, 10).unwrap();
        let total: usize = plan.values().map(Vec::len).sum();
        assert_eq!(total, 10);
        assert_eq!(changed.len(), 2);
        for (_, allocs) in &plan {
            for cpu in allocs {
                assert_eq!(cpu.total(), 0);
            }
        }
        for cpu in changed.values() {
            assert_eq!(cpu.total(), 0);
        }
    }

    #[test]
    fn test_memory_bounds_cpu_plan() {
        let mut nodes = two_nodes();
        for n in nodes.iter_mut() {
            n.memory = 1 << 30;
        }
        // each node fits one 1GiB replica even though cpu allows two
        assert!(select_cpu_nodes(nodes.clone(), 1.0, 1 << 30, 3).is_err());
        let (plan, _) = select_cpu_nodes(nodes, 1.0, 1 << 30, 2).unwrap();
        assert_eq!(plan["node1"].len(), 1);
        assert_eq!(plan["node2"].len(), 1);
    }

    #[test]
    fn test_numa_affinity_packs_one_node() {
        let mut node = info("n", cpus(&[("0", 10), ("1", 4), ("2", 10), ("3", 10)]));
        node.numa = [
            ("0".to_string(), "numa0".to_string()),
            ("1".to_string(), "numa0".to_string()),
            ("2".to_string(), "numa1".to_string()),
            ("3".to_string(), "numa1".to_string()),
        ]
        .into_iter()
        .collect();

        // numa0 cannot serve two whole cores, numa1 can
        let (plan, _) = select_cpu_nodes(vec![node], 2.0, 0, 1).unwrap();
        assert_eq!(plan["n"][0], cpus(&[("2", 10), ("3", 10)]));
    }
}
