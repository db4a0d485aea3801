use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resource::{CpuMap, VolumeMap};

/// A host running the container engine.
///
/// `cpu`, `mem_cap`, `storage_cap` and `volume` track the *free* share of
/// capacity; the `init_*` fields are the totals recorded when the node was
/// added. Invariants: `0 ≤ cpu[i] ≤ init_cpu[i]`, `mem_cap ≤ init_mem`,
/// `volume[v] ≤ init_volume[v]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub endpoint: String,
    pub podname: String,

    pub cpu: CpuMap,
    #[serde(default)]
    pub cpu_used: f64,
    pub init_cpu: CpuMap,

    pub mem_cap: i64,
    pub init_mem: i64,

    #[serde(default)]
    pub storage_cap: i64,
    #[serde(default)]
    pub init_storage: i64,

    #[serde(default)]
    pub volume: VolumeMap,
    #[serde(default)]
    pub init_volume: VolumeMap,

    /// cpu id → numa node.
    #[serde(default)]
    pub numa: HashMap<String, String>,
    /// numa node → bytes of local memory.
    #[serde(default)]
    pub numa_memory: HashMap<String, i64>,

    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl Node {
    /// Host part of the engine endpoint, e.g. "tcp://10.0.0.1:2376" → "10.0.0.1".
    pub fn ip(&self) -> String {
        let trimmed = self
            .endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.endpoint);
        trimmed
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(trimmed)
            .to_string()
    }

    /// Free storage for planning. Nodes added without storage accounting
    /// (`init_storage == 0`) are treated as unlimited.
    pub fn storage_free(&self) -> i64 {
        if self.init_storage == 0 {
            i64::MAX
        } else {
            self.storage_cap
        }
    }

    pub fn memory_used(&self) -> i64 {
        self.init_mem - self.mem_cap
    }

    pub fn storage_used(&self) -> i64 {
        self.init_storage - self.storage_cap
    }

    /// Whether every node label requested by the selector matches.
    pub fn matches_labels(&self, wanted: &HashMap<String, String>) -> bool {
        wanted
            .iter()
            .all(|(k, v)| self.labels.get(k).map(String::as_str) == Some(v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(endpoint: &str) -> Node {
        Node {
            name: "n1".to_string(),
            endpoint: endpoint.to_string(),
            podname: "p1".to_string(),
            cpu: CpuMap::new(),
            cpu_used: 0.0,
            init_cpu: CpuMap::new(),
            mem_cap: 0,
            init_mem: 0,
            storage_cap: 0,
            init_storage: 0,
            volume: VolumeMap::new(),
            init_volume: VolumeMap::new(),
            numa: HashMap::new(),
            numa_memory: HashMap::new(),
            labels: HashMap::new(),
            available: true,
        }
    }

    #[test]
    fn test_ip_from_endpoint() {
        assert_eq!(node("tcp://10.0.0.1:2376").ip(), "10.0.0.1");
        assert_eq!(node("unix:///var/run/docker.sock").ip(), "/var/run/docker.sock");
        assert_eq!(node("10.0.0.2:2376").ip(), "10.0.0.2");
    }

    #[test]
    fn test_storage_free_unlimited() {
        let mut n = node("tcp://h:1");
        assert_eq!(n.storage_free(), i64::MAX);
        n.init_storage = 100;
        n.storage_cap = 40;
        assert_eq!(n.storage_free(), 40);
    }

    #[test]
    fn test_matches_labels() {
        let mut n = node("tcp://h:1");
        n.labels.insert("disk".to_string(), "ssd".to_string());
        let mut wanted = HashMap::new();
        assert!(n.matches_labels(&wanted));
        wanted.insert("disk".to_string(), "ssd".to_string());
        assert!(n.matches_labels(&wanted));
        wanted.insert("gpu".to_string(), "1".to_string());
        assert!(!n.matches_labels(&wanted));
    }
}
