use serde::{Deserialize, Serialize};

/// How nodes in a pod hand out CPU time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Containers are pinned to specific cpu ids carved from node capacity.
    CpuBind,
    /// Containers share CPU freely; only memory/storage bound placement.
    #[default]
    Memory,
}

/// A named group of nodes, the scheduling domain for deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub scheduler: SchedulerMode,
}
