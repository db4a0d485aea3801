use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resource::{CpuMap, VolumeMap};

/// A deployed workload instance. The record owns its slice of node capacity
/// from the moment the store acknowledges it until it is removed.
///
/// Ownership is one-way: the container knows its node and pod, the node keeps
/// no container list. Per-node queries go through store indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub podname: String,
    pub nodename: String,
    /// `<appname>_<entrypoint>_<random6>`.
    pub name: String,

    #[serde(default)]
    pub cpu: CpuMap,
    #[serde(default)]
    pub quota: f64,
    pub memory: i64,
    #[serde(default)]
    pub storage: i64,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub volume_plan: VolumeMap,

    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Container {
    /// Split the container name from the right: the trailing segment is the
    /// random suffix, the one before it the entrypoint, the rest the appname.
    pub fn parse_name(name: &str) -> Option<(String, String, String)> {
        let (rest, suffix) = name.rsplit_once('_')?;
        let (appname, entrypoint) = rest.rsplit_once('_')?;
        if appname.is_empty() || entrypoint.is_empty() || suffix.is_empty() {
            return None;
        }
        Some((appname.to_string(), entrypoint.to_string(), suffix.to_string()))
    }

    pub fn appname(&self) -> Option<String> {
        Self::parse_name(&self.name).map(|(app, _, _)| app)
    }

    pub fn entrypoint(&self) -> Option<String> {
        Self::parse_name(&self.name).map(|(_, entry, _)| entry)
    }
}

/// Runtime status written under the status prefix; probing is external,
/// this record only carries what was last observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: String,
    pub running: bool,
    pub healthy: bool,
    #[serde(default)]
    pub networks: HashMap<String, String>,
    #[serde(default)]
    pub updated_at: i64,
}
