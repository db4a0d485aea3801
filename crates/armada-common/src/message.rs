use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resource::CpuMap;

/// One per-replica outcome in a deployment stream. Self-contained so the
/// transport can serialize each message independently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateContainerMessage {
    pub podname: String,
    pub nodename: String,
    pub name: String,
    #[serde(default)]
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub error: String,

    #[serde(default)]
    pub cpu: CpuMap,
    #[serde(default)]
    pub quota: f64,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub storage: i64,
    /// port → "nodeip:port" as published.
    #[serde(default)]
    pub publish: HashMap<String, String>,
    #[serde(default)]
    pub hook_output: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaceContainerMessage {
    pub old_id: String,
    #[serde(default)]
    pub new_id: String,
    #[serde(default)]
    pub new_name: String,
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveContainerMessage {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub hook_output: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildImageMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendFileMessage {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub error: String,
}
