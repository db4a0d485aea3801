use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ArmadaError, Result};

/// Strategy for spreading replicas across candidate nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMethod {
    /// Balance existing + planned load; least-loaded node first.
    #[default]
    Auto,
    /// Bring every node up to the requested replica total.
    Fill,
    /// Place exactly `count` replicas on every node.
    Each,
    /// Spread proportional to remaining capacity.
    Global,
}

/// Commands run inside a container around lifecycle transitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hook {
    #[serde(default)]
    pub after_start: String,
    #[serde(default)]
    pub before_stop: String,
    /// When set, a failing hook fails the whole operation instead of being
    /// logged and skipped.
    #[serde(default)]
    pub force: bool,
}

/// Declared health probe. Ports alone give a tcp check; a url upgrades it
/// to http. Probing itself is external, these only end up in labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub expected_code: i32,
}

/// A named launch recipe within an application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entrypoint {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub restart_policy: String,
    #[serde(default)]
    pub healthcheck: Option<HealthCheck>,
    #[serde(default)]
    pub hook: Option<Hook>,
    #[serde(default)]
    pub log_driver: Option<String>,
    #[serde(default)]
    pub sysctls: HashMap<String, String>,
}

/// A volume request `src:dst:flags:size`. `src` of `AUTO` (or empty) asks the
/// scheduler to pick a node volume with enough free bytes; anything else is a
/// plain host-path bind that does not participate in capacity planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub size: i64,
}

impl VolumeBinding {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            [src, dst] => Ok(Self {
                src: src.to_string(),
                dst: dst.to_string(),
                flags: String::new(),
                size: 0,
            }),
            [src, dst, flags] => Ok(Self {
                src: src.to_string(),
                dst: dst.to_string(),
                flags: flags.to_string(),
                size: 0,
            }),
            [src, dst, flags, size] => Ok(Self {
                src: src.to_string(),
                dst: dst.to_string(),
                flags: flags.to_string(),
                size: size
                    .parse()
                    .map_err(|_| ArmadaError::InsufficientRes(format!("bad volume size in {raw}")))?,
            }),
            _ => Err(ArmadaError::InsufficientRes(format!(
                "bad volume binding {raw}"
            ))),
        }
    }

    /// Whether this binding consumes scheduled volume capacity.
    pub fn requires_schedule(&self) -> bool {
        (self.src.is_empty() || self.src == "AUTO") && self.size > 0
    }

    pub fn to_bind(&self, resolved_src: &str) -> String {
        if self.flags.is_empty() {
            format!("{}:{}", resolved_src, self.dst)
        } else {
            format!("{}:{}:{}", resolved_src, self.dst, self.flags)
        }
    }
}

/// A deployment request: what to run, where, and how much of everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployOptions {
    /// Application name.
    pub name: String,
    pub entrypoint: Entrypoint,
    pub podname: String,
    #[serde(default)]
    pub nodename: Option<String>,
    pub image: String,

    #[serde(default)]
    pub cpu_quota: f64,
    #[serde(default)]
    pub cpu_bind: bool,
    pub memory: i64,
    #[serde(default)]
    pub storage: i64,
    pub count: usize,

    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    /// network name → requested ipv4 ("" for engine-assigned).
    #[serde(default)]
    pub networks: HashMap<String, String>,
    #[serde(default)]
    pub network_mode: Option<String>,

    /// User metadata copied into container labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Node selector labels.
    #[serde(default)]
    pub node_labels: HashMap<String, String>,

    #[serde(default)]
    pub deploy_method: DeployMethod,
    #[serde(default)]
    pub nodes_limit: usize,
    #[serde(default)]
    pub ignore_hook: bool,
    /// Run the raw command without the launcher wrapper, as root.
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub debug: bool,
}

impl DeployOptions {
    /// Pre-stream validation; violations never open a result stream.
    pub fn validate(&self) -> Result<()> {
        if self.memory < crate::resource::MIN_MEMORY {
            return Err(ArmadaError::BadMemory(self.memory));
        }
        if self.entrypoint.name.is_empty() || self.entrypoint.command.is_empty() {
            return Err(ArmadaError::not_found("entrypoint", self.entrypoint.name.clone()));
        }
        if self.nodename.is_none() && self.nodes_limit == 0 && self.count == 0 {
            return Err(ArmadaError::BadCount(self.count as i64));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MIN_MEMORY;

    fn opts() -> DeployOptions {
        DeployOptions {
            name: "app".to_string(),
            entrypoint: Entrypoint {
                name: "web".to_string(),
                command: "./run".to_string(),
                ..Default::default()
            },
            podname: "pod".to_string(),
            image: "app:1".to_string(),
            memory: MIN_MEMORY,
            count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(opts().validate().is_ok());

        let mut bad = opts();
        bad.memory = MIN_MEMORY - 1;
        assert!(matches!(bad.validate(), Err(ArmadaError::BadMemory(_))));

        let mut bad = opts();
        bad.entrypoint.command.clear();
        assert!(bad.validate().is_err());

        let mut bad = opts();
        bad.count = 0;
        assert!(matches!(bad.validate(), Err(ArmadaError::BadCount(0))));
        bad.nodename = Some("n1".to_string());
        assert!(bad.validate().is_ok());
    }

    #[test]
    fn test_volume_binding_parse() {
        let b = VolumeBinding::parse("AUTO:/data:rw:1024").unwrap();
        assert!(b.requires_schedule());
        assert_eq!(b.size, 1024);
        assert_eq!(b.to_bind("/mnt/vol0/data"), "/mnt/vol0/data:/data:rw");

        let b = VolumeBinding::parse("/host/dir:/data").unwrap();
        assert!(!b.requires_schedule());
        assert_eq!(b.to_bind(&b.src), "/host/dir:/data");

        assert!(VolumeBinding::parse("a:b:c:not-a-number").is_err());
        assert!(VolumeBinding::parse("toomany:a:b:c:d").is_err());
    }
}
