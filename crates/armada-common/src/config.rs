use serde::{Deserialize, Serialize};

/// Runtime configuration. The gateway binary populates this from CLI args
/// and environment; components receive the sections they care about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub etcd: EtcdConfig,
    pub docker: DockerConfig,
    pub scheduler: SchedulerConfig,
    pub syslog: SyslogConfig,
    pub git: GitConfig,

    pub zone: String,
    pub app_dir: String,

    /// Distributed-lock TTL in seconds; leases are kept alive at ttl/3.
    pub lock_timeout: u64,
    /// Deadline for engine and store calls, seconds.
    pub global_timeout: u64,
    /// Image pulls may exceed the global deadline; they get this one instead.
    pub image_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            etcd: EtcdConfig::default(),
            docker: DockerConfig::default(),
            scheduler: SchedulerConfig::default(),
            syslog: SyslogConfig::default(),
            git: GitConfig::default(),
            zone: String::new(),
            app_dir: "/home".to_string(),
            lock_timeout: 30,
            global_timeout: 300,
            image_timeout: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub prefix: String,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: "/armada".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub log_driver: String,
    pub network_mode: String,
    pub use_local_dns: bool,
    /// Pod whose nodes run image builds.
    pub build_pod: String,
    pub hub: String,
    pub namespace: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            log_driver: "json-file".to_string(),
            network_mode: "bridge".to_string(),
            use_local_dns: false,
            build_pod: String::new(),
            hub: String::new(),
            namespace: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Most shares a single allocation may take from one core.
    pub max_share: i64,
    /// Shares per core; capacity planning assumes this base everywhere.
    pub share_base: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_share: -1,
            share_base: crate::resource::SHARE_BASE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyslogConfig {
    pub address: String,
    pub facility: String,
    pub format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// "github" or "gitlab".
    pub scm_type: String,
    pub private_key: String,
    pub token: String,
}

impl Config {
    /// Image tag `hub[/namespace]/appname:version`.
    pub fn image_tag(&self, appname: &str, version: &str) -> String {
        let prefix = self.docker.namespace.trim_matches('/');
        if prefix.is_empty() {
            format!("{}/{}:{}", self.docker.hub, appname, version)
        } else {
            format!("{}/{}/{}:{}", self.docker.hub, prefix, appname, version)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag() {
        let mut cfg = Config::default();
        cfg.docker.hub = "hub.example.com".to_string();
        assert_eq!(cfg.image_tag("app", "v1"), "hub.example.com/app:v1");
        cfg.docker.namespace = "/team/".to_string();
        assert_eq!(cfg.image_tag("app", "v1"), "hub.example.com/team/app:v1");
    }
}
