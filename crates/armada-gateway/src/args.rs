use clap::Parser;

use armada_common::Config;

#[derive(Debug, Parser)]
#[command(name = "armada-gateway", about = "cluster orchestrator HTTP gateway")]
pub struct Args {
    #[arg(long, env = "ARMADA_LISTEN", default_value = "0.0.0.0:5001")]
    pub listen: String,

    #[arg(
        long,
        env = "ARMADA_ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    pub etcd_endpoints: Vec<String>,

    #[arg(long, default_value = "/armada")]
    pub etcd_prefix: String,

    #[arg(long, default_value = "json-file")]
    pub log_driver: String,

    #[arg(long, default_value = "bridge")]
    pub network_mode: String,

    /// Network plane: "plugin", "agent" or "none".
    #[arg(long, default_value = "none")]
    pub network_plugin: String,

    #[arg(long)]
    pub use_local_dns: bool,

    /// Pod whose nodes run image builds.
    #[arg(long, default_value = "")]
    pub build_pod: String,

    #[arg(long, default_value = "")]
    pub hub: String,

    #[arg(long, default_value = "")]
    pub hub_namespace: String,

    #[arg(long, env = "ARMADA_ZONE", default_value = "")]
    pub zone: String,

    #[arg(long, default_value = "/home")]
    pub app_dir: String,

    /// Lock TTL and acquisition deadline, seconds.
    #[arg(long, default_value_t = 30)]
    pub lock_timeout: u64,

    /// Deadline for engine and store calls, seconds.
    #[arg(long, default_value_t = 300)]
    pub global_timeout: u64,

    /// Image pulls get their own, longer deadline, seconds.
    #[arg(long, default_value_t = 900)]
    pub image_timeout: u64,

    #[arg(long, default_value_t = -1)]
    pub max_share: i64,

    /// "github" or "gitlab"; empty disables the build-from-source API.
    #[arg(long, env = "ARMADA_SCM_TYPE", default_value = "")]
    pub scm_type: String,

    #[arg(long, env = "ARMADA_GIT_TOKEN", default_value = "")]
    pub git_token: String,

    #[arg(long, default_value = "")]
    pub git_private_key: String,

    #[arg(long, default_value = "")]
    pub syslog_address: String,

    #[arg(long, default_value = "daemon")]
    pub syslog_facility: String,

    #[arg(long, default_value = "rfc5424")]
    pub syslog_format: String,
}

impl Args {
    pub fn to_config(&self) -> Config {
        let mut config = Config::default();
        config.etcd.endpoints = self.etcd_endpoints.clone();
        config.etcd.prefix = self.etcd_prefix.clone();
        config.docker.log_driver = self.log_driver.clone();
        config.docker.network_mode = self.network_mode.clone();
        config.docker.use_local_dns = self.use_local_dns;
        config.docker.build_pod = self.build_pod.clone();
        config.docker.hub = self.hub.clone();
        config.docker.namespace = self.hub_namespace.clone();
        config.scheduler.max_share = self.max_share;
        config.syslog.address = self.syslog_address.clone();
        config.syslog.facility = self.syslog_facility.clone();
        config.syslog.format = self.syslog_format.clone();
        config.git.scm_type = self.scm_type.clone();
        config.git.token = self.git_token.clone();
        config.git.private_key = self.git_private_key.clone();
        config.zone = self.zone.clone();
        config.app_dir = self.app_dir.clone();
        config.lock_timeout = self.lock_timeout;
        config.global_timeout = self.global_timeout;
        config.image_timeout = self.image_timeout;
        config
    }
}
