use rand::Rng;

use armada_common::{Config, DeployOptions, Node, SchedulerMode, SHARE_BASE};
use armada_engine::{ContainerConfig, NetworkKind};
use armada_scheduler::VolumePlan;

use crate::resource::ReplicaSlice;

const CPU_PERIOD: i64 = 100_000;
const NOFILE_LIMIT: i64 = 65535;
const LAUNCHER_DIR: &str = "/usr/local/bin";

/// `<appname>_<entrypoint>_<random6>`.
pub(crate) fn make_container_name(appname: &str, entrypoint: &str) -> String {
    format!("{}_{}_{}", appname, entrypoint, random_suffix(6))
}

pub(crate) fn random_suffix(len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Version label from an image reference: the tag after the last `:` that
/// follows the last `/`.
pub(crate) fn image_version(image: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    match name.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() => tag.to_string(),
        _ => "unknown".to_string(),
    }
}

/// Translate a deployment request plus one replica's allocation into the
/// engine-level config.
pub(crate) fn make_container_config(
    cfg: &Config,
    opts: &DeployOptions,
    node: &Node,
    slice: &ReplicaSlice,
    mode: SchedulerMode,
    index: usize,
    network_kind: NetworkKind,
    name: String,
) -> ContainerConfig {
    let entry = &opts.entrypoint;
    let node_ip = node.ip();

    let mut cmd: Vec<String> = entry
        .command
        .split_whitespace()
        .map(String::from)
        .collect();
    let mut user = opts.name.clone();
    if entry.privileged || opts.raw {
        user = "root".to_string();
    }

    // without raw mode the agent network plane needs its launcher in front
    // of the command, told whether the container wants networking
    if !opts.raw && network_kind == NetworkKind::Agent {
        let starter = if entry.privileged { "launcheroot" } else { "launcher" };
        let wants_network = if opts.networks.is_empty() { "nonetwork" } else { "network" };
        let mut wrapped = vec![format!("{LAUNCHER_DIR}/{starter}"), wants_network.to_string()];
        wrapped.extend(cmd);
        cmd = wrapped;
        user = "root".to_string();
    }

    let mut config = ContainerConfig {
        name,
        image: opts.image.clone(),
        cmd,
        user,
        privileged: entry.privileged,
        publish: entry.publish.clone(),
        restart_policy: entry.restart_policy.clone(),
        sysctls: entry.sysctls.clone(),
        ulimit_nofile: NOFILE_LIMIT,
        ..Default::default()
    };

    match mode {
        SchedulerMode::CpuBind => {
            // the scheduler never hands out more than one share base per id,
            // so the smallest share in the allocation is the numerator
            if !slice.cpu.is_empty() {
                let share = slice.cpu.0.values().copied().min().unwrap_or(SHARE_BASE);
                config.cpu_shares = share * 1024 / SHARE_BASE;
                config.cpuset_cpus = slice
                    .cpu
                    .0
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(",");
            }
        }
        SchedulerMode::Memory => {
            config.memory = opts.memory;
            config.memory_swap = opts.memory;
            config.cpu_period = CPU_PERIOD;
            config.cpu_quota = (opts.cpu_quota * CPU_PERIOD as f64).round() as i64;
        }
    }

    config.env = opts.env.clone();
    config.env.push(format!("APP_NAME={}", opts.name));
    config.env.push(format!("ERU_POD={}", opts.podname));
    config.env.push(format!("ERU_NODE_IP={node_ip}"));
    config.env.push(format!("ERU_NODE_NAME={}", node.name));
    config.env.push(format!("ERU_ZONE={}", cfg.zone));
    config.env.push(format!(
        "APPDIR={}/{}",
        cfg.app_dir.trim_end_matches('/'),
        opts.name
    ));
    config.env.push(format!("ERU_CONTAINER_NO={index}"));
    config.env.push(format!("ERU_MEMORY={}", opts.memory));

    config.workdir = entry.dir.clone();
    if !opts.raw && config.workdir.is_empty() {
        config.workdir = format!("{}/{}", cfg.app_dir.trim_end_matches('/'), opts.name);
    }

    config.labels.insert("ERU".to_string(), "1".to_string());
    config
        .labels
        .insert("version".to_string(), image_version(&opts.image));
    config.labels.insert("zone".to_string(), cfg.zone.clone());
    let hook = entry.hook.clone().unwrap_or_default();
    config
        .labels
        .insert("after_start".to_string(), hook.after_start);
    config
        .labels
        .insert("before_stop".to_string(), hook.before_stop);
    match &entry.healthcheck {
        Some(check) if !check.url.is_empty() => {
            config
                .labels
                .insert("healthcheck".to_string(), "http".to_string());
            config
                .labels
                .insert("healthcheck_url".to_string(), check.url.clone());
            config.labels.insert(
                "healthcheck_expected_code".to_string(),
                check.expected_code.to_string(),
            );
        }
        _ => {
            config
                .labels
                .insert("healthcheck".to_string(), "tcp".to_string());
        }
    }
    let ports: Vec<String> = entry
        .publish
        .iter()
        .map(|p| {
            if p.contains('/') {
                p.clone()
            } else {
                format!("{p}/tcp")
            }
        })
        .collect();
    config.labels.insert("ports".to_string(), ports.join(","));
    for (k, v) in &opts.labels {
        config.labels.insert(k.clone(), v.clone());
    }

    config.network_mode = opts
        .network_mode
        .clone()
        .unwrap_or_else(|| cfg.docker.network_mode.clone());

    config.dns = opts.dns.clone();
    if config.dns.is_empty()
        && cfg.docker.use_local_dns
        && !node_ip.is_empty()
        && config.network_mode != "host"
    {
        config.dns = vec![node_ip];
    }

    config.binds = resolve_binds(opts, &slice.volume);

    config.log_driver = entry
        .log_driver
        .clone()
        .unwrap_or_else(|| cfg.docker.log_driver.clone());
    if opts.debug {
        config.log_driver = "syslog".to_string();
        config
            .log_opts
            .insert("syslog-address".to_string(), cfg.syslog.address.clone());
        config
            .log_opts
            .insert("syslog-facility".to_string(), cfg.syslog.facility.clone());
        config
            .log_opts
            .insert("syslog-format".to_string(), cfg.syslog.format.clone());
        config
            .log_opts
            .insert("tag".to_string(), format!("{} {{{{.ID}}}}", opts.name));
    }

    config
}

/// Scheduled bindings mount under their assigned node volume; host paths
/// pass through untouched.
fn resolve_binds(opts: &DeployOptions, plan: &VolumePlan) -> Vec<String> {
    opts.volumes
        .iter()
        .map(|binding| {
            if binding.requires_schedule() {
                match plan.assignment.get(&binding.dst) {
                    Some(volume) => {
                        let src = format!("{}{}", volume.trim_end_matches('/'), binding.dst);
                        binding.to_bind(&src)
                    }
                    None => binding.to_bind(&binding.src),
                }
            } else {
                binding.to_bind(&binding.src)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_common::{CpuMap, Hook, ResourceDelta, VolumeBinding};

    use crate::testutil::{deploy_opts, test_node};

    fn slice_with_cpu(pairs: &[(&str, i64)]) -> ReplicaSlice {
        let cpu: CpuMap = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        ReplicaSlice {
            cpu: cpu.clone(),
            volume: VolumePlan::default(),
            delta: ResourceDelta {
                cpu,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_container_name_parses_back() {
        let name = make_container_name("app", "web");
        let (app, entry, suffix) = armada_common::Container::parse_name(&name).unwrap();
        assert_eq!(app, "app");
        assert_eq!(entry, "web");
        assert_eq!(suffix.len(), 6);
    }

    #[test]
    fn test_image_version() {
        assert_eq!(image_version("hub.io/team/app:v2"), "v2");
        assert_eq!(image_version("app:latest"), "latest");
        assert_eq!(image_version("registry:5000/team/app"), "unknown");
    }

    #[test]
    fn test_memory_mode_limits() {
        let cfg = Config::default();
        let mut opts = deploy_opts("p1", 1);
        opts.cpu_quota = 1.5;
        let node = test_node("a", "p1", 8);

        let config = make_container_config(
            &cfg,
            &opts,
            &node,
            &ReplicaSlice::default(),
            SchedulerMode::Memory,
            0,
            NetworkKind::Plugin,
            "app_web_abc123".to_string(),
        );
        assert_eq!(config.memory, opts.memory);
        assert_eq!(config.memory_swap, opts.memory);
        assert_eq!(config.cpu_period, 100_000);
        assert_eq!(config.cpu_quota, 150_000);
        assert_eq!(config.cpu_shares, 0);
        assert_eq!(config.user, "app");
        assert_eq!(config.workdir, "/home/app");
        assert_eq!(config.labels["healthcheck"], "tcp");
        assert_eq!(config.labels["ports"], "8080/tcp");
        assert!(config.env.iter().any(|e| e == "ERU_CONTAINER_NO=0"));
        assert!(config.env.iter().any(|e| e == "ERU_NODE_IP=10.0.0.1"));
    }

    #[test]
    fn test_cpu_mode_pins_cores() {
        let cfg = Config::default();
        let opts = deploy_opts("p1", 1);
        let node = test_node("a", "p1", 8);

        let config = make_container_config(
            &cfg,
            &opts,
            &node,
            &slice_with_cpu(&[("0", 10), ("2", 3)]),
            SchedulerMode::CpuBind,
            0,
            NetworkKind::Plugin,
            "app_web_abc123".to_string(),
        );
        // smallest share of the allocation is the numerator
        assert_eq!(config.cpu_shares, 3 * 1024 / 10);
        assert_eq!(config.cpuset_cpus, "0,2");
        assert_eq!(config.memory, 0);
    }

    #[test]
    fn test_agent_network_wraps_launcher() {
        let cfg = Config::default();
        let mut opts = deploy_opts("p1", 1);
        opts.networks.insert("vlan".to_string(), String::new());
        let node = test_node("a", "p1", 8);

        let config = make_container_config(
            &cfg,
            &opts,
            &node,
            &ReplicaSlice::default(),
            SchedulerMode::Memory,
            0,
            NetworkKind::Agent,
            "app_web_abc123".to_string(),
        );
        assert_eq!(config.cmd[0], "/usr/local/bin/launcher");
        assert_eq!(config.cmd[1], "network");
        assert_eq!(config.cmd[2], "./run");
        assert_eq!(config.user, "root");
    }

    #[test]
    fn test_debug_switches_to_syslog() {
        let mut cfg = Config::default();
        cfg.syslog.address = "udp://syslog:514".to_string();
        let mut opts = deploy_opts("p1", 1);
        opts.debug = true;
        let node = test_node("a", "p1", 8);

        let config = make_container_config(
            &cfg,
            &opts,
            &node,
            &ReplicaSlice::default(),
            SchedulerMode::Memory,
            0,
            NetworkKind::Plugin,
            "app_web_abc123".to_string(),
        );
        assert_eq!(config.log_driver, "syslog");
        assert_eq!(config.log_opts["syslog-address"], "udp://syslog:514");
        assert_eq!(config.log_opts["tag"], "app {{.ID}}");
    }

    #[test]
    fn test_hook_labels_and_scheduled_binds() {
        let cfg = Config::default();
        let mut opts = deploy_opts("p1", 1);
        opts.entrypoint.hook = Some(Hook {
            after_start: "./warm".to_string(),
            before_stop: "./drain".to_string(),
            force: false,
        });
        opts.volumes = vec![
            VolumeBinding::parse("AUTO:/data:rw:100").unwrap(),
            VolumeBinding::parse("/host/etc:/etc/app:ro").unwrap(),
        ];
        let node = test_node("a", "p1", 8);

        let mut slice = ReplicaSlice::default();
        slice
            .volume
            .assignment
            .insert("/data".to_string(), "/vol0".to_string());

        let config = make_container_config(
            &cfg,
            &opts,
            &node,
            &slice,
            SchedulerMode::Memory,
            0,
            NetworkKind::Plugin,
            "app_web_abc123".to_string(),
        );
        assert_eq!(config.labels["after_start"], "./warm");
        assert_eq!(config.labels["before_stop"], "./drain");
        assert!(config.binds.contains(&"/vol0/data:/data:rw".to_string()));
        assert!(config.binds.contains(&"/host/etc:/etc/app:ro".to_string()));
    }
}
