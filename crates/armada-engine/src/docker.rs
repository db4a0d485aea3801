use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::ReceiverStream;

use armada_common::{ArmadaError, BuildImageMessage, Result};

use crate::{ContainerConfig, ContainerInfo, Engine, LogStream, MessageStream};

static COPY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Engine backed by the docker CLI on a node endpoint. Output is consumed
/// through `--format` templates and line streams, so the implementation
/// stays independent of daemon API versions.
pub struct DockerCli {
    /// value for `docker -H`; `None` targets the local daemon
    host: Option<String>,
}

impl DockerCli {
    pub fn new(endpoint: &str) -> Self {
        let host = match endpoint {
            "" | "local" => None,
            other => Some(other.to_string()),
        };
        Self { host }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("docker");
        if let Some(host) = &self.host {
            cmd.arg("-H").arg(host);
        }
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| ArmadaError::Engine(format!("spawning docker failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ArmadaError::Engine(format!(
                "docker {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Spawn a long docker operation and forward its stdout lines as build
    /// messages; a failing exit status becomes a terminal error message.
    fn stream_lines(&self, mut cmd: Command, id: String) -> Result<MessageStream> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| ArmadaError::Engine(format!("spawning docker failed: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ArmadaError::Engine("no stdout from docker".to_string()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = tokio::sync::mpsc::channel::<BuildImageMessage>(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg = BuildImageMessage {
                    id: id.clone(),
                    stream: line,
                    ..Default::default()
                };
                if tx.send(msg).await.is_err() {
                    return;
                }
            }
            let mut err_text = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    err_text.push_str(&line);
                    err_text.push('\n');
                }
            }
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let _ = tx
                        .send(BuildImageMessage {
                            id: id.clone(),
                            error: format!("docker exited with {}: {}", status, err_text.trim()),
                            ..Default::default()
                        })
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(BuildImageMessage {
                            id: id.clone(),
                            error: format!("waiting for docker failed: {e}"),
                            ..Default::default()
                        })
                        .await;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn create_args(config: &ContainerConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["create".into(), "--name".into(), config.name.clone()];

    for (k, v) in &config.labels {
        args.push("--label".into());
        args.push(format!("{k}={v}"));
    }
    for env in &config.env {
        args.push("-e".into());
        args.push(env.clone());
    }
    if !config.user.is_empty() {
        args.push("-u".into());
        args.push(config.user.clone());
    }
    if !config.workdir.is_empty() {
        args.push("-w".into());
        args.push(config.workdir.clone());
    }

    if config.memory > 0 {
        args.push("--memory".into());
        args.push(config.memory.to_string());
        args.push("--memory-swap".into());
        args.push(config.memory_swap.to_string());
    }
    if config.cpu_period > 0 {
        args.push("--cpu-period".into());
        args.push(config.cpu_period.to_string());
        args.push("--cpu-quota".into());
        args.push(config.cpu_quota.to_string());
    }
    if config.cpu_shares > 0 {
        args.push("--cpu-shares".into());
        args.push(config.cpu_shares.to_string());
    }
    if !config.cpuset_cpus.is_empty() {
        args.push("--cpuset-cpus".into());
        args.push(config.cpuset_cpus.clone());
    }

    if config.privileged {
        args.push("--privileged".into());
    }
    for cap in &config.cap_add {
        args.push("--cap-add".into());
        args.push(cap.clone());
    }
    if !config.network_mode.is_empty() {
        args.push("--network".into());
        args.push(config.network_mode.clone());
    }
    for dns in &config.dns {
        args.push("--dns".into());
        args.push(dns.clone());
    }
    for bind in &config.binds {
        args.push("-v".into());
        args.push(bind.clone());
    }
    for port in &config.publish {
        args.push("-p".into());
        args.push(port.clone());
    }
    if !config.restart_policy.is_empty() {
        args.push("--restart".into());
        args.push(config.restart_policy.clone());
    }
    if !config.log_driver.is_empty() {
        args.push("--log-driver".into());
        args.push(config.log_driver.clone());
        for (k, v) in &config.log_opts {
            args.push("--log-opt".into());
            args.push(format!("{k}={v}"));
        }
    }
    for (k, v) in &config.sysctls {
        args.push("--sysctl".into());
        args.push(format!("{k}={v}"));
    }
    if config.ulimit_nofile > 0 {
        args.push("--ulimit".into());
        args.push(format!(
            "nofile={}:{}",
            config.ulimit_nofile, config.ulimit_nofile
        ));
    }

    args.push(config.image.clone());
    args.extend(config.cmd.iter().cloned());
    args
}

fn parse_inspect(raw: &str) -> Result<ContainerInfo> {
    let v: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ArmadaError::Engine(format!("bad inspect payload: {e}")))?;

    let str_at = |v: &serde_json::Value, path: &[&str]| -> String {
        let mut cur = v;
        for p in path {
            cur = match cur.get(p) {
                Some(next) => next,
                None => return String::new(),
            };
        }
        cur.as_str().unwrap_or_default().to_string()
    };

    let mut info = ContainerInfo {
        id: str_at(&v, &["Id"]),
        name: str_at(&v, &["Name"]).trim_start_matches('/').to_string(),
        image: str_at(&v, &["Config", "Image"]),
        running: v
            .get("State")
            .and_then(|s| s.get("Running"))
            .and_then(|r| r.as_bool())
            .unwrap_or(false),
        user: str_at(&v, &["Config", "User"]),
        workdir: str_at(&v, &["Config", "WorkingDir"]),
        ..Default::default()
    };

    if let Some(labels) = v
        .get("Config")
        .and_then(|c| c.get("Labels"))
        .and_then(|l| l.as_object())
    {
        for (k, val) in labels {
            info.labels
                .insert(k.clone(), val.as_str().unwrap_or_default().to_string());
        }
    }
    if let Some(env) = v
        .get("Config")
        .and_then(|c| c.get("Env"))
        .and_then(|e| e.as_array())
    {
        info.env = env
            .iter()
            .filter_map(|e| e.as_str().map(String::from))
            .collect();
    }
    if let Some(cmd) = v
        .get("Config")
        .and_then(|c| c.get("Cmd"))
        .and_then(|c| c.as_array())
    {
        info.cmd = cmd
            .iter()
            .filter_map(|c| c.as_str().map(String::from))
            .collect();
    }
    if let Some(networks) = v
        .get("NetworkSettings")
        .and_then(|n| n.get("Networks"))
        .and_then(|n| n.as_object())
    {
        for (name, settings) in networks {
            info.networks
                .insert(name.clone(), str_at(settings, &["IPAddress"]));
        }
    }
    if let Some(ports) = v
        .get("NetworkSettings")
        .and_then(|n| n.get("Ports"))
        .and_then(|p| p.as_object())
    {
        for (port, bindings) in ports {
            if let Some(host_port) = bindings
                .as_array()
                .and_then(|b| b.first())
                .map(|b| str_at(b, &["HostPort"]))
            {
                if !host_port.is_empty() {
                    info.ports.insert(port.clone(), host_port);
                }
            }
        }
    }
    Ok(info)
}

#[async_trait]
impl Engine for DockerCli {
    async fn image_pull(&self, image: &str) -> Result<()> {
        if image.is_empty() {
            return Err(ArmadaError::ImagePull {
                image: image.to_string(),
                reason: "empty image name".to_string(),
            });
        }
        tracing::debug!(image, "pulling image");
        self.run(&["pull", image])
            .await
            .map_err(|e| ArmadaError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn image_remove(&self, image: &str, force: bool, prune: bool) -> Result<()> {
        let mut args = vec!["rmi"];
        if force {
            args.push("-f");
        }
        if !prune {
            args.push("--no-prune");
        }
        args.push(image);
        self.run(&args).await?;
        Ok(())
    }

    async fn image_push(&self, image: &str) -> Result<MessageStream> {
        let mut cmd = self.command();
        cmd.arg("push").arg(image);
        self.stream_lines(cmd, image.to_string())
    }

    async fn image_build(&self, context_dir: &Path, tag: &str) -> Result<MessageStream> {
        let mut cmd = self.command();
        cmd.arg("build")
            .arg("--pull")
            .arg("--no-cache")
            .arg("--force-rm")
            .arg("-t")
            .arg(tag)
            .arg(context_dir);
        self.stream_lines(cmd, tag.to_string())
    }

    async fn create(&self, config: &ContainerConfig) -> Result<String> {
        let args = create_args(config);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(&["start", id]).await?;
        Ok(())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let secs = timeout.as_secs().max(1).to_string();
        self.run(&["stop", "-t", &secs, id]).await?;
        Ok(())
    }

    async fn remove(&self, id: &str, volumes: bool, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        if volumes {
            args.push("-v");
        }
        args.push(id);
        self.run(&args).await?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        let raw = self.run(&["inspect", "--format", "{{json .}}", id]).await?;
        parse_inspect(&raw)
    }

    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        envs: &[String],
        workdir: &str,
    ) -> Result<String> {
        let mut args: Vec<String> = vec!["exec".into()];
        for env in envs {
            args.push("-e".into());
            args.push(env.clone());
        }
        if !workdir.is_empty() {
            args.push("-w".into());
            args.push(workdir.to_string());
        }
        args.push(id.to_string());
        args.extend(cmd.iter().cloned());
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs).await
    }

    async fn copy_to(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<()> {
        let seq = COPY_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = std::env::temp_dir().join(format!("armada-copy-{}-{}", std::process::id(), seq));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| ArmadaError::Engine(format!("staging copy file failed: {e}")))?;

        let target = format!("{id}:{path}");
        let result = self
            .run(&["cp", tmp.to_str().unwrap_or_default(), &target])
            .await;
        let _ = tokio::fs::remove_file(&tmp).await;
        result?;

        self.run(&["exec", id, "chown", &format!("{uid}:{gid}"), path])
            .await?;
        self.run(&["exec", id, "chmod", &format!("{mode:o}"), path])
            .await?;
        Ok(())
    }

    async fn attach(&self, id: &str, follow: bool) -> Result<LogStream> {
        let mut cmd = self.command();
        cmd.arg("logs");
        if follow {
            cmd.arg("--follow");
        }
        cmd.arg(id);
        let stream = self.stream_lines(cmd, id.to_string())?;
        Ok(Box::pin(futures_util::StreamExt::map(stream, |msg| {
            if msg.error.is_empty() {
                msg.stream
            } else {
                msg.error
            }
        })))
    }

    async fn network_connect(&self, id: &str, network: &str, ipv4: &str) -> Result<()> {
        let mut args = vec!["network", "connect"];
        if !ipv4.is_empty() {
            args.push("--ip");
            args.push(ipv4);
        }
        args.push(network);
        args.push(id);
        self.run(&args).await?;
        Ok(())
    }

    async fn network_disconnect(&self, id: &str, network: &str) -> Result<()> {
        self.run(&["network", "disconnect", "--force", network, id])
            .await?;
        Ok(())
    }
}
