//! Runtime-agnostic container engine operations. [`DockerCli`] drives a real
//! docker daemon through its CLI; [`MemoryEngine`] is the in-process twin
//! used by tests and single-binary development.

pub mod docker;
pub mod memory;
pub mod network;

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;

use armada_common::{BuildImageMessage, Result};

pub use docker::DockerCli;
pub use memory::{MemoryContainer, MemoryEngine};
pub use network::{Network, NetworkKind, NoopNetwork, PluginNetwork};

/// Engine-level container creation config, already resolved from deploy
/// options by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub user: String,
    pub workdir: String,
    pub labels: HashMap<String, String>,

    pub memory: i64,
    pub memory_swap: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpu_shares: i64,
    pub cpuset_cpus: String,

    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub network_mode: String,
    pub dns: Vec<String>,
    pub binds: Vec<String>,
    /// ports to publish, e.g. "8080" or "8080/tcp"
    pub publish: Vec<String>,
    pub restart_policy: String,
    pub log_driver: String,
    pub log_opts: HashMap<String, String>,
    pub sysctls: HashMap<String, String>,
    /// nofile soft/hard limit
    pub ulimit_nofile: i64,
}

/// Snapshot from inspecting a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    /// network name → ipv4
    pub networks: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub user: String,
    pub workdir: String,
    /// container port ("8080/tcp") → published host port
    pub ports: HashMap<String, String>,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = BuildImageMessage> + Send>>;
pub type LogStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[async_trait]
pub trait Engine: Send + Sync {
    /// Blocking image pull; deployments wait on this before creating.
    async fn image_pull(&self, image: &str) -> Result<()>;

    async fn image_remove(&self, image: &str, force: bool, prune: bool) -> Result<()>;

    /// Push an image; progress arrives as messages, terminal errors as a
    /// final message with `error` set.
    async fn image_push(&self, image: &str) -> Result<MessageStream>;

    /// Build `context_dir` into `tag`, streaming build output.
    async fn image_build(&self, context_dir: &Path, tag: &str) -> Result<MessageStream>;

    /// Create a container; returns its id.
    async fn create(&self, config: &ContainerConfig) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn remove(&self, id: &str, volumes: bool, force: bool) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<ContainerInfo>;

    /// Run a command inside the container, returning its combined output.
    async fn exec(&self, id: &str, cmd: &[String], envs: &[String], workdir: &str)
        -> Result<String>;

    /// Place a file into the container with the given ownership and mode.
    async fn copy_to(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<()>;

    /// Follow the container's output stream.
    async fn attach(&self, id: &str, follow: bool) -> Result<LogStream>;

    async fn network_connect(&self, id: &str, network: &str, ipv4: &str) -> Result<()>;

    async fn network_disconnect(&self, id: &str, network: &str) -> Result<()>;
}
