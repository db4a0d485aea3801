use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use armada_common::{ArmadaError, BuildImageMessage, Result};

use crate::{ContainerConfig, ContainerInfo, Engine, LogStream, MessageStream};

/// In-process [`Engine`] twin. Holds containers and images in memory and
/// can be scripted to fail the n-th call of any operation, which is how the
/// orchestrator tests drive partial-failure branches.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<Mutex<State>>,
}

/// Kept exported alongside the engine for tests that want to reach into
/// container state directly.
#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub id: String,
    pub config: ContainerConfig,
    pub running: bool,
    pub networks: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, MemoryContainer>,
    images: HashSet<String>,
    files: HashMap<(String, String), Vec<u8>>,
    exec_log: Vec<(String, String)>,
    seq: u64,
    calls: HashMap<&'static str, u64>,
    failures: HashMap<&'static str, HashSet<u64>>,
    failing_images: HashSet<String>,
}

impl State {
    fn should_fail(&mut self, op: &'static str) -> bool {
        let n = self.calls.entry(op).or_insert(0);
        *n += 1;
        self.failures.get(op).is_some_and(|set| set.contains(n))
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` call (1-based) of `op` fail. `op` matches the trait
    /// method name, e.g. `"start"` or `"create"`.
    pub fn fail_nth(&self, op: &'static str, nth: u64) {
        let mut state = self.inner.lock().unwrap();
        state.failures.entry(op).or_default().insert(nth);
    }

    /// Make every pull of `image` fail.
    pub fn fail_image(&self, image: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_images
            .insert(image.to_string());
    }

    pub fn container(&self, id: &str) -> Option<MemoryContainer> {
        self.inner.lock().unwrap().containers.get(id).cloned()
    }

    pub fn containers(&self) -> Vec<MemoryContainer> {
        self.inner.lock().unwrap().containers.values().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.running)
            .count()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.inner.lock().unwrap().images.contains(image)
    }

    /// Every exec run so far as (container id, joined command).
    pub fn execs(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().exec_log.clone()
    }

    pub fn file(&self, id: &str, path: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(&(id.to_string(), path.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn image_pull(&self, image: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("image_pull") || state.failing_images.contains(image) {
            return Err(ArmadaError::ImagePull {
                image: image.to_string(),
                reason: "scripted pull failure".to_string(),
            });
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn image_remove(&self, image: &str, _force: bool, _prune: bool) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("image_remove") {
            return Err(ArmadaError::Engine("scripted rmi failure".to_string()));
        }
        state.images.remove(image);
        Ok(())
    }

    async fn image_push(&self, image: &str) -> Result<MessageStream> {
        let failed = self.inner.lock().unwrap().should_fail("image_push");
        let msg = if failed {
            BuildImageMessage {
                id: image.to_string(),
                error: "scripted push failure".to_string(),
                ..Default::default()
            }
        } else {
            BuildImageMessage {
                id: image.to_string(),
                status: "pushed".to_string(),
                ..Default::default()
            }
        };
        Ok(Box::pin(stream::iter(vec![msg])))
    }

    async fn image_build(&self, _context_dir: &Path, tag: &str) -> Result<MessageStream> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("image_build") {
            let msg = BuildImageMessage {
                id: tag.to_string(),
                error: "scripted build failure".to_string(),
                ..Default::default()
            };
            return Ok(Box::pin(stream::iter(vec![msg])));
        }
        state.images.insert(tag.to_string());
        let msgs = vec![
            BuildImageMessage {
                id: tag.to_string(),
                stream: format!("building {tag}"),
                ..Default::default()
            },
            BuildImageMessage {
                id: tag.to_string(),
                status: "complete".to_string(),
                ..Default::default()
            },
        ];
        Ok(Box::pin(stream::iter(msgs)))
    }

    async fn create(&self, config: &ContainerConfig) -> Result<String> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("create") {
            return Err(ArmadaError::Engine("scripted create failure".to_string()));
        }
        if !state.images.contains(&config.image) {
            return Err(ArmadaError::Engine(format!(
                "image {} not present",
                config.image
            )));
        }
        state.seq += 1;
        let id = format!("c{:06}", state.seq);
        let mut networks = HashMap::new();
        if config.network_mode.is_empty() || config.network_mode == "bridge" {
            networks.insert("bridge".to_string(), format!("172.17.0.{}", state.seq));
        }
        state.containers.insert(
            id.clone(),
            MemoryContainer {
                id: id.clone(),
                config: config.clone(),
                running: false,
                networks,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("start") {
            return Err(ArmadaError::Engine("scripted start failure".to_string()));
        }
        match state.containers.get_mut(id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(ArmadaError::Engine(format!("no such container {id}"))),
        }
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("stop") {
            return Err(ArmadaError::Engine("scripted stop failure".to_string()));
        }
        match state.containers.get_mut(id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(ArmadaError::Engine(format!("no such container {id}"))),
        }
    }

    async fn remove(&self, id: &str, _volumes: bool, force: bool) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("remove") {
            return Err(ArmadaError::Engine("scripted remove failure".to_string()));
        }
        match state.containers.get(id) {
            Some(c) if c.running && !force => {
                Err(ArmadaError::Engine(format!("container {id} is running")))
            }
            Some(_) => {
                state.containers.remove(id);
                Ok(())
            }
            None => Err(ArmadaError::Engine(format!("no such container {id}"))),
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("inspect") {
            return Err(ArmadaError::Engine("scripted inspect failure".to_string()));
        }
        let Some(c) = state.containers.get(id) else {
            return Err(ArmadaError::Engine(format!("no such container {id}")));
        };
        let mut ports = HashMap::new();
        for port in &c.config.publish {
            let key = if port.contains('/') {
                port.clone()
            } else {
                format!("{port}/tcp")
            };
            let host_port = port.split('/').next().unwrap_or(port).to_string();
            ports.insert(key, host_port);
        }
        Ok(ContainerInfo {
            id: c.id.clone(),
            name: c.config.name.clone(),
            image: c.config.image.clone(),
            running: c.running,
            networks: c.networks.clone(),
            labels: c.config.labels.clone(),
            env: c.config.env.clone(),
            cmd: c.config.cmd.clone(),
            user: c.config.user.clone(),
            workdir: c.config.workdir.clone(),
            ports,
        })
    }

    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        _envs: &[String],
        _workdir: &str,
    ) -> Result<String> {
        let mut state = self.inner.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(ArmadaError::Engine(format!("no such container {id}")));
        }
        state.exec_log.push((id.to_string(), cmd.join(" ")));
        if state.should_fail("exec") {
            return Err(ArmadaError::Engine("scripted exec failure".to_string()));
        }
        Ok(String::new())
    }

    async fn copy_to(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
        _uid: u32,
        _gid: u32,
        _mode: u32,
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("copy_to") {
            return Err(ArmadaError::Engine("scripted copy failure".to_string()));
        }
        if !state.containers.contains_key(id) {
            return Err(ArmadaError::Engine(format!("no such container {id}")));
        }
        state
            .files
            .insert((id.to_string(), path.to_string()), content.to_vec());
        Ok(())
    }

    async fn attach(&self, id: &str, _follow: bool) -> Result<LogStream> {
        let state = self.inner.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(ArmadaError::Engine(format!("no such container {id}")));
        }
        Ok(Box::pin(stream::iter(Vec::<String>::new())))
    }

    async fn network_connect(&self, id: &str, network: &str, ipv4: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("network_connect") {
            return Err(ArmadaError::Engine("scripted connect failure".to_string()));
        }
        match state.containers.get_mut(id) {
            Some(c) => {
                let ip = if ipv4.is_empty() {
                    format!("10.0.0.{}", c.networks.len() + 2)
                } else {
                    ipv4.to_string()
                };
                c.networks.insert(network.to_string(), ip);
                Ok(())
            }
            None => Err(ArmadaError::Engine(format!("no such container {id}"))),
        }
    }

    async fn network_disconnect(&self, id: &str, network: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.should_fail("network_disconnect") {
            return Err(ArmadaError::Engine(
                "scripted disconnect failure".to_string(),
            ));
        }
        match state.containers.get_mut(id) {
            Some(c) => {
                c.networks.remove(network);
                Ok(())
            }
            None => Err(ArmadaError::Engine(format!("no such container {id}"))),
        }
    }
}
