use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;

use armada_common::{
    ArmadaError, Container, ContainerStatus, ReplaceContainerMessage, Result, SHARE_BASE,
};
use armada_engine::{ContainerConfig, Engine, NetworkKind};

use crate::options::{image_version, make_container_name};
use crate::{now_ms, Cluster};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

impl Cluster {
    /// In-place upgrade: each container is stopped, recreated from its
    /// inspected config with the new image, and the old copy removed only
    /// after the new one runs and is registered. Any earlier failure
    /// restarts the old container, so a node never ends up with both copies
    /// claimed. The prior allocation carries over untouched.
    pub async fn replace_container(
        &self,
        ids: Vec<String>,
        image: String,
    ) -> Result<ReceiverStream<ReplaceContainerMessage>> {
        if ids.is_empty() {
            return Err(ArmadaError::BadCount(0));
        }
        let containers = self.store.get_containers(&ids).await?;

        let mut by_node: BTreeMap<String, Vec<Container>> = BTreeMap::new();
        for container in containers {
            by_node
                .entry(container.nodename.clone())
                .or_default()
                .push(container);
        }

        let (tx, rx) = mpsc::channel(1);
        let cluster = self.clone();
        tokio::spawn(async move {
            let mut workers = JoinSet::new();
            for (nodename, containers) in by_node {
                let c = cluster.clone();
                let image = image.clone();
                let worker_tx = tx.clone();
                workers.spawn(async move {
                    c.replace_on_node(nodename, containers, image, worker_tx)
                        .await;
                });
            }
            drop(tx);
            while workers.join_next().await.is_some() {}
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn replace_on_node(
        &self,
        nodename: String,
        containers: Vec<Container>,
        image: String,
        tx: mpsc::Sender<ReplaceContainerMessage>,
    ) {
        let fail_all = |error: String| {
            containers
                .iter()
                .map(|c| ReplaceContainerMessage {
                    old_id: c.id.clone(),
                    error: error.clone(),
                    ..Default::default()
                })
                .collect::<Vec<_>>()
        };

        let node = match self.store.get_node(&nodename).await {
            Ok(node) => node,
            Err(e) => {
                for msg in fail_all(e.to_string()) {
                    let _ = tx.send(msg).await;
                }
                return;
            }
        };
        let engine = match self.engines.engine(&node).await {
            Ok(engine) => engine,
            Err(e) => {
                for msg in fail_all(e.to_string()) {
                    let _ = tx.send(msg).await;
                }
                return;
            }
        };
        if let Err(e) = self
            .deadline(self.image_timeout(), engine.image_pull(&image))
            .await
        {
            for msg in fail_all(e.to_string()) {
                let _ = tx.send(msg).await;
            }
            return;
        }

        let mut old_images = std::collections::BTreeSet::new();
        for container in containers {
            let (msg, old_image) = self.replace_one(engine.as_ref(), &container, &image).await;
            if let Some(old_image) = old_image {
                if old_image != image {
                    old_images.insert(old_image);
                }
            }
            if tx.send(msg).await.is_err() {
                return;
            }
        }

        // orphaned images from upgraded containers, best effort
        for old_image in old_images {
            if let Err(e) = engine.image_remove(&old_image, false, true).await {
                tracing::debug!(image = %old_image, error = %e, "pruning replaced image failed");
            }
        }
    }

    async fn replace_one(
        &self,
        engine: &dyn Engine,
        container: &Container,
        image: &str,
    ) -> (ReplaceContainerMessage, Option<String>) {
        let mut msg = ReplaceContainerMessage {
            old_id: container.id.clone(),
            ..Default::default()
        };

        let locked = match self
            .lock_containers(std::slice::from_ref(&container.id))
            .await
        {
            Ok(locked) => locked,
            Err(e) => {
                msg.error = e.to_string();
                return (msg, None);
            }
        };
        let fresh = locked
            .containers
            .get(&container.id)
            .cloned()
            .unwrap_or_else(|| container.clone());

        let result = self.do_replace(engine, &fresh, image, &mut msg).await;
        locked.unlock().await;
        (msg, result)
    }

    /// Runs with the container- and node-locks held; fills `msg` and
    /// returns the old image tag when the swap went through.
    async fn do_replace(
        &self,
        engine: &dyn Engine,
        container: &Container,
        image: &str,
        msg: &mut ReplaceContainerMessage,
    ) -> Option<String> {
        let timeout = self.global_timeout();
        let old_id = &container.id;

        let info = match self.deadline(timeout, engine.inspect(old_id)).await {
            Ok(info) => info,
            Err(e) => {
                msg.error = e.to_string();
                return None;
            }
        };
        let old_image = info.image.clone();

        if let Some(hook) = info.labels.get("before_stop").filter(|h| !h.is_empty()) {
            let cmd: Vec<String> = hook.split_whitespace().map(String::from).collect();
            if let Err(e) = self
                .deadline(timeout, engine.exec(old_id, &cmd, &[], &info.workdir))
                .await
            {
                tracing::warn!(id = %old_id, error = %e, "before-stop hook failed");
            }
        }

        if let Err(e) = self.deadline(timeout, engine.stop(old_id, STOP_TIMEOUT)).await {
            msg.error = e.to_string();
            return None;
        }

        let new_name = match Container::parse_name(&container.name) {
            Some((app, entry, _)) => make_container_name(&app, &entry),
            None => make_container_name(&container.name, "replaced"),
        };
        let mut labels = info.labels.clone();
        labels.insert("version".to_string(), image_version(image));

        let mut config = ContainerConfig {
            name: new_name.clone(),
            image: image.to_string(),
            cmd: info.cmd.clone(),
            env: info.env.clone(),
            user: info.user.clone(),
            workdir: info.workdir.clone(),
            labels,
            binds: container.volumes.clone(),
            publish: info
                .ports
                .keys()
                .map(|p| p.split('/').next().unwrap_or(p).to_string())
                .collect(),
            ulimit_nofile: 65535,
            ..Default::default()
        };
        // carry the prior allocation over
        if container.cpu.is_empty() {
            config.memory = container.memory;
            config.memory_swap = container.memory;
            config.cpu_period = 100_000;
            config.cpu_quota = (container.quota * 100_000.0).round() as i64;
        } else {
            let share = container.cpu.0.values().copied().min().unwrap_or(SHARE_BASE);
            config.cpu_shares = share * 1024 / SHARE_BASE;
            config.cpuset_cpus = container
                .cpu
                .0
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(",");
        }

        let new_id = match self.deadline(timeout, engine.create(&config)).await {
            Ok(id) => id,
            Err(e) => {
                self.restore_old(engine, old_id, "create failed").await;
                msg.error = e.to_string();
                return None;
            }
        };

        if self.network.kind() == NetworkKind::Plugin {
            let user_networks: Vec<(String, String)> = info
                .networks
                .iter()
                .filter(|(name, _)| name.as_str() != "bridge" && name.as_str() != "host")
                .map(|(name, ip)| (name.clone(), ip.clone()))
                .collect();
            if !user_networks.is_empty() {
                if let Err(e) = self.network.disconnect(engine, &new_id, "bridge").await {
                    tracing::warn!(id = %new_id, error = %e, "detaching bridge from replacement failed");
                }
            }
            for (network, ip) in &user_networks {
                if let Err(e) = self.network.disconnect(engine, old_id, network).await {
                    tracing::warn!(id = %old_id, network = %network, error = %e, "detaching old container failed");
                }
                if let Err(e) = self.network.connect(engine, &new_id, network, ip).await {
                    tracing::warn!(id = %new_id, network = %network, error = %e, "attaching replacement failed");
                }
            }
        }

        if let Err(e) = self.deadline(timeout, engine.start(&new_id)).await {
            self.destroy_failed(engine, &new_id).await;
            self.restore_old(engine, old_id, "start failed").await;
            msg.error = e.to_string();
            return None;
        }

        let new_info = match self.deadline(timeout, engine.inspect(&new_id)).await {
            Ok(info) if info.running => info,
            Ok(_) => {
                self.destroy_failed(engine, &new_id).await;
                self.restore_old(engine, old_id, "replacement not running").await;
                msg.error = "replacement container is not running".to_string();
                return None;
            }
            Err(e) => {
                self.destroy_failed(engine, &new_id).await;
                self.restore_old(engine, old_id, "inspect failed").await;
                msg.error = e.to_string();
                return None;
            }
        };

        if let Some(hook) = config.labels.get("after_start").filter(|h| !h.is_empty()) {
            let cmd: Vec<String> = hook.split_whitespace().map(String::from).collect();
            if let Err(e) = self
                .deadline(timeout, engine.exec(&new_id, &cmd, &[], &config.workdir))
                .await
            {
                tracing::warn!(id = %new_id, error = %e, "after-start hook failed");
            }
        }

        let new_container = Container {
            id: new_info.id.clone(),
            podname: container.podname.clone(),
            nodename: container.nodename.clone(),
            name: new_name.clone(),
            cpu: container.cpu.clone(),
            quota: container.quota,
            memory: container.memory,
            storage: container.storage,
            volumes: container.volumes.clone(),
            volume_plan: container.volume_plan.clone(),
            image: image.to_string(),
            labels: config.labels.clone(),
        };
        if let Err(e) = self.store.add_container(&new_container).await {
            self.destroy_failed(engine, &new_id).await;
            self.restore_old(engine, old_id, "registration failed").await;
            msg.error = e.to_string();
            return None;
        }

        if let Err(e) = self
            .deadline(timeout, engine.remove(old_id, true, true))
            .await
        {
            msg.error = e.to_string();
            return None;
        }
        if let Err(e) = self.store.remove_container(container).await {
            msg.error = e.to_string();
            return None;
        }

        let status = ContainerStatus {
            id: new_info.id.clone(),
            running: true,
            healthy: false,
            networks: new_info.networks.clone(),
            updated_at: now_ms(),
        };
        if let Err(e) = self
            .store
            .set_container_status(&new_container, &status, None)
            .await
        {
            tracing::warn!(id = %new_info.id, error = %e, "writing replacement status failed");
        }

        msg.new_id = new_info.id.clone();
        msg.new_name = new_name;
        msg.success = true;
        Some(old_image)
    }

    async fn restore_old(&self, engine: &dyn Engine, old_id: &str, reason: &str) {
        tracing::warn!(id = %old_id, reason, "restoring replaced container");
        if let Err(e) = engine.start(old_id).await {
            tracing::error!(id = %old_id, error = %e, "restarting old container failed");
        }
    }
}
