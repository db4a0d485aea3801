use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;

use armada_common::{ArmadaError, Container, RemoveContainerMessage, Result};
use armada_engine::Engine;

use crate::Cluster;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

impl Cluster {
    /// Tear containers down and give their allocations back. One message
    /// per container; within a node removals are sequential, across nodes
    /// they fan out like deployment does.
    pub async fn remove_container(
        &self,
        ids: Vec<String>,
        force: bool,
    ) -> Result<ReceiverStream<RemoveContainerMessage>> {
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
                let worker_tx = tx.clone();
                workers.spawn(async move {
                    for container in containers {
                        let msg = c.remove_one(&nodename, &container, force).await;
                        if worker_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                });
            }
            drop(tx);
            while workers.join_next().await.is_some() {}
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn remove_one(
        &self,
        nodename: &str,
        container: &Container,
        force: bool,
    ) -> RemoveContainerMessage {
        let mut msg = RemoveContainerMessage {
            id: container.id.clone(),
            ..Default::default()
        };

        let locked = match self
            .lock_containers(std::slice::from_ref(&container.id))
            .await
        {
            Ok(locked) => locked,
            Err(e) => {
                msg.error = e.to_string();
                return msg;
            }
        };

        let node = match self.store.get_node(nodename).await {
            Ok(node) => node,
            Err(e) => {
                msg.error = e.to_string();
                locked.unlock().await;
                return msg;
            }
        };
        let engine = match self.engines.engine(&node).await {
            Ok(engine) => engine,
            Err(e) => {
                msg.error = e.to_string();
                locked.unlock().await;
                return msg;
            }
        };

        self.do_remove(engine.as_ref(), container, force, &mut msg)
            .await;
        locked.unlock().await;
        msg
    }

    async fn do_remove(
        &self,
        engine: &dyn Engine,
        container: &Container,
        force: bool,
        msg: &mut RemoveContainerMessage,
    ) {
        let timeout = self.global_timeout();

        if let Some(hook) = container
            .labels
            .get("before_stop")
            .filter(|h| !h.is_empty())
        {
            let cmd: Vec<String> = hook.split_whitespace().map(String::from).collect();
            match self
                .deadline(timeout, engine.exec(&container.id, &cmd, &[], ""))
                .await
            {
                Ok(output) => msg.hook_output = output,
                Err(e) => {
                    tracing::warn!(id = %container.id, error = %e, "before-stop hook failed");
                }
            }
        }

        if !force {
            if let Err(e) = self
                .deadline(timeout, engine.stop(&container.id, STOP_TIMEOUT))
                .await
            {
                msg.error = e.to_string();
                return;
            }
        }
        if let Err(e) = self
            .deadline(timeout, engine.remove(&container.id, true, true))
            .await
        {
            msg.error = e.to_string();
            return;
        }

        // the engine copy is gone; the allocation goes back before the
        // record does so capacity is never understated
        let delta = armada_common::ResourceDelta {
            cpu: container.cpu.clone(),
            quota: container.quota,
            memory: container.memory,
            storage: container.storage,
            volume: container.volume_plan.clone(),
        };
        self.release_replica(&container.nodename, &delta).await;

        if let Err(e) = self.store.remove_container(container).await {
            msg.error = e.to_string();
            return;
        }
        msg.success = true;
    }
}
