use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;

use armada_common::{
    ArmadaError, Container, ContainerStatus, CreateContainerMessage, DeployOptions, Node, Result,
    SchedulerMode,
};
use armada_engine::{Engine, NetworkKind};

use crate::options::{make_container_config, make_container_name};
use crate::resource::{plan_size, ReplicaSlice};
use crate::{now_ms, Cluster};

impl Cluster {
    /// The deployment pipeline: validate, lock the candidate nodes, plan,
    /// commit the allocation, then fan out one worker per node. Workers
    /// publish every replica's outcome into the returned stream; the stream
    /// closes once after the last worker finishes and the node locks drop.
    ///
    /// Failures before the fan-out return an error here and leave no
    /// capacity claimed. Failures after it ride inside the stream, each one
    /// releasing exactly its replica's slice.
    pub async fn create_container(
        &self,
        opts: DeployOptions,
    ) -> Result<ReceiverStream<CreateContainerMessage>> {
        opts.validate()?;
        let pod = self.store.get_pod(&opts.podname).await?;
        let mode = if opts.cpu_bind || pod.scheduler == SchedulerMode::CpuBind {
            SchedulerMode::CpuBind
        } else {
            SchedulerMode::Memory
        };

        let locked = self
            .lock_nodes(&opts.podname, opts.nodename.as_deref(), &opts.node_labels, false)
            .await?;
        let plan = match self.plan_deployment(&locked, &opts, mode).await {
            Ok(plan) => plan,
            Err(e) => {
                locked.unlock().await;
                return Err(e);
            }
        };
        if let Err(e) = self.commit_allocation(&plan).await {
            locked.unlock().await;
            return Err(e);
        }
        tracing::info!(
            pod = %opts.podname,
            app = %opts.name,
            replicas = plan_size(&plan),
            mode = ?mode,
            "deployment planned"
        );

        let (tx, rx) = mpsc::channel(1);
        let cluster = self.clone();
        tokio::spawn(async move {
            let mut workers = JoinSet::new();
            let mut index = 0;
            for (nodename, slices) in &plan {
                let Some(node) = locked.nodes.get(nodename).cloned() else {
                    continue;
                };
                let c = cluster.clone();
                let slices = slices.clone();
                let opts = opts.clone();
                let worker_tx = tx.clone();
                let base_index = index;
                index += slices.len();
                workers.spawn(async move {
                    c.create_on_node(node, slices, opts, mode, base_index, worker_tx)
                        .await;
                });
            }
            drop(tx);
            while workers.join_next().await.is_some() {}
            locked.unlock().await;
        });
        Ok(ReceiverStream::new(rx))
    }

    /// Sequentially create this node's replicas. The image is pulled once
    /// up front; a pull failure fails every replica here.
    async fn create_on_node(
        &self,
        node: Node,
        slices: Vec<ReplicaSlice>,
        opts: DeployOptions,
        mode: SchedulerMode,
        base_index: usize,
        tx: mpsc::Sender<CreateContainerMessage>,
    ) {
        let engine = match self.engines.engine(&node).await {
            Ok(engine) => engine,
            Err(e) => {
                self.fail_node_replicas(&node, &slices, &opts, &e.to_string(), &tx)
                    .await;
                return;
            }
        };
        if let Err(e) = self
            .deadline(self.image_timeout(), engine.image_pull(&opts.image))
            .await
        {
            tracing::error!(node = %node.name, image = %opts.image, error = %e, "image pull failed");
            self.fail_node_replicas(&node, &slices, &opts, &e.to_string(), &tx)
                .await;
            return;
        }

        for (i, slice) in slices.iter().enumerate() {
            let (msg, aborted) = self
                .create_one(engine.as_ref(), &node, slice, &opts, mode, base_index + i)
                .await;
            let delivered = tx.send(msg).await.is_ok();
            if aborted || !delivered {
                // remaining replicas never start; compensate each and emit
                // its terminal message
                self.fail_node_replicas(
                    &node,
                    &slices[i + 1..],
                    &opts,
                    &ArmadaError::Cancelled.to_string(),
                    &tx,
                )
                .await;
                return;
            }
        }
    }

    async fn fail_node_replicas(
        &self,
        node: &Node,
        slices: &[ReplicaSlice],
        opts: &DeployOptions,
        error: &str,
        tx: &mpsc::Sender<CreateContainerMessage>,
    ) {
        for slice in slices {
            self.release_replica(&node.name, &slice.delta).await;
            let msg = CreateContainerMessage {
                podname: opts.podname.clone(),
                nodename: node.name.clone(),
                error: error.to_string(),
                ..Default::default()
            };
            let _ = tx.send(msg).await;
        }
    }

    /// Drive one replica through create → attach → start → register.
    /// Every failure branch removes whatever the engine created, releases
    /// the replica's slice once, and reports through the message. The bool
    /// says whether the worker should abort its remaining replicas.
    async fn create_one(
        &self,
        engine: &dyn Engine,
        node: &Node,
        slice: &ReplicaSlice,
        opts: &DeployOptions,
        mode: SchedulerMode,
        index: usize,
    ) -> (CreateContainerMessage, bool) {
        let name = make_container_name(&opts.name, &opts.entrypoint.name);
        let mut msg = CreateContainerMessage {
            podname: opts.podname.clone(),
            nodename: node.name.clone(),
            name: name.clone(),
            cpu: slice.cpu.clone(),
            quota: opts.cpu_quota,
            memory: opts.memory,
            storage: opts.storage,
            ..Default::default()
        };
        let config = make_container_config(
            &self.config,
            opts,
            node,
            slice,
            mode,
            index,
            self.network.kind(),
            name.clone(),
        );
        let timeout = self.global_timeout();

        let id = match self.deadline(timeout, engine.create(&config)).await {
            Ok(id) => id,
            Err(e) => return self.fail_replica(node, slice, msg, e).await,
        };

        // plugin networks attach before start, then the default bridge goes
        if self.network.kind() == NetworkKind::Plugin && !opts.networks.is_empty() {
            for (network, ipv4) in &opts.networks {
                if let Err(e) = self
                    .deadline(timeout, self.network.connect(engine, &id, network, ipv4))
                    .await
                {
                    tracing::error!(id = %id, network = %network, error = %e, "network attach failed");
                    self.destroy_failed(engine, &id).await;
                    return self.fail_replica(node, slice, msg, e).await;
                }
            }
            if let Err(e) = self.network.disconnect(engine, &id, "bridge").await {
                tracing::warn!(id = %id, error = %e, "detaching default bridge failed");
            }
        }

        if let Err(e) = self.deadline(timeout, engine.start(&id)).await {
            self.destroy_failed(engine, &id).await;
            return self.fail_replica(node, slice, msg, e).await;
        }

        let info = match self.deadline(timeout, engine.inspect(&id)).await {
            Ok(info) => info,
            Err(e) => {
                self.destroy_failed(engine, &id).await;
                return self.fail_replica(node, slice, msg, e).await;
            }
        };
        msg.id = info.id.clone();

        let node_ip = node.ip();
        for port in &opts.entrypoint.publish {
            let key = if port.contains('/') {
                port.clone()
            } else {
                format!("{port}/tcp")
            };
            let host_port = info.ports.get(&key).cloned().unwrap_or_else(|| port.clone());
            msg.publish
                .insert(port.clone(), format!("{node_ip}:{host_port}"));
        }

        if let Some(hook) = &opts.entrypoint.hook {
            if !hook.after_start.is_empty() && !opts.ignore_hook {
                let cmd: Vec<String> = hook
                    .after_start
                    .split_whitespace()
                    .map(String::from)
                    .collect();
                match self
                    .deadline(timeout, engine.exec(&id, &cmd, &[], &config.workdir))
                    .await
                {
                    Ok(output) => msg.hook_output = output,
                    Err(e) if hook.force => {
                        self.destroy_failed(engine, &id).await;
                        return self.fail_replica(node, slice, msg, e).await;
                    }
                    Err(e) => {
                        tracing::warn!(id = %id, error = %e, "after-start hook failed");
                    }
                }
            }
        }

        let container = Container {
            id: info.id.clone(),
            podname: opts.podname.clone(),
            nodename: node.name.clone(),
            name,
            cpu: slice.cpu.clone(),
            quota: opts.cpu_quota,
            memory: opts.memory,
            storage: opts.storage,
            volumes: config.binds.clone(),
            volume_plan: slice.volume.usage.clone(),
            image: opts.image.clone(),
            labels: config.labels.clone(),
        };
        if let Err(e) = self.store.add_container(&container).await {
            tracing::error!(id = %info.id, error = %e, "registering container failed");
            self.destroy_failed(engine, &info.id).await;
            return self.fail_replica(node, slice, msg, e).await;
        }

        let status = ContainerStatus {
            id: info.id.clone(),
            running: true,
            healthy: false,
            networks: info.networks.clone(),
            updated_at: now_ms(),
        };
        if let Err(e) = self
            .store
            .set_container_status(&container, &status, None)
            .await
        {
            tracing::warn!(id = %info.id, error = %e, "writing initial status failed");
        }

        msg.success = true;
        (msg, false)
    }

    async fn fail_replica(
        &self,
        node: &Node,
        slice: &ReplicaSlice,
        mut msg: CreateContainerMessage,
        e: ArmadaError,
    ) -> (CreateContainerMessage, bool) {
        self.release_replica(&node.name, &slice.delta).await;
        let aborted = matches!(e, ArmadaError::Cancelled);
        msg.error = e.to_string();
        msg.success = false;
        (msg, aborted)
    }

    pub(crate) async fn destroy_failed(&self, engine: &dyn Engine, id: &str) {
        if let Err(e) = engine.remove(id, false, true).await {
            tracing::error!(id, error = %e, "removing failed container");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    use armada_common::{Hook, SchedulerMode};

    use crate::testutil::{deploy_opts, seed_pod, test_cluster, test_node, GIB};

    async fn drain(
        stream: ReceiverStream<CreateContainerMessage>,
    ) -> Vec<CreateContainerMessage> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_memory_deploy_across_nodes() {
        let (cluster, engine, store) = test_cluster();
        seed_pod(
            &store,
            "p1",
            SchedulerMode::Memory,
            &[test_node("a", "p1", 8), test_node("b", "p1", 4)],
        )
        .await;

        let opts = deploy_opts("p1", 6);
        let stream = cluster.create_container(opts).await.unwrap();
        let msgs = drain(stream).await;

        assert_eq!(msgs.len(), 6);
        assert!(msgs.iter().all(|m| m.success), "{msgs:?}");
        assert_eq!(msgs.iter().filter(|m| m.nodename == "a").count(), 4);
        assert_eq!(msgs.iter().filter(|m| m.nodename == "b").count(), 2);

        // capacity conservation: spent memory equals the replicas' sum
        let node_a = store.get_node("a").await.unwrap();
        assert_eq!(node_a.init_mem - node_a.mem_cap, 4 * GIB);
        let node_b = store.get_node("b").await.unwrap();
        assert_eq!(node_b.init_mem - node_b.mem_cap, 2 * GIB);

        assert_eq!(engine.running_count(), 6);
        for msg in &msgs {
            let container = store.get_container(&msg.id).await.unwrap();
            assert_eq!(container.memory, GIB);
            assert!(msg.publish.contains_key("8080"));
        }
    }

    #[tokio::test]
    async fn test_cpu_priority_deploy() {
        let (cluster, engine, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::CpuBind, &[test_node("a", "p1", 8)]).await;

        let mut opts = deploy_opts("p1", 3);
        opts.cpu_quota = 0.5;
        let stream = cluster.create_container(opts).await.unwrap();
        let mut msgs = drain(stream).await;

        assert_eq!(msgs.len(), 3);
        assert!(msgs.iter().all(|m| m.success));
        msgs.sort_by_key(|m| m.cpu.0.keys().next().cloned());
        assert_eq!(msgs.iter().filter(|m| m.cpu.0.contains_key("0")).count(), 2);
        assert_eq!(msgs.iter().filter(|m| m.cpu.0.contains_key("1")).count(), 1);

        let node = store.get_node("a").await.unwrap();
        assert_eq!(node.cpu.0["0"], 0);
        assert_eq!(node.cpu.0["1"], 5);
        assert!((node.cpu_used - 1.5).abs() < 1e-9);

        for c in engine.containers() {
            assert!(!c.config.cpuset_cpus.is_empty());
            assert_eq!(c.config.cpu_shares, 512);
        }
    }

    #[tokio::test]
    async fn test_partial_failure_on_start_compensates() {
        let (cluster, engine, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;
        engine.fail_nth("start", 2);

        let opts = deploy_opts("p1", 3);
        let stream = cluster.create_container(opts).await.unwrap();
        let msgs = drain(stream).await;

        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs.iter().filter(|m| m.success).count(), 2);
        let failed: Vec<_> = msgs.iter().filter(|m| !m.success).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.contains("start"));

        // node capacity reflects exactly the two survivors
        let node = store.get_node("a").await.unwrap();
        assert_eq!(node.init_mem - node.mem_cap, 2 * GIB);
        // the failed container is gone from the engine
        assert_eq!(engine.containers().len(), 2);
        assert_eq!(engine.running_count(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_resources_fails_before_stream() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;

        let opts = deploy_opts("p1", 100);
        let err = cluster.create_container(opts).await.unwrap_err();
        assert!(matches!(err, ArmadaError::InsufficientRes(_)));

        // no capacity deltas, and the node locks are free again
        assert_eq!(store.get_node("a").await.unwrap().mem_cap, 8 * GIB);
        let lock = store.create_lock("node/p1/a").await.unwrap();
        lock.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;

        let mut opts = deploy_opts("p1", 1);
        opts.memory = 1024;
        assert!(matches!(
            cluster.create_container(opts).await,
            Err(ArmadaError::BadMemory(1024))
        ));

        let mut opts = deploy_opts("p1", 0);
        opts.nodes_limit = 0;
        assert!(matches!(
            cluster.create_container(opts).await,
            Err(ArmadaError::BadCount(0))
        ));
    }

    #[tokio::test]
    async fn test_image_pull_failure_fails_node_replicas() {
        let (cluster, engine, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;
        engine.fail_image("app:1");

        let opts = deploy_opts("p1", 2);
        let stream = cluster.create_container(opts).await.unwrap();
        let msgs = drain(stream).await;

        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| !m.success));
        assert!(msgs[0].error.contains("pull"));
        // everything released
        assert_eq!(store.get_node("a").await.unwrap().mem_cap, 8 * GIB);
        assert!(engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_network_attach_failure_removes_container() {
        let (cluster, engine, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;
        engine.fail_nth("network_connect", 1);

        let mut opts = deploy_opts("p1", 1);
        opts.networks.insert("calico".to_string(), String::new());
        let stream = cluster.create_container(opts).await.unwrap();
        let msgs = drain(stream).await;

        assert_eq!(msgs.len(), 1);
        assert!(!msgs[0].success);
        assert!(engine.containers().is_empty());
        assert_eq!(store.get_node("a").await.unwrap().mem_cap, 8 * GIB);
    }

    #[tokio::test]
    async fn test_forced_hook_failure_fails_replica() {
        let (cluster, engine, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;
        engine.fail_nth("exec", 1);

        let mut opts = deploy_opts("p1", 1);
        opts.entrypoint.hook = Some(Hook {
            after_start: "./warm".to_string(),
            force: true,
            ..Default::default()
        });
        let stream = cluster.create_container(opts).await.unwrap();
        let msgs = drain(stream).await;

        assert!(!msgs[0].success);
        assert!(engine.containers().is_empty());
        assert_eq!(store.get_node("a").await.unwrap().mem_cap, 8 * GIB);
    }

    #[tokio::test]
    async fn test_lenient_hook_failure_is_logged_only() {
        let (cluster, engine, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;
        engine.fail_nth("exec", 1);

        let mut opts = deploy_opts("p1", 1);
        opts.entrypoint.hook = Some(Hook {
            after_start: "./warm".to_string(),
            force: false,
            ..Default::default()
        });
        let stream = cluster.create_container(opts).await.unwrap();
        let msgs = drain(stream).await;

        assert!(msgs[0].success);
        assert_eq!(engine.running_count(), 1);
        assert_eq!(engine.execs().len(), 1);
    }

    #[tokio::test]
    async fn test_public_host_claims_no_cpu() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::CpuBind, &[test_node("a", "p1", 8)]).await;

        let mut opts = deploy_opts("p1", 2);
        opts.cpu_quota = 0.0;
        let stream = cluster.create_container(opts).await.unwrap();
        let msgs = drain(stream).await;

        assert_eq!(msgs.iter().filter(|m| m.success).count(), 2);
        let node = store.get_node("a").await.unwrap();
        assert_eq!(node.cpu.total(), 20);
        assert_eq!(node.cpu_used, 0.0);
    }
}
