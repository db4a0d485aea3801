use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use tokio_stream::StreamExt;

use armada_common::{
    ArmadaError, Container, ContainerStatus, Node, Pod, ResourceDelta, ResourceOp, Result,
    SchedulerMode,
};

use crate::kv::MetaStore;
use crate::lock::DistributedLock;

const CAS_RETRY: usize = 5;

/// One status change for a watched application.
#[derive(Debug, Clone)]
pub struct ContainerStatusEvent {
    pub id: String,
    /// `None` when the status record was deleted.
    pub status: Option<ContainerStatus>,
}

pub type StatusStream = Pin<Box<dyn Stream<Item = ContainerStatusEvent> + Send>>;

/// Typed record store over a [`MetaStore`] backend.
///
/// Records are JSON documents under a configured prefix:
///
///   {prefix}/pods/{name}
///   {prefix}/nodes/{name}
///   {prefix}/containers/{id}
///   {prefix}/node-containers/{nodename}/{id}      (index)
///   {prefix}/deploy/{app}/{entry}/{node}/{id}     (index)
///   {prefix}/status/{app}/{entry}/{node}/{id}
///   {prefix}/locks/{name}
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn MetaStore>,
    prefix: String,
    lock_ttl: Duration,
}

fn kv_err(e: anyhow::Error) -> ArmadaError {
    ArmadaError::Store(e.to_string())
}

fn decode_err(e: serde_json::Error) -> ArmadaError {
    ArmadaError::Store(format!("corrupt record: {e}"))
}

impl Store {
    /// `lock_timeout` doubles as the lock TTL and the acquisition deadline.
    pub fn new(kv: Arc<dyn MetaStore>, prefix: &str, lock_timeout: Duration) -> Self {
        Self {
            kv,
            prefix: prefix.trim_end_matches('/').to_string(),
            lock_ttl: lock_timeout,
        }
    }

    fn pod_key(&self, name: &str) -> String {
        format!("{}/pods/{}", self.prefix, name)
    }

    fn node_key(&self, name: &str) -> String {
        format!("{}/nodes/{}", self.prefix, name)
    }

    fn container_key(&self, id: &str) -> String {
        format!("{}/containers/{}", self.prefix, id)
    }

    fn node_container_key(&self, nodename: &str, id: &str) -> String {
        format!("{}/node-containers/{}/{}", self.prefix, nodename, id)
    }

    fn deploy_key(&self, app: &str, entry: &str, node: &str, id: &str) -> String {
        format!("{}/deploy/{}/{}/{}/{}", self.prefix, app, entry, node, id)
    }

    fn status_key(&self, app: &str, entry: &str, node: &str, id: &str) -> String {
        format!("{}/status/{}/{}/{}/{}", self.prefix, app, entry, node, id)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}/locks/{}", self.prefix, name)
    }

    // -- pods --

    pub async fn add_pod(&self, name: &str, desc: &str, scheduler: SchedulerMode) -> Result<Pod> {
        let pod = Pod {
            name: name.to_string(),
            desc: desc.to_string(),
            scheduler,
        };
        let bytes = serde_json::to_vec(&pod).map_err(decode_err)?;
        let (ok, _) = self
            .kv
            .compare_and_swap(&self.pod_key(name), 0, bytes)
            .await
            .map_err(kv_err)?;
        if !ok {
            return Err(ArmadaError::Store(format!("pod {name} already exists")));
        }
        Ok(pod)
    }

    pub async fn get_pod(&self, name: &str) -> Result<Pod> {
        let (bytes, _) = self
            .kv
            .get(&self.pod_key(name))
            .await
            .map_err(kv_err)?
            .ok_or_else(|| ArmadaError::not_found("pod", name))?;
        serde_json::from_slice(&bytes).map_err(decode_err)
    }

    pub async fn remove_pod(&self, name: &str) -> Result<()> {
        self.kv.delete(&self.pod_key(name)).await.map_err(kv_err)?;
        Ok(())
    }

    pub async fn list_pods(&self) -> Result<Vec<Pod>> {
        let prefix = format!("{}/pods/", self.prefix);
        let mut out = Vec::new();
        for (_, bytes, _) in self.kv.list_prefix(&prefix).await.map_err(kv_err)? {
            out.push(serde_json::from_slice(&bytes).map_err(decode_err)?);
        }
        Ok(out)
    }

    // -- nodes --

    pub async fn add_node(&self, node: &Node) -> Result<()> {
        let bytes = serde_json::to_vec(node).map_err(decode_err)?;
        let (ok, _) = self
            .kv
            .compare_and_swap(&self.node_key(&node.name), 0, bytes)
            .await
            .map_err(kv_err)?;
        if !ok {
            return Err(ArmadaError::Store(format!("node {} already exists", node.name)));
        }
        Ok(())
    }

    pub async fn get_node(&self, name: &str) -> Result<Node> {
        Ok(self.get_node_with_rev(name).await?.0)
    }

    async fn get_node_with_rev(&self, name: &str) -> Result<(Node, u64)> {
        let (bytes, rev) = self
            .kv
            .get(&self.node_key(name))
            .await
            .map_err(kv_err)?
            .ok_or_else(|| ArmadaError::not_found("node", name))?;
        Ok((serde_json::from_slice(&bytes).map_err(decode_err)?, rev))
    }

    /// Unconditional node write; used for metadata changes (labels,
    /// availability) made under the node lock. Capacity changes go through
    /// [`Store::update_node_resource`].
    pub async fn update_node(&self, node: &Node) -> Result<()> {
        let bytes = serde_json::to_vec(node).map_err(decode_err)?;
        self.kv
            .put(&self.node_key(&node.name), bytes, None)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    pub async fn remove_node(&self, name: &str) -> Result<()> {
        self.kv.delete(&self.node_key(name)).await.map_err(kv_err)?;
        Ok(())
    }

    /// Candidate nodes, sorted by name. `nodename` narrows to a single node;
    /// `labels` must all match; unavailable nodes are skipped unless `all`.
    pub async fn get_nodes(
        &self,
        podname: &str,
        nodename: Option<&str>,
        labels: &HashMap<String, String>,
        all: bool,
    ) -> Result<Vec<Node>> {
        let prefix = format!("{}/nodes/", self.prefix);
        let mut out = Vec::new();
        for (_, bytes, _) in self.kv.list_prefix(&prefix).await.map_err(kv_err)? {
            let node: Node = serde_json::from_slice(&bytes).map_err(decode_err)?;
            if node.podname != podname {
                continue;
            }
            if let Some(wanted) = nodename {
                if node.name != wanted {
                    continue;
                }
            }
            if !all && !node.available {
                continue;
            }
            if !node.matches_labels(labels) {
                continue;
            }
            out.push(node);
        }
        Ok(out)
    }

    /// Atomically move capacity on a node record: `Sub` claims an
    /// allocation, `Add` releases it. Compare-and-swap on the record
    /// revision keeps concurrent writers consistent; invariant violations
    /// (free exceeding totals, oversubtraction) abort without writing.
    pub async fn update_node_resource(
        &self,
        nodename: &str,
        delta: &ResourceDelta,
        op: ResourceOp,
    ) -> Result<Node> {
        for _ in 0..CAS_RETRY {
            let (mut node, rev) = self.get_node_with_rev(nodename).await?;
            apply_delta(&mut node, delta, op)?;
            let bytes = serde_json::to_vec(&node).map_err(decode_err)?;
            let (ok, _) = self
                .kv
                .compare_and_swap(&self.node_key(nodename), rev, bytes)
                .await
                .map_err(kv_err)?;
            if ok {
                return Ok(node);
            }
            tracing::debug!(node = nodename, op = op.as_str(), "resource update conflict, retrying");
        }
        Err(ArmadaError::Store(format!(
            "updating resources of node {nodename} kept conflicting"
        )))
    }

    // -- containers --

    pub async fn add_container(&self, container: &Container) -> Result<()> {
        let bytes = serde_json::to_vec(container).map_err(decode_err)?;
        let (ok, _) = self
            .kv
            .compare_and_swap(&self.container_key(&container.id), 0, bytes)
            .await
            .map_err(kv_err)?;
        if !ok {
            return Err(ArmadaError::Store(format!(
                "container {} already exists",
                container.id
            )));
        }
        self.kv
            .put(
                &self.node_container_key(&container.nodename, &container.id),
                container.name.clone().into_bytes(),
                None,
            )
            .await
            .map_err(kv_err)?;
        if let Some((app, entry, _)) = Container::parse_name(&container.name) {
            self.kv
                .put(
                    &self.deploy_key(&app, &entry, &container.nodename, &container.id),
                    Vec::new(),
                    None,
                )
                .await
                .map_err(kv_err)?;
        }
        Ok(())
    }

    pub async fn get_container(&self, id: &str) -> Result<Container> {
        let (bytes, _) = self
            .kv
            .get(&self.container_key(id))
            .await
            .map_err(kv_err)?
            .ok_or_else(|| ArmadaError::not_found("container", id))?;
        serde_json::from_slice(&bytes).map_err(decode_err)
    }

    pub async fn get_containers(&self, ids: &[String]) -> Result<Vec<Container>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_container(id).await?);
        }
        Ok(out)
    }

    pub async fn list_containers(
        &self,
        appname: Option<&str>,
        entrypoint: Option<&str>,
        nodename: Option<&str>,
    ) -> Result<Vec<Container>> {
        let prefix = format!("{}/containers/", self.prefix);
        let mut out = Vec::new();
        for (_, bytes, _) in self.kv.list_prefix(&prefix).await.map_err(kv_err)? {
            let container: Container = serde_json::from_slice(&bytes).map_err(decode_err)?;
            if let Some(wanted) = nodename {
                if container.nodename != wanted {
                    continue;
                }
            }
            if appname.is_some() || entrypoint.is_some() {
                let Some((app, entry, _)) = Container::parse_name(&container.name) else {
                    continue;
                };
                if appname.is_some_and(|w| w != app) {
                    continue;
                }
                if entrypoint.is_some_and(|w| w != entry) {
                    continue;
                }
            }
            out.push(container);
        }
        Ok(out)
    }

    pub async fn list_node_containers(&self, nodename: &str) -> Result<Vec<Container>> {
        let prefix = format!("{}/node-containers/{}/", self.prefix, nodename);
        let mut out = Vec::new();
        for (key, _, _) in self.kv.list_prefix(&prefix).await.map_err(kv_err)? {
            let Some(id) = key.rsplit('/').next() else { continue };
            match self.get_container(id).await {
                Ok(c) => out.push(c),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub async fn remove_container(&self, container: &Container) -> Result<()> {
        self.kv
            .delete(&self.container_key(&container.id))
            .await
            .map_err(kv_err)?;
        self.kv
            .delete(&self.node_container_key(&container.nodename, &container.id))
            .await
            .map_err(kv_err)?;
        if let Some((app, entry, _)) = Container::parse_name(&container.name) {
            self.kv
                .delete(&self.deploy_key(&app, &entry, &container.nodename, &container.id))
                .await
                .map_err(kv_err)?;
            self.kv
                .delete(&self.status_key(&app, &entry, &container.nodename, &container.id))
                .await
                .map_err(kv_err)?;
        }
        Ok(())
    }

    /// How many replicas of `appname/entrypoint` each node already runs.
    pub async fn count_deployed(
        &self,
        appname: &str,
        entrypoint: &str,
    ) -> Result<HashMap<String, usize>> {
        let prefix = format!("{}/deploy/{}/{}/", self.prefix, appname, entrypoint);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for (key, _, _) in self.kv.list_prefix(&prefix).await.map_err(kv_err)? {
            let rest = &key[prefix.len()..];
            if let Some((node, _id)) = rest.split_once('/') {
                *counts.entry(node.to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    // -- container status --

    pub async fn set_container_status(
        &self,
        container: &Container,
        status: &ContainerStatus,
        ttl_ms: Option<u64>,
    ) -> Result<()> {
        let Some((app, entry, _)) = Container::parse_name(&container.name) else {
            return Err(ArmadaError::Store(format!(
                "container name {} is not parseable",
                container.name
            )));
        };
        let bytes = serde_json::to_vec(status).map_err(decode_err)?;
        self.kv
            .put(
                &self.status_key(&app, &entry, &container.nodename, &container.id),
                bytes,
                ttl_ms,
            )
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    /// Stream status changes for one application entrypoint.
    pub async fn watch_container_status(
        &self,
        appname: &str,
        entrypoint: &str,
    ) -> Result<StatusStream> {
        let prefix = format!("{}/status/{}/{}/", self.prefix, appname, entrypoint);
        let raw = self
            .kv
            .watch_prefix(&prefix, None)
            .await
            .map_err(kv_err)?;
        let stream = raw.filter_map(|ev| {
            let id = parse_status_key(&ev.key)?.3;
            let status = match &ev.value {
                Some(bytes) => Some(serde_json::from_slice(bytes).ok()?),
                None => None,
            };
            Some(ContainerStatusEvent { id, status })
        });
        Ok(Box::pin(stream))
    }

    // -- locks --

    /// Acquire the named distributed lock, or [`ArmadaError::LockTimeout`].
    pub async fn create_lock(&self, name: &str) -> Result<DistributedLock> {
        let key = self.lock_key(name);
        let token = self
            .kv
            .lock(&key, self.lock_ttl, self.lock_ttl)
            .await
            .map_err(kv_err)?
            .ok_or_else(|| ArmadaError::LockTimeout(name.to_string()))?;
        Ok(DistributedLock::new(self.kv.clone(), token))
    }
}

fn apply_delta(node: &mut Node, delta: &ResourceDelta, op: ResourceOp) -> Result<()> {
    match op {
        ResourceOp::Sub => {
            node.cpu.sub(&delta.cpu)?;
            if delta.memory > node.mem_cap {
                return Err(ArmadaError::InsufficientRes(format!(
                    "node {} has {} bytes memory free, need {}",
                    node.name, node.mem_cap, delta.memory
                )));
            }
            node.mem_cap -= delta.memory;
            if node.init_storage > 0 {
                if delta.storage > node.storage_cap {
                    return Err(ArmadaError::InsufficientRes(format!(
                        "node {} has {} bytes storage free, need {}",
                        node.name, node.storage_cap, delta.storage
                    )));
                }
                node.storage_cap -= delta.storage;
            }
            node.volume.sub(&delta.volume)?;
            node.cpu_used += delta.quota;
        }
        ResourceOp::Add => {
            node.cpu.add(&delta.cpu);
            for (id, share) in &node.cpu.0 {
                let init = node.init_cpu.0.get(id).copied().unwrap_or(0);
                if *share > init {
                    return Err(ArmadaError::Store(format!(
                        "cpu {} on node {} would exceed its capacity",
                        id, node.name
                    )));
                }
            }
            if node.mem_cap + delta.memory > node.init_mem {
                return Err(ArmadaError::Store(format!(
                    "memory release on node {} would exceed its capacity",
                    node.name
                )));
            }
            node.mem_cap += delta.memory;
            if node.init_storage > 0 {
                node.storage_cap = (node.storage_cap + delta.storage).min(node.init_storage);
            }
            node.volume.add(&delta.volume);
            node.cpu_used = (node.cpu_used - delta.quota).max(0.0);
        }
    }
    Ok(())
}

/// `{prefix}/status/app/entry/node/id` → (app, entry, node, id).
pub fn parse_status_key(key: &str) -> Option<(String, String, String, String)> {
    let idx = key.find("/status/")?;
    let rest = &key[idx + "/status/".len()..];
    let parts: Vec<&str> = rest.splitn(4, '/').collect();
    match parts.as_slice() {
        [app, entry, node, id] => Some((
            app.to_string(),
            entry.to_string(),
            node.to_string(),
            id.to_string(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_common::{CpuMap, VolumeMap};

    use crate::memory::MemoryStore;

    fn test_store() -> Store {
        Store::new(
            Arc::new(MemoryStore::new()),
            "/armada",
            Duration::from_millis(200),
        )
    }

    fn test_node(name: &str, podname: &str) -> Node {
        let cpu: CpuMap = [("0".to_string(), 10), ("1".to_string(), 10)]
            .into_iter()
            .collect();
        Node {
            name: name.to_string(),
            endpoint: "tcp://10.0.0.1:2376".to_string(),
            podname: podname.to_string(),
            cpu: cpu.clone(),
            cpu_used: 0.0,
            init_cpu: cpu,
            mem_cap: 1 << 30,
            init_mem: 1 << 30,
            storage_cap: 1 << 32,
            init_storage: 1 << 32,
            volume: [("vol0".to_string(), 1000_i64)].into_iter().collect(),
            init_volume: [("vol0".to_string(), 1000_i64)].into_iter().collect(),
            numa: HashMap::new(),
            numa_memory: HashMap::new(),
            labels: HashMap::new(),
            available: true,
        }
    }

    fn test_container(id: &str, nodename: &str) -> Container {
        Container {
            id: id.to_string(),
            podname: "pod".to_string(),
            nodename: nodename.to_string(),
            name: format!("app_web_{id}"),
            cpu: CpuMap::new(),
            quota: 1.0,
            memory: 512 << 20,
            storage: 0,
            volumes: vec![],
            volume_plan: VolumeMap::new(),
            image: "app:1".to_string(),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_parse_status_key() {
        let (app, entry, node, id) =
            parse_status_key("/armada/status/appname/entry/node/id").unwrap();
        assert_eq!(app, "appname");
        assert_eq!(entry, "entry");
        assert_eq!(node, "node");
        assert_eq!(id, "id");
        assert!(parse_status_key("/armada/status/short").is_none());
    }

    #[tokio::test]
    async fn test_pod_round_trip() {
        let s = test_store();
        s.add_pod("p1", "test pod", SchedulerMode::Memory).await.unwrap();
        assert!(s.add_pod("p1", "", SchedulerMode::Memory).await.is_err());

        let pod = s.get_pod("p1").await.unwrap();
        assert_eq!(pod.desc, "test pod");

        s.remove_pod("p1").await.unwrap();
        assert!(s.get_pod("p1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_get_nodes_filters() {
        let s = test_store();
        let mut a = test_node("a", "p1");
        a.labels.insert("disk".to_string(), "ssd".to_string());
        let mut b = test_node("b", "p1");
        b.available = false;
        let c = test_node("c", "p2");
        for n in [&a, &b, &c] {
            s.add_node(n).await.unwrap();
        }

        let empty = HashMap::new();
        let got = s.get_nodes("p1", None, &empty, false).await.unwrap();
        assert_eq!(got.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(), vec!["a"]);

        let got = s.get_nodes("p1", None, &empty, true).await.unwrap();
        assert_eq!(got.len(), 2);

        let mut labels = HashMap::new();
        labels.insert("disk".to_string(), "hdd".to_string());
        assert!(s.get_nodes("p1", None, &labels, true).await.unwrap().is_empty());

        let got = s.get_nodes("p1", Some("b"), &empty, true).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "b");
    }

    #[tokio::test]
    async fn test_update_node_resource_round_trip() {
        let s = test_store();
        s.add_node(&test_node("a", "p1")).await.unwrap();

        let delta = ResourceDelta {
            cpu: [("0".to_string(), 5_i64)].into_iter().collect(),
            quota: 0.5,
            memory: 512 << 20,
            storage: 1 << 20,
            volume: [("vol0".to_string(), 100_i64)].into_iter().collect(),
        };

        let after = s.update_node_resource("a", &delta, ResourceOp::Sub).await.unwrap();
        assert_eq!(after.cpu.0["0"], 5);
        assert_eq!(after.mem_cap, (1 << 30) - (512 << 20));
        assert_eq!(after.volume.0["vol0"], 900);
        assert!((after.cpu_used - 0.5).abs() < f64::EPSILON);

        let restored = s.update_node_resource("a", &delta, ResourceOp::Add).await.unwrap();
        let original = test_node("a", "p1");
        assert_eq!(restored.cpu, original.cpu);
        assert_eq!(restored.mem_cap, original.mem_cap);
        assert_eq!(restored.storage_cap, original.storage_cap);
        assert_eq!(restored.volume, original.volume);
        assert_eq!(restored.cpu_used, 0.0);
    }

    #[tokio::test]
    async fn test_update_node_resource_rejects_oversubtraction() {
        let s = test_store();
        s.add_node(&test_node("a", "p1")).await.unwrap();

        let delta = ResourceDelta {
            memory: 2 << 30,
            ..Default::default()
        };
        assert!(matches!(
            s.update_node_resource("a", &delta, ResourceOp::Sub).await,
            Err(ArmadaError::InsufficientRes(_))
        ));
        // nothing was written
        assert_eq!(s.get_node("a").await.unwrap().mem_cap, 1 << 30);
    }

    #[tokio::test]
    async fn test_container_round_trip() {
        let s = test_store();
        let c = test_container("cid1", "a");
        s.add_container(&c).await.unwrap();

        let got = s.get_container("cid1").await.unwrap();
        assert_eq!(got.name, c.name);

        let counts = s.count_deployed("app", "web").await.unwrap();
        assert_eq!(counts.get("a"), Some(&1));

        let on_node = s.list_node_containers("a").await.unwrap();
        assert_eq!(on_node.len(), 1);

        s.remove_container(&c).await.unwrap();
        assert!(s.get_container("cid1").await.unwrap_err().is_not_found());
        assert!(s.count_deployed("app", "web").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_containers_filters() {
        let s = test_store();
        s.add_container(&test_container("c1", "a")).await.unwrap();
        let mut other = test_container("c2", "b");
        other.name = "other_api_x1y2z3".to_string();
        s.add_container(&other).await.unwrap();

        let got = s.list_containers(Some("app"), None, None).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "c1");

        let got = s.list_containers(None, Some("api"), Some("b")).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "c2");

        assert!(s.list_containers(Some("app"), None, Some("b")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_timeout_surfaces_as_error() {
        let s = test_store();
        let held = s.create_lock("node/p1/a").await.unwrap();
        let err = s.create_lock("node/p1/a").await.unwrap_err();
        assert!(matches!(err, ArmadaError::LockTimeout(_)));
        held.unlock().await.unwrap();

        let again = s.create_lock("node/p1/a").await.unwrap();
        again.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_container_status() {
        let s = test_store();
        let c = test_container("c1", "a");
        let mut stream = s.watch_container_status("app", "web").await.unwrap();

        let status = ContainerStatus {
            id: "c1".to_string(),
            running: true,
            healthy: true,
            ..Default::default()
        };
        s.set_container_status(&c, &status, None).await.unwrap();

        let ev = stream.next().await.unwrap();
        assert_eq!(ev.id, "c1");
        assert_eq!(ev.status.unwrap(), status);
    }
}
