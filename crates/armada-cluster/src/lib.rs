//! The orchestrator: turns deployment requests into per-container outcome
//! streams, drives in-place replacement, image builds, and the pod/node/
//! container bookkeeping around them.

pub mod build;
pub mod container;
pub mod create;
pub mod lock;
pub mod node;
pub mod options;
pub mod pod;
pub mod remove;
pub mod replace;
pub mod resource;
pub mod send;
pub mod source;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use armada_common::{ArmadaError, Config, Node, Result};
use armada_engine::{DockerCli, Engine, Network};
use armada_meta::Store;

pub use build::BuildOptions;
pub use node::AddNodeOptions;
pub use source::{GitScm, Source};

/// Resolves the engine driving a node. One seam for swapping the docker CLI
/// against the in-process twin.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn engine(&self, node: &Node) -> Result<Arc<dyn Engine>>;
}

/// Docker CLI per node endpoint, cached.
#[derive(Default)]
pub struct DockerFactory {
    cache: Mutex<HashMap<String, Arc<dyn Engine>>>,
}

#[async_trait]
impl EngineFactory for DockerFactory {
    async fn engine(&self, node: &Node) -> Result<Arc<dyn Engine>> {
        let mut cache = self.cache.lock().unwrap();
        let engine = cache.entry(node.endpoint.clone()).or_insert_with(|| {
            let engine: Arc<dyn Engine> = Arc::new(DockerCli::new(&node.endpoint));
            engine
        });
        Ok(engine.clone())
    }
}

/// Hands every node the same engine; tests wire the memory twin through
/// this.
pub struct StaticFactory(pub Arc<dyn Engine>);

#[async_trait]
impl EngineFactory for StaticFactory {
    async fn engine(&self, _node: &Node) -> Result<Arc<dyn Engine>> {
        Ok(self.0.clone())
    }
}

#[derive(Clone)]
pub struct Cluster {
    pub(crate) config: Config,
    pub(crate) store: Store,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) engines: Arc<dyn EngineFactory>,
    pub(crate) source: Option<Arc<dyn Source>>,
}

impl Cluster {
    pub fn new(
        config: Config,
        store: Store,
        network: Arc<dyn Network>,
        engines: Arc<dyn EngineFactory>,
        source: Option<Arc<dyn Source>>,
    ) -> Self {
        Self {
            config,
            store,
            network,
            engines,
            source,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.config.global_timeout.max(1))
    }

    pub(crate) fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.config.image_timeout.max(1))
    }

    /// Deadline wrapper for external calls; an elapsed deadline surfaces as
    /// cancellation so callers can skip remaining work.
    pub(crate) async fn deadline<T>(
        &self,
        limit: Duration,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(ArmadaError::Cancelled),
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
