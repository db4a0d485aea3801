use async_trait::async_trait;

use armada_common::Result;

use crate::Engine;

/// Which plane wires containers into networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    /// Engine-level network plugin: attach before start, detach bridge.
    Plugin,
    /// An in-container agent handles wiring; the launcher gets told whether
    /// networking is wanted and the engine side does nothing.
    Agent,
    /// No managed networking.
    None,
}

/// Network attach/detach seam. Calls are directed at the engine that owns
/// the container, mirroring how the runtime scopes its network operations.
#[async_trait]
pub trait Network: Send + Sync {
    fn kind(&self) -> NetworkKind;

    async fn connect(&self, engine: &dyn Engine, id: &str, network: &str, ipv4: &str)
        -> Result<()>;

    async fn disconnect(&self, engine: &dyn Engine, id: &str, network: &str) -> Result<()>;
}

/// Delegates to the owning engine's network operations.
pub struct PluginNetwork;

#[async_trait]
impl Network for PluginNetwork {
    fn kind(&self) -> NetworkKind {
        NetworkKind::Plugin
    }

    async fn connect(
        &self,
        engine: &dyn Engine,
        id: &str,
        network: &str,
        ipv4: &str,
    ) -> Result<()> {
        engine.network_connect(id, network, ipv4).await
    }

    async fn disconnect(&self, engine: &dyn Engine, id: &str, network: &str) -> Result<()> {
        engine.network_disconnect(id, network).await
    }
}

/// Used for the agent and unmanaged modes; attach/detach are no-ops.
pub struct NoopNetwork {
    kind: NetworkKind,
}

impl NoopNetwork {
    pub fn agent() -> Self {
        Self {
            kind: NetworkKind::Agent,
        }
    }

    pub fn none() -> Self {
        Self {
            kind: NetworkKind::None,
        }
    }
}

#[async_trait]
impl Network for NoopNetwork {
    fn kind(&self) -> NetworkKind {
        self.kind
    }

    async fn connect(
        &self,
        _engine: &dyn Engine,
        _id: &str,
        _network: &str,
        _ipv4: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self, _engine: &dyn Engine, _id: &str, _network: &str) -> Result<()> {
        Ok(())
    }
}
