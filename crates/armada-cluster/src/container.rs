use armada_common::{Container, Result};
use armada_engine::{Engine, LogStream};
use armada_meta::StatusStream;

use crate::Cluster;

impl Cluster {
    pub async fn get_container(&self, id: &str) -> Result<Container> {
        self.store.get_container(id).await
    }

    pub async fn get_containers(&self, ids: &[String]) -> Result<Vec<Container>> {
        self.store.get_containers(ids).await
    }

    pub async fn list_containers(
        &self,
        appname: Option<&str>,
        entrypoint: Option<&str>,
        nodename: Option<&str>,
    ) -> Result<Vec<Container>> {
        self.store.list_containers(appname, entrypoint, nodename).await
    }

    /// Follow status updates for an application entrypoint; the agent side
    /// writes them, this side only relays.
    pub async fn watch_container_status(
        &self,
        appname: &str,
        entrypoint: &str,
    ) -> Result<StatusStream> {
        self.store.watch_container_status(appname, entrypoint).await
    }

    /// Stream a container's output.
    pub async fn container_logs(&self, id: &str, follow: bool) -> Result<LogStream> {
        let container = self.store.get_container(id).await?;
        let node = self.store.get_node(&container.nodename).await?;
        let engine = self.engines.engine(&node).await?;
        engine.attach(id, follow).await
    }

    /// Run a command inside a container and return its output.
    pub async fn execute_container(
        &self,
        id: &str,
        cmd: &[String],
        envs: &[String],
        workdir: &str,
    ) -> Result<String> {
        let container = self.store.get_container(id).await?;
        let node = self.store.get_node(&container.nodename).await?;
        let engine = self.engines.engine(&node).await?;
        self.deadline(
            self.global_timeout(),
            engine.exec(&container.id, cmd, envs, workdir),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use armada_common::SchedulerMode;
    use tokio_stream::StreamExt;

    use crate::testutil::{deploy_opts, seed_pod, test_cluster, test_node};

    #[tokio::test]
    async fn test_list_and_execute() {
        let (cluster, engine, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;

        let stream = cluster.create_container(deploy_opts("p1", 2)).await.unwrap();
        let created: Vec<_> = stream.collect().await;

        let listed = cluster.list_containers(Some("app"), None, None).await.unwrap();
        assert_eq!(listed.len(), 2);
        let listed = cluster.list_containers(Some("other"), None, None).await.unwrap();
        assert!(listed.is_empty());

        let id = &created[0].id;
        let cmd = vec!["env".to_string()];
        cluster.execute_container(id, &cmd, &[], "").await.unwrap();
        assert!(engine.execs().iter().any(|(cid, c)| cid == id && c == "env"));
    }
}
