use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;

use armada_common::{ArmadaError, Result, SendFileMessage};
use armada_engine::Engine;

use crate::Cluster;

impl Cluster {
    /// Push files into running containers, one message per (container,
    /// path) pair. Containers are handled concurrently; paths within one
    /// container in sorted order.
    pub async fn send_file(
        &self,
        ids: Vec<String>,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<ReceiverStream<SendFileMessage>> {
        if ids.is_empty() || data.is_empty() {
            return Err(ArmadaError::BadCount(0));
        }

        let (tx, rx) = mpsc::channel(1);
        let cluster = self.clone();
        tokio::spawn(async move {
            let mut workers = JoinSet::new();
            for id in ids {
                let c = cluster.clone();
                let data = data.clone();
                let worker_tx = tx.clone();
                workers.spawn(async move {
                    c.send_to_container(&id, &data, &worker_tx).await;
                });
            }
            drop(tx);
            while workers.join_next().await.is_some() {}
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn send_to_container(
        &self,
        id: &str,
        data: &BTreeMap<String, Vec<u8>>,
        tx: &mpsc::Sender<SendFileMessage>,
    ) {
        let fail_all = |error: String| {
            data.keys()
                .map(|path| SendFileMessage {
                    id: id.to_string(),
                    path: path.clone(),
                    error: error.clone(),
                })
                .collect::<Vec<_>>()
        };

        let engine = match self.store.get_container(id).await {
            Ok(container) => match self.store.get_node(&container.nodename).await {
                Ok(node) => self.engines.engine(&node).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let engine = match engine {
            Ok(engine) => engine,
            Err(e) => {
                for msg in fail_all(e.to_string()) {
                    let _ = tx.send(msg).await;
                }
                return;
            }
        };

        for (path, content) in data {
            let mut msg = SendFileMessage {
                id: id.to_string(),
                path: path.clone(),
                error: String::new(),
            };
            if let Err(e) = self
                .deadline(
                    self.global_timeout(),
                    engine.copy_to(id, path, content, 0, 0, 0o755),
                )
                .await
            {
                msg.error = e.to_string();
            }
            if tx.send(msg).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    use armada_common::SchedulerMode;

    use crate::testutil::{deploy_opts, seed_pod, test_cluster, test_node};

    #[tokio::test]
    async fn test_send_file() {
        let (cluster, engine, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;

        let stream = cluster.create_container(deploy_opts("p1", 1)).await.unwrap();
        let created: Vec<_> = stream.collect().await;
        let id = created[0].id.clone();

        let mut data = BTreeMap::new();
        data.insert("/etc/app.conf".to_string(), b"key=value".to_vec());
        let stream = cluster.send_file(vec![id.clone()], data).await.unwrap();
        let msgs: Vec<_> = stream.collect().await;

        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].error.is_empty());
        assert_eq!(engine.file(&id, "/etc/app.conf").unwrap(), b"key=value");
    }

    #[tokio::test]
    async fn test_send_to_unknown_container() {
        let (cluster, _, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;

        let mut data = BTreeMap::new();
        data.insert("/tmp/x".to_string(), b"1".to_vec());
        let stream = cluster
            .send_file(vec!["ghost".to_string()], data)
            .await
            .unwrap();
        let msgs: Vec<_> = stream.collect().await;
        assert_eq!(msgs.len(), 1);
        assert!(!msgs[0].error.is_empty());
    }

    #[tokio::test]
    async fn test_send_copy_failure_is_per_path() {
        let (cluster, engine, store) = test_cluster();
        seed_pod(&store, "p1", SchedulerMode::Memory, &[test_node("a", "p1", 8)]).await;

        let stream = cluster.create_container(deploy_opts("p1", 1)).await.unwrap();
        let created: Vec<_> = stream.collect().await;
        let id = created[0].id.clone();

        engine.fail_nth("copy_to", 1);
        let mut data = BTreeMap::new();
        data.insert("/a".to_string(), b"1".to_vec());
        data.insert("/b".to_string(), b"2".to_vec());
        let stream = cluster.send_file(vec![id.clone()], data).await.unwrap();
        let msgs: Vec<_> = stream.collect().await;

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs.iter().filter(|m| m.error.is_empty()).count(), 1);
        assert!(engine.file(&id, "/b").is_some());
    }
}
