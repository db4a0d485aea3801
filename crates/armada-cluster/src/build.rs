use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use armada_common::{ArmadaError, BuildImageMessage, CpuMap, Result};
use armada_engine::Engine;
use armada_scheduler::random_node;

use crate::options::random_suffix;
use crate::Cluster;

/// What to bake: a base image, source to fetch, and the commands that turn
/// it into the application layer.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Application name; combined with the hub config into the image tag.
    pub name: String,
    /// Version part of the tag.
    pub tag: String,
    pub base: String,
    pub repo: String,
    pub version: String,
    /// Prebuilt artifacts; when given they replace the checked-out source.
    pub artifacts: Vec<String>,
    pub commands: Vec<String>,
    pub user: String,
    pub uid: u32,
}

impl Cluster {
    /// Build and push an application image on a random node of the build
    /// pod. The returned stream carries build output, push progress, and a
    /// terminal message whose `progress` holds the pushed tag.
    pub async fn build_image(
        &self,
        opts: BuildOptions,
    ) -> Result<ReceiverStream<BuildImageMessage>> {
        let build_pod = self.config.docker.build_pod.clone();
        if build_pod.is_empty() {
            return Err(ArmadaError::BuildFailed("no build pod configured".to_string()));
        }
        if opts.uid == 0 {
            return Err(ArmadaError::BuildFailed(
                "a build user id is required".to_string(),
            ));
        }

        let nodes = self
            .store
            .get_nodes(&build_pod, None, &HashMap::new(), false)
            .await?;
        let cpu_map: BTreeMap<String, CpuMap> =
            nodes.iter().map(|n| (n.name.clone(), n.cpu.clone())).collect();
        let picked = random_node(&cpu_map)?;
        let Some(node) = nodes.into_iter().find(|n| n.name == picked) else {
            return Err(ArmadaError::NoNodes);
        };
        let engine = self.engines.engine(&node).await?;
        tracing::info!(pod = %build_pod, node = %node.name, app = %opts.name, "building image");

        let build_dir = std::env::temp_dir().join(format!("armada-build-{}", random_suffix(8)));
        if let Err(e) = self.prepare_context(&opts, &build_dir).await {
            let _ = tokio::fs::remove_dir_all(&build_dir).await;
            return Err(e);
        }

        let tag = self.config.image_tag(&opts.name, &opts.tag);
        let build_stream = match engine.image_build(&build_dir, &tag).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&build_dir).await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut build_stream = build_stream;
            let mut failed = false;
            while let Some(msg) = build_stream.next().await {
                failed = failed || !msg.error.is_empty();
                if tx.send(msg).await.is_err() {
                    let _ = tokio::fs::remove_dir_all(&build_dir).await;
                    return;
                }
            }
            let _ = tokio::fs::remove_dir_all(&build_dir).await;
            if failed {
                return;
            }

            match engine.image_push(&tag).await {
                Ok(mut push_stream) => {
                    while let Some(msg) = push_stream.next().await {
                        failed = failed || !msg.error.is_empty();
                        if tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(BuildImageMessage {
                            id: tag.clone(),
                            error: e.to_string(),
                            ..Default::default()
                        })
                        .await;
                    return;
                }
            }
            if failed {
                return;
            }

            // the build node should not keep the pushed tag around
            if let Err(e) = engine.image_remove(&tag, false, true).await {
                tracing::debug!(image = %tag, error = %e, "pruning built image failed");
            }

            let _ = tx
                .send(BuildImageMessage {
                    status: "finished".to_string(),
                    progress: tag.clone(),
                    ..Default::default()
                })
                .await;
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn prepare_context(&self, opts: &BuildOptions, build_dir: &Path) -> Result<()> {
        let repo_dir = build_dir.join(repo_name(&opts.repo));
        tokio::fs::create_dir_all(&repo_dir)
            .await
            .map_err(|e| ArmadaError::BuildFailed(format!("creating build dir: {e}")))?;

        if !opts.repo.is_empty() {
            let Some(source) = &self.source else {
                return Err(ArmadaError::BuildFailed("no scm configured".to_string()));
            };
            // clone wants the target absent
            let _ = tokio::fs::remove_dir_all(&repo_dir).await;
            source
                .source_code(&opts.repo, &repo_dir, &opts.version)
                .await?;
            source.security(&repo_dir).await?;

            // artifacts replace source entirely so no history leaks into
            // the image
            if !opts.artifacts.is_empty() {
                tokio::fs::remove_dir_all(&repo_dir)
                    .await
                    .map_err(|e| ArmadaError::BuildFailed(format!("resetting build dir: {e}")))?;
                tokio::fs::create_dir_all(&repo_dir)
                    .await
                    .map_err(|e| ArmadaError::BuildFailed(format!("resetting build dir: {e}")))?;
                for artifact in &opts.artifacts {
                    source.artifact(artifact, &repo_dir).await?;
                }
            }
        }

        let dockerfile = make_dockerfile(opts, &repo_name(&opts.repo), &self.config.app_dir);
        tokio::fs::write(build_dir.join("Dockerfile"), dockerfile)
            .await
            .map_err(|e| ArmadaError::BuildFailed(format!("writing Dockerfile: {e}")))?;
        Ok(())
    }
}

fn repo_name(repo: &str) -> String {
    let trimmed = repo.trim_end_matches('/').trim_end_matches(".git");
    trimmed
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("src")
        .to_string()
}

fn make_dockerfile(opts: &BuildOptions, reponame: &str, app_dir: &str) -> String {
    let home = format!("{}/{}", app_dir.trim_end_matches('/'), opts.name);
    let user = if opts.user.is_empty() {
        opts.name.as_str()
    } else {
        opts.user.as_str()
    };

    let mut lines = vec![
        format!("FROM {}", opts.base),
        "ENV ERU 1".to_string(),
        format!("ADD {} {}", reponame, home),
        format!("WORKDIR {}", home),
        format!(
            "RUN useradd -u {} -d /nonexistent -s /sbin/nologin -U {}",
            opts.uid, user
        ),
        format!("RUN chown -R {} {}", opts.uid, home),
    ];
    if !opts.commands.is_empty() {
        lines.push(format!("RUN sh -c \"{}\"", opts.commands.join(" && ")));
    }
    lines.push(format!("USER {}", user));
    lines.push(String::new());
    lines.join("\n")
}
