mod args;
mod handlers;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    routing::{get, post, put},
    Router,
};
use clap::Parser;

use armada_cluster::{Cluster, DockerFactory, GitScm};
use armada_engine::{Network, NoopNetwork, PluginNetwork};
use armada_meta::{EtcdStore, Store};

use crate::args::Args;
use crate::state::AppState;

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/pods", post(handlers::add_pod).get(handlers::list_pods))
        .route(
            "/pods/{name}",
            get(handlers::get_pod).delete(handlers::remove_pod),
        )
        .route("/pods/{name}/resource", get(handlers::pod_resource))
        .route("/pods/{name}/nodes", get(handlers::list_pod_nodes))
        .route("/nodes", post(handlers::add_node))
        .route(
            "/nodes/{name}",
            get(handlers::get_node).delete(handlers::remove_node),
        )
        .route("/nodes/{name}/available", put(handlers::set_node_availability))
        .route("/containers", get(handlers::list_containers))
        .route("/containers/{id}", get(handlers::get_container))
        .route("/containers/{id}/exec", post(handlers::execute_container))
        .route("/containers/{id}/logs", get(handlers::container_logs))
        .route("/status/{appname}/{entrypoint}", get(handlers::watch_status))
        .route("/deploy", post(handlers::deploy))
        .route("/replace", post(handlers::replace))
        .route("/remove", post(handlers::remove))
        .route("/build", post(handlers::build))
        .route("/send", post(handlers::send))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    armada_common::telemetry::init_tracing("armada-gateway");

    let config = args.to_config();
    let kv = EtcdStore::connect(&config.etcd.endpoints).await?;
    tracing::info!(endpoints = ?config.etcd.endpoints, "connected to etcd");
    let store = Store::new(
        Arc::new(kv),
        &config.etcd.prefix,
        Duration::from_secs(config.lock_timeout),
    );

    let network: Arc<dyn Network> = match args.network_plugin.as_str() {
        "plugin" => Arc::new(PluginNetwork),
        "agent" => Arc::new(NoopNetwork::agent()),
        _ => Arc::new(NoopNetwork::none()),
    };
    let source = GitScm::from_config(&config.git);
    if source.is_none() {
        tracing::warn!("no scm configured, build-from-source API disabled");
    }

    let cluster = Cluster::new(
        config,
        store,
        network,
        Arc::new(DockerFactory::default()),
        source,
    );

    let app = router(AppState { cluster });
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(listen = %args.listen, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
